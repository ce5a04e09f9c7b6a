use std::{process::Stdio, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    protocol::{
        codec::{FrameCodec, RxFrame},
        state::Report,
    },
};

/// Output of one discrete command.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResult {
    pub output: Bytes,

    /// The last report in the output, if any. Status polls and set
    /// confirmations report the device's full state.
    pub snapshot: Option<Report>,
}

impl CommandResult {
    pub fn from_output(output: impl Into<Bytes>) -> Self {
        let output = output.into();
        let mut snapshot = None;

        for frame in FrameCodec::decode_all(&output) {
            match frame {
                RxFrame::Report(report) => snapshot = Some(report),
                RxFrame::Echo => (),
                RxFrame::Malformed(err) => warn!("dropping command output: {err}"),
            }
        }

        CommandResult { output, snapshot }
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Run `args` (program first) to completion and decode its output.
///
/// The process is killed if it outlives `timeout`. Commands are independent
/// of each other; nothing serialises concurrent executions.
pub async fn execute(args: &[String], timeout: Duration) -> Result<CommandResult> {
    let Some((program, program_args)) = args.split_first() else {
        return Err(Error::SpawnFailed {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
        });
    };

    debug!("CMD: {}", args.join(" "));

    let mut child = Command::new(program)
        .args(program_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::SpawnFailed {
            program: program.clone(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let outcome = tokio::time::timeout(timeout, async {
        let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
        let status = child.wait().await;
        (status, stdout, stderr)
    })
    .await;

    let (status, stdout, stderr) = match outcome {
        Ok(outcome) => outcome,
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!("failed to kill timed out command: {err}");
            }
            return Err(Error::CommandTimeout(timeout));
        }
    };

    let stderr = String::from_utf8_lossy(&stderr.unwrap_or_default()).trim().to_string();

    match status {
        Ok(status) if status.success() => {
            let stdout = stdout.map_err(|err| Error::CommandFailed {
                status: status.code(),
                stderr: err.to_string(),
            })?;

            if !stdout.is_empty() {
                debug!("CMD response: {}", String::from_utf8_lossy(&stdout).trim());
            }

            Ok(CommandResult::from_output(stdout))
        }
        Ok(status) => Err(Error::CommandFailed {
            status: status.code(),
            stderr,
        }),
        Err(err) => Err(Error::CommandFailed {
            status: None,
            stderr: err.to_string(),
        }),
    }
}
