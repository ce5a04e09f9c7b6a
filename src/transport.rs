use std::{path::PathBuf, process::Stdio, time::Duration};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStderr, Command},
};
use tracing::{debug, Instrument, Span};

use crate::{
    command::{self, CommandResult},
    config::DeviceConfig,
    error::{Error, Result},
};

/// A discrete request to the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Poll the full device state.
    Status,
    /// Write raw `field=value` pairs without waiting for the device.
    Set(Vec<(String, i64)>),
}

/// The long-lived report stream of one device.
pub struct Subscription {
    /// Newline-delimited JSON reports. Reaching EOF ends the subscription.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: Box<dyn SubscriptionHandle>,
}

pub trait SubscriptionHandle: Send {
    /// Stop the stream and release whatever produces it. Closing a stream
    /// that has already ended is a no-op.
    fn close(self: Box<Self>) -> BoxFuture<'static, std::io::Result<()>>;
}

/// How a session talks to its device.
pub trait Transport: Send + Sync + 'static {
    fn request(&self, request: Request, timeout: Duration) -> BoxFuture<'_, Result<CommandResult>>;

    /// Open a new report stream. A subscription is not restartable once it
    /// ends; call `subscribe` again instead.
    fn subscribe(&self) -> Result<Subscription>;
}

/// Drives the device through the external `aircontrol` script, one process
/// per request plus one long-running `status-observe` process per
/// subscription.
#[derive(Clone, Debug)]
pub struct AirControl {
    interpreter: String,
    interpreter_args: Vec<String>,
    script: PathBuf,
    device: DeviceConfig,
}

impl AirControl {
    pub fn new(script: impl Into<PathBuf>, device: DeviceConfig) -> Self {
        AirControl {
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-u".to_string()],
            script: script.into(),
            device,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>, args: Vec<String>) -> Self {
        self.interpreter = interpreter.into();
        self.interpreter_args = args;
        self
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![self.interpreter.clone()];
        args.extend(self.interpreter_args.iter().cloned());
        args.extend([
            self.script.display().to_string(),
            "-H".to_string(),
            self.device.host.clone(),
            "-P".to_string(),
            self.device.port.to_string(),
        ]);

        if self.device.debug {
            args.push("-D".to_string());
        }

        args
    }

    pub fn command_line(&self, request: &Request) -> Vec<String> {
        let mut args = self.base_args();

        match request {
            Request::Status => args.extend(["status".to_string(), "-J".to_string()]),
            Request::Set(values) => {
                args.push("set".to_string());
                args.extend(values.iter().map(|(field, value)| format!("{field}={value}")));
                args.push("-I".to_string());
            }
        }

        args
    }

    pub fn observe_command_line(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(["status-observe".to_string(), "-J".to_string()]);
        args
    }
}

impl Transport for AirControl {
    fn request(&self, request: Request, timeout: Duration) -> BoxFuture<'_, Result<CommandResult>> {
        let args = self.command_line(&request);
        Box::pin(async move { command::execute(&args, timeout).await })
    }

    fn subscribe(&self) -> Result<Subscription> {
        let args = self.observe_command_line();
        debug!("Starting poll: {}", args.join(" "));

        let spawn_failed = |source: std::io::Error| Error::SpawnFailed {
            program: self.interpreter.clone(),
            source,
        };

        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failed)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            spawn_failed(std::io::Error::new(std::io::ErrorKind::Other, "stdout not captured"))
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr).instrument(Span::current()));
        }

        Ok(Subscription {
            reader: Box::new(stdout),
            handle: Box::new(ProcessHandle { child }),
        })
    }
}

/// stderr of the stream process is diagnostic text only. It must be drained
/// until EOF whatever it contains.
async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).split(b'\n');

    loop {
        match lines.next_segment().await {
            Ok(Some(line)) => {
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!("stderr: {line}");
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!("stderr unreadable: {err}");
                break;
            }
        }
    }
}

struct ProcessHandle {
    child: Child,
}

impl SubscriptionHandle for ProcessHandle {
    fn close(self: Box<Self>) -> BoxFuture<'static, std::io::Result<()>> {
        let mut child = self.child;

        Box::pin(async move {
            match child.try_wait()? {
                Some(status) => debug!("stream process already exited: {status}"),
                None => {
                    debug!("Killing stream process");
                    child.kill().await?;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(debug: bool) -> AirControl {
        let mut device = DeviceConfig::new("192.168.1.20");
        device.debug = debug;
        AirControl::new("/opt/lib/pyaircontrol.py", device)
    }

    #[test]
    fn test_status_command_line() {
        assert_eq!(
            transport(false).command_line(&Request::Status),
            ["python3", "-u", "/opt/lib/pyaircontrol.py", "-H", "192.168.1.20", "-P", "5683", "status", "-J"]
        );
    }

    #[test]
    fn test_set_command_line() {
        let request = Request::Set(vec![("D03102".to_string(), 1), ("D03130".to_string(), 100)]);

        assert_eq!(
            transport(true).command_line(&request),
            [
                "python3",
                "-u",
                "/opt/lib/pyaircontrol.py",
                "-H",
                "192.168.1.20",
                "-P",
                "5683",
                "-D",
                "set",
                "D03102=1",
                "D03130=100",
                "-I"
            ]
        );
    }

    #[test]
    fn test_observe_command_line() {
        let transport = transport(false).with_interpreter("sh", vec![]);

        assert_eq!(
            transport.observe_command_line(),
            ["sh", "/opt/lib/pyaircontrol.py", "-H", "192.168.1.20", "-P", "5683", "status-observe", "-J"]
        );
    }
}
