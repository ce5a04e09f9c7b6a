use std::{path::PathBuf, time::Instant};

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use futures::StreamExt;
use philipsairplus::{
    config::DeviceConfig,
    logging,
    protocol::{
        codec::{FrameCodec, RxFrame},
        fields,
    },
    transport::{AirControl, Transport},
};
use tokio_util::codec::FramedRead;
use url::Url;

/// Print every report a device streams, until the stream ends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// coap://host[:port] URL of the device
    device: Url,

    /// Path to the aircontrol script
    #[arg(long)]
    script: PathBuf,

    /// Also print buffer echoes
    #[arg(long)]
    echoes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(false)?;

    let device = DeviceConfig::from_url(&args.device)?;
    let transport = AirControl::new(&args.script, device);

    let subscription = transport.subscribe().context("opening report stream")?;
    let mut frames = FramedRead::new(subscription.reader, FrameCodec::new());

    let start_time = Instant::now();

    while let Some(frame) = frames.next().await {
        let elapsed = start_time.elapsed().as_millis();

        match frame? {
            RxFrame::Report(report) => {
                let line = report
                    .iter()
                    .map(|(code, value)| {
                        let field = format!("{code}={value}");
                        let field = if fields::is_known(code) {
                            field.bright_white()
                        } else {
                            field.dimmed()
                        };
                        field.to_string()
                    })
                    .collect::<Vec<_>>()
                    .join(" ");

                println!("[{elapsed:8}] {}", line.on_blue());
            }
            RxFrame::Echo if args.echoes => println!("[{elapsed:8}] {}", "buffer echo".on_black()),
            RxFrame::Echo => (),
            RxFrame::Malformed(err) => println!("[{elapsed:8}] {}", err.to_string().on_red().bright_white()),
        }
    }

    println!("stream ended");
    subscription.handle.close().await?;

    Ok(())
}
