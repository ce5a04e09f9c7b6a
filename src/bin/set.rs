use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use philipsairplus::{
    config::DeviceConfig,
    logging,
    protocol::{setting::Setting, state::DeviceState},
    transport::{AirControl, Request, Transport},
};
use url::Url;

/// Send settings to a device, e.g. `set coap://10.0.0.5 D03102=1 D03105=0`
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// coap://host[:port] URL of the device
    device: Url,

    /// `field=value` settings to send
    #[arg(required = true)]
    settings: Vec<Setting>,

    /// Path to the aircontrol script
    #[arg(long)]
    script: PathBuf,

    /// Seconds to wait for the command
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(false)?;

    let device = DeviceConfig::from_url(&args.device)?;
    let transport = AirControl::new(&args.script, device);

    let values = args
        .settings
        .iter()
        .map(|setting| (setting.field().to_string(), setting.raw_value()))
        .collect();

    let result = transport
        .request(Request::Set(values), Duration::from_secs(args.timeout))
        .await
        .context("sending settings")?;

    match result.snapshot {
        Some(report) => match DeviceState::from_full(&report) {
            Ok(state) => println!("{state}"),
            Err(_) => println!("{}", serde_json::Value::Object(report)),
        },
        None => println!("Sent {} setting(s), no confirmation", args.settings.len()),
    }

    Ok(())
}
