use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use philipsairplus::{
    accessory::{Characteristic, HeaterCooler, Presentation, Service, Value},
    config::{DeviceConfig, SessionConfig},
    lifecycle::{self, Lifecycle},
    logging,
    session::Session,
    transport::AirControl,
};
use tracing::{error, info};
use url::Url;

/// Run Philips Air+ fan heaters as heater-cooler accessories until Ctrl-C.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Devices to run, one accessory each
    ///
    /// coap://host[:port][?debug=true&name=...&serial=...]
    #[arg(long = "device", required = true)]
    devices: Vec<Url>,

    /// Path to the aircontrol script
    #[arg(long)]
    script: PathBuf,

    /// Interpreter used to run the script
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Debug logging
    #[arg(short = 'D', long)]
    debug: bool,
}

/// Logs every property change instead of publishing it anywhere.
struct LogPresentation {
    accessory: String,
}

impl Presentation for LogPresentation {
    fn update(&self, service: Service, characteristic: Characteristic, value: Value) {
        info!(accessory = %self.accessory, "{service} {characteristic} = {value:?}");
    }

    fn remove(&self, service: Service, characteristic: Characteristic) {
        info!(accessory = %self.accessory, "{service} {characteristic} removed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(args.debug)?;

    let lifecycle = Lifecycle::new();
    let mut teardowns = Vec::new();

    for url in &args.devices {
        let mut device = DeviceConfig::from_url(url).with_context(|| format!("invalid device {url}"))?;
        device.debug |= args.debug;

        let transport = AirControl::new(&args.script, device.clone()).with_interpreter(&args.interpreter, vec!["-u".to_string()]);
        let presentation = LogPresentation {
            accessory: device.name.clone(),
        };
        let accessory = HeaterCooler::new(presentation, &device.serial_number);

        let session = Session::new(&device.name, transport, accessory, SessionConfig::default());

        if let Err(err) = session.start_session().await {
            error!(accessory = %device.name, "Failed to start: {err}");
        }

        teardowns.push(lifecycle::end_on_shutdown(session, lifecycle.listener()));
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");
    lifecycle.shutdown();

    for teardown in teardowns {
        teardown.await?;
    }

    Ok(())
}
