use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber. `RUST_LOG` wins over `debug`.
pub fn init(debug: bool) -> Result<()> {
    let default = if debug {
        format!("info,{}=debug", env!("CARGO_CRATE_NAME"))
    } else {
        Level::INFO.to_string()
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
