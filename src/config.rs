use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

pub const DEFAULT_PORT: u16 = 5683;

/// Per-accessory device settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Display name used in logs until the device reports its own.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub serial_number: String,
}

impl DeviceConfig {
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();

        DeviceConfig {
            name: host.clone(),
            host,
            port: DEFAULT_PORT,
            debug: false,
            serial_number: "0000".to_string(),
        }
    }

    /// Parse a `coap://host[:port][?debug=true&name=...&serial=...]` URL.
    pub fn from_url(url: &Url) -> Result<Self> {
        match url.scheme() {
            "coap" => {
                let host = url
                    .host_str()
                    .with_context(|| format!("coap requires a host to be specified in the url: {url}"))?;

                let mut config = DeviceConfig::new(host);
                config.port = url.port().unwrap_or(DEFAULT_PORT);

                for (key, value) in url.query_pairs() {
                    match &*key {
                        "debug" => {
                            config.debug = value
                                .parse()
                                .with_context(|| format!("invalid debug flag {value:?} in url: {url}"))?
                        }
                        "name" => config.name = value.into_owned(),
                        "serial" => config.serial_number = value.into_owned(),
                        other => bail!("unknown option {other} in url: {url}"),
                    }
                }

                Ok(config)
            }
            other => {
                bail!("url scheme {other} not supported");
            }
        }
    }
}

/// Exponential backoff for restarting a crashed stream.
#[derive(Clone, Debug, PartialEq)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn disabled() -> Self {
        RestartPolicy {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before restart `attempt` (zero based): doubles per attempt up
    /// to `max_delay`, plus up to 10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let base = base.min(self.max_delay);
        base + base.mul_f64(rand::random::<f64>() * 0.1)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            enabled: true,
            max_attempts: None,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Deadline for the initial status poll.
    pub poll_timeout: Duration,
    /// Deadline for set commands.
    pub command_timeout: Duration,
    /// How long to wait for the stream to die after it is told to stop.
    pub termination_grace: Duration,
    pub restart: RestartPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            poll_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(60),
            termination_grace: Duration::from_secs(5),
            restart: RestartPolicy::default(),
        }
    }
}
