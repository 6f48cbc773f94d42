//! Broker configuration: CLI flags plus environment.
//!
//! Flags follow the launcher contract: `-s <bytes>` sizes the server→client
//! ring, `-l <level>` picks the log level. Everything else comes from the
//! environment with code defaults.

use crate::error::{BrokerError, Result};
use common::{DEFAULT_PREFIX, DEFAULT_SERVER_QUEUE_SIZE};
use std::env;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Prefix for the named shared objects.
    pub prefix: String,
    /// Server→client ring size in bytes.
    pub server_queue_size: u32,
    /// Log level from `-l`, if given.
    pub log_level: Option<String>,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            server_queue_size: DEFAULT_SERVER_QUEUE_SIZE,
            log_level: None,
            metrics_port: None,
        }
    }
}

impl BrokerConfig {
    /// Parse `-s`/`-l` from `args` (without argv[0]) and pick up
    /// `WSMUX_PREFIX` / `METRICS_PORT` from the environment.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut config = BrokerConfig::default();

        let mut it = args.iter();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "-s" => {
                    let value = it
                        .next()
                        .ok_or_else(|| BrokerError::InvalidArgs("-s needs a byte count".into()))?;
                    config.server_queue_size = value.parse().map_err(|_| {
                        BrokerError::InvalidArgs(format!("bad -s value '{value}'"))
                    })?;
                }
                "-l" => {
                    let value = it
                        .next()
                        .ok_or_else(|| BrokerError::InvalidArgs("-l needs a level".into()))?;
                    config.log_level = Some(parse_level(value)?);
                }
                other => {
                    return Err(BrokerError::InvalidArgs(format!(
                        "unknown argument '{other}'"
                    )))
                }
            }
        }

        if let Ok(prefix) = env::var("WSMUX_PREFIX") {
            if !prefix.is_empty() {
                config.prefix = prefix;
            }
        }
        if let Ok(port) = env::var("METRICS_PORT") {
            config.metrics_port = Some(port.parse().map_err(|_| {
                BrokerError::InvalidArgs(format!("bad METRICS_PORT '{port}'"))
            })?);
        }

        Ok(config)
    }
}

/// Map the launcher's level names onto tracing filter directives.
fn parse_level(level: &str) -> Result<String> {
    let mapped = match level.to_ascii_lowercase().as_str() {
        "off" => "off",
        // tracing has no critical; error is the closest severity.
        "critical" | "error" => "error",
        "warning" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        other => {
            return Err(BrokerError::InvalidArgs(format!(
                "unknown log level '{other}'"
            )))
        }
    };
    Ok(mapped.to_string())
}
