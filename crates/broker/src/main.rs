//! Broker entry point.
//!
//! Usage: `wsmux-broker [-s <server_queue_bytes>] [-l <level>]`
//!
//! Exits 0 on clean shutdown, nonzero when another live broker already owns
//! the shared queues or a segment cannot be created.

use anyhow::Result;
use broker::{Broker, BrokerConfig, BrokerError};
use common::Error as IpcError;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match BrokerConfig::parse(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    // RUST_LOG wins; -l supplies the default.
    let default_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("starting wsmux broker");

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([127, 0, 0, 1], port))
            .install()?;
        info!(port, "prometheus exporter listening");
    }

    let broker = match Broker::new(&config) {
        Ok(broker) => broker,
        Err(BrokerError::Ipc(IpcError::OwnerContended(pid))) => {
            error!(owner = pid, "another broker is already running");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "broker startup failed");
            std::process::exit(1);
        }
    };

    broker.run().await?;
    info!("wsmux broker exit");
    Ok(())
}
