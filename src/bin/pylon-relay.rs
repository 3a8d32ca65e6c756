//! Standalone relay process.
//!
//! Pure UDP forwarding per the relay wire protocol; it exposes no
//! application-level API. Configuration comes from environment variables so
//! the process stays a single static binary:
//!
//! - `PYLON_RELAY_PORT`: shared control/data port (default 47700)
//! - `PYLON_RELAY_PORT_BASE`: first dedicated forwarding port
//! - `PYLON_RELAY_PORT_COUNT`: dedicated port pool size
//! - `PYLON_RELAY_MAX_SERVERS`: global registration cap
//! - `RUST_LOG`: log filter (default `info`)

use std::str::FromStr;

use tracing::info;
use tracing_subscriber::EnvFilter;

use pylon_protocol::core::PylonError;
use pylon_protocol::relay::{RelayConfig, RelayService};

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), PylonError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let defaults = RelayConfig::default();
    let config = RelayConfig {
        shared_port: env_or("PYLON_RELAY_PORT", defaults.shared_port),
        port_base: env_or("PYLON_RELAY_PORT_BASE", defaults.port_base),
        port_count: env_or("PYLON_RELAY_PORT_COUNT", defaults.port_count),
        max_registrations: env_or("PYLON_RELAY_MAX_SERVERS", defaults.max_registrations),
        ..defaults
    };
    info!(
        shared_port = config.shared_port,
        port_base = config.port_base,
        port_count = config.port_count,
        max_registrations = config.max_registrations,
        "starting relay"
    );

    let service = RelayService::bind(config).await?;
    service.run().await?;
    Ok(())
}
