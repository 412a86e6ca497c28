//! Huddle relay: reference fan-out endpoint for local development.
//!
//! Reads `HUDDLE_BIND` and `HUDDLE_ROOM_CAPACITY`; logging follows `RUST_LOG`.

use log::info;

use huddle_collab::config::RelayConfig;
use huddle_collab::relay::Relay;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = RelayConfig::from_env()?;
    info!("Starting Huddle relay on {}...", config.bind_addr);

    let relay = Relay::new(config);
    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = relay.stats().await;
            info!(
                "Shutting down: {} connection(s), {} message(s), {} byte(s) relayed",
                stats.total_connections, stats.total_messages, stats.total_bytes
            );
        }
    }
    Ok(())
}
