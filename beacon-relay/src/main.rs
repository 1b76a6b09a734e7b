//! Beacon relay: standalone WebSocket relay for presence hubs.
//!
//! Binds `BEACON_RELAY_ADDR` (or `0.0.0.0:$PORT`, default `127.0.0.1:5000`)
//! and relays events between connected hubs until Ctrl-C.

use beacon_hub::error::RelayError;
use beacon_hub::server::{RelayConfig, RelayServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!("Starting Beacon relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    server.run_until(shutdown_signal()).await?;

    let stats = server.stats();
    info!(
        "Relay stopped: {} connections served, {} events relayed, {} departures, {} frames lagged",
        stats.total_connections, stats.relayed_events, stats.departures, stats.lagged_frames
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl-C, relay will run until killed: {e}");
        std::future::pending::<()>().await;
    }
}
