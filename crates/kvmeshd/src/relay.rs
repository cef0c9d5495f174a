//! Relay mode: websocket fan-out until ctrl-c.

use anyhow::Result;
use kvmesh_core::config::RelayConfig;
use kvmesh_relay::RelayState;
use tracing::{info, warn};

pub async fn run(config: RelayConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|e| anyhow::anyhow!("relay bind {}: {e}", config.listen))?;

    let state = RelayState::new(config.room_capacity);
    kvmesh_relay::serve_until(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {e}");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await
}
