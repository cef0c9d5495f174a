//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness probe (always 200 if process is running)

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

use crate::RelayState;

#[derive(Clone, Default)]
pub struct RelayMetrics {
    pub connections: Gauge,
    pub frames_forwarded: Counter,
    pub heartbeats_acked: Counter,
}

impl RelayMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "kvmesh_relay_connections",
            "Open websocket connections across all rooms",
            metrics.connections.clone(),
        );
        // the text encoder appends `_total` to counters
        registry.register(
            "kvmesh_relay_frames_forwarded",
            "Text frames fanned out to a room",
            metrics.frames_forwarded.clone(),
        );
        registry.register(
            "kvmesh_relay_heartbeats_acked",
            "Heartbeats answered directly by the relay",
            metrics.heartbeats_acked.clone(),
        );
        metrics
    }
}

pub(crate) async fn metrics_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
pub(crate) async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
