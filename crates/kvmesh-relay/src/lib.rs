//! kvmesh-relay: room-scoped websocket fan-out
//!
//! Routes:
//!   GET /ws/{room}      - sync traffic; heartbeats are acked by the relay
//!   GET /signal/{room}  - peer signaling, forwarded verbatim
//!   GET /metrics        - Prometheus text format
//!   GET /healthz        - liveness probe
//!
//! Every text frame is fanned out to the other connections in the same room.
//! A connection never receives its own frames.

pub mod metrics;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use prometheus_client::registry::Registry;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use kvmesh_core::{MessageType, PeerId, SyncMessage};

pub use metrics::RelayMetrics;

/// Which route a connection came in on; rooms are separate per route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    Sync,
    Signal,
}

/// Frame tagged with the connection that produced it.
type Frame = (u64, String);

#[derive(Clone)]
pub struct RelayState {
    rooms: Arc<Mutex<HashMap<(Channel, String), broadcast::Sender<Frame>>>>,
    room_capacity: usize,
    next_conn: Arc<AtomicU64>,
    acks: Arc<AtomicU64>,
    pub metrics: RelayMetrics,
    pub registry: Arc<Registry>,
}

impl RelayState {
    pub fn new(room_capacity: usize) -> Self {
        let mut registry = Registry::default();
        let metrics = RelayMetrics::new(&mut registry);
        RelayState {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            room_capacity: room_capacity.max(1),
            next_conn: Arc::new(AtomicU64::new(1)),
            acks: Arc::new(AtomicU64::new(0)),
            metrics,
            registry: Arc::new(registry),
        }
    }

    /// Subscribe to a room, creating it on first use. Rooms without
    /// subscribers are pruned under the same lock.
    fn join(
        &self,
        channel: Channel,
        room: &str,
    ) -> (broadcast::Sender<Frame>, broadcast::Receiver<Frame>) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.retain(|_, tx| tx.receiver_count() > 0);
        let tx = rooms
            .entry((channel, room.to_string()))
            .or_insert_with(|| broadcast::channel(self.room_capacity).0)
            .clone();
        let rx = tx.subscribe();
        (tx, rx)
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/ws/{room}", get(sync_handler))
        .route("/signal/{room}", get(signal_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/healthz", get(metrics::healthz_handler))
        .with_state(state)
}

/// Serve the relay on an already-bound listener until the server fails.
pub async fn serve(listener: TcpListener, state: RelayState) -> Result<()> {
    serve_until(listener, state, std::future::pending::<()>()).await
}

/// Like `serve`, stopping gracefully once `shutdown` resolves.
pub async fn serve_until(
    listener: TcpListener,
    state: RelayState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| anyhow::anyhow!("relay listener address: {e}"))?;
    info!(addr = %addr, "relay: listening on /ws, /signal, /metrics, /healthz");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("relay server: {e}"))
}

async fn sync_handler(
    State(state): State<RelayState>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, Channel::Sync, room, socket))
}

async fn signal_handler(
    State(state): State<RelayState>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, Channel::Signal, room, socket))
}

async fn handle_socket(state: RelayState, channel: Channel, room: String, socket: WebSocket) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (room_tx, mut room_rx) = state.join(channel, &room);
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<String>();
    let (mut sender, mut receiver) = socket.split();

    state.metrics.connections.inc();
    debug!(conn, room = %room, ?channel, "relay: client joined");

    let writer_room = room.clone();
    let writer = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                frame = room_rx.recv() => match frame {
                    Ok((from, _)) if from == conn => continue,
                    Ok((_, text)) => text,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(conn, room = %writer_room, skipped = n, "relay: client lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(text) = direct_rx.recv() => text,
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let text = text.to_string();
                if channel == Channel::Sync {
                    if let Some(ack) = heartbeat_ack(&state, &text) {
                        let _ = direct_tx.send(ack);
                        state.metrics.heartbeats_acked.inc();
                    }
                }
                // no other subscribers is fine, the frame just has nowhere to go
                let _ = room_tx.send((conn, text));
                state.metrics.frames_forwarded.inc();
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, error = %e, "relay: read failed");
                break;
            }
        }
    }

    writer.abort();
    state.metrics.connections.dec();
    debug!(conn, room = %room, "relay: client left");
}

/// Serialized ack if `text` is a heartbeat message.
fn heartbeat_ack(state: &RelayState, text: &str) -> Option<String> {
    let message = SyncMessage::from_json(text).ok()?;
    if message.kind != MessageType::Heartbeat {
        return None;
    }
    let n = state.acks.fetch_add(1, Ordering::Relaxed) + 1;
    let ack = SyncMessage::new(
        format!("relay-{n}"),
        MessageType::Ack,
        PeerId::from("relay"),
        json!({ "heartbeat": message.id }),
        0,
    );
    ack.to_json().ok()
}
