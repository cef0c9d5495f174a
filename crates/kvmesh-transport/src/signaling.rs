//! Signaling channels used to negotiate a peer link.
//!
//! A signaling channel is a short-lived, room-scoped control path. Peers
//! announce themselves with `hello`, then exchange `offer`, `answer` and
//! `candidate` messages until one side can dial the other directly.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use kvmesh_core::{KvmeshError, KvmeshResult, PeerId};

/// Control message exchanged while negotiating a peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Hello {
        from: PeerId,
    },
    Offer {
        from: PeerId,
        to: PeerId,
        session: String,
    },
    Answer {
        from: PeerId,
        to: PeerId,
        session: String,
    },
    Candidate {
        from: PeerId,
        to: PeerId,
        addr: String,
    },
}

impl Signal {
    pub fn sender(&self) -> &PeerId {
        match self {
            Signal::Hello { from }
            | Signal::Offer { from, .. }
            | Signal::Answer { from, .. }
            | Signal::Candidate { from, .. } => from,
        }
    }

    /// Addressee, `None` for room-wide announcements.
    pub fn recipient(&self) -> Option<&PeerId> {
        match self {
            Signal::Hello { .. } => None,
            Signal::Offer { to, .. } | Signal::Answer { to, .. } | Signal::Candidate { to, .. } => {
                Some(to)
            }
        }
    }
}

/// One open signaling session. Implementations do not echo a channel's own
/// sends back to it.
#[async_trait]
pub trait SignalingChannel: Send {
    async fn send(&mut self, signal: &Signal) -> KvmeshResult<()>;

    /// Next signal from another participant, `None` once the channel closed.
    async fn recv(&mut self) -> KvmeshResult<Option<Signal>>;

    async fn close(&mut self) -> KvmeshResult<()>;
}

/// Opens signaling sessions for a room.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn open(&self, room: &str) -> KvmeshResult<Box<dyn SignalingChannel>>;
}

// ── Websocket signaling via the relay ─────────────────────────────────────────

/// Signaling over the relay's `/signal/{room}` websocket endpoint.
#[derive(Debug, Clone)]
pub struct WsSignaling {
    base_url: String,
}

impl WsSignaling {
    /// `base_url` is the signaling endpoint without the room segment,
    /// e.g. `ws://127.0.0.1:8787/signal`.
    pub fn new(base_url: impl Into<String>) -> Self {
        WsSignaling {
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, room: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), room)
    }
}

#[async_trait]
impl SignalingConnector for WsSignaling {
    async fn open(&self, room: &str) -> KvmeshResult<Box<dyn SignalingChannel>> {
        let endpoint = self.endpoint(room);
        let (ws, _) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| KvmeshError::Signaling(format!("connecting to {endpoint}: {e}")))?;
        debug!(endpoint = %endpoint, "signaling channel open");
        Ok(Box::new(WsSignalingChannel { ws }))
    }
}

struct WsSignalingChannel {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&mut self, signal: &Signal) -> KvmeshResult<()> {
        let json = serde_json::to_string(signal)?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| KvmeshError::Signaling(format!("sending signal: {e}")))
    }

    async fn recv(&mut self) -> KvmeshResult<Option<Signal>> {
        while let Some(frame) = self.ws.next().await {
            let frame = frame.map_err(|e| KvmeshError::Signaling(format!("reading signal: {e}")))?;
            match frame {
                Message::Text(text) => match serde_json::from_str::<Signal>(text.as_str()) {
                    Ok(signal) => return Ok(Some(signal)),
                    Err(e) => warn!(error = %e, "dropping malformed signal"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> KvmeshResult<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| KvmeshError::Signaling(format!("closing signaling channel: {e}")))
    }
}

// ── In-process signaling ──────────────────────────────────────────────────────

type RoomSender = broadcast::Sender<(u64, Signal)>;

/// Room-scoped in-process signaling, for peers living in the same process.
#[derive(Clone, Default)]
pub struct LocalSignaling {
    rooms: Arc<Mutex<HashMap<String, RoomSender>>>,
    next_channel: Arc<AtomicU64>,
}

impl LocalSignaling {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingConnector for LocalSignaling {
    async fn open(&self, room: &str) -> KvmeshResult<Box<dyn SignalingChannel>> {
        let tx = {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            rooms
                .entry(room.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .clone()
        };
        let rx = tx.subscribe();
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(LocalSignalingChannel { id, tx, rx }))
    }
}

struct LocalSignalingChannel {
    id: u64,
    tx: RoomSender,
    rx: broadcast::Receiver<(u64, Signal)>,
}

#[async_trait]
impl SignalingChannel for LocalSignalingChannel {
    async fn send(&mut self, signal: &Signal) -> KvmeshResult<()> {
        // an empty room is not an error, the other side may not have joined yet
        let _ = self.tx.send((self.id, signal.clone()));
        Ok(())
    }

    async fn recv(&mut self) -> KvmeshResult<Option<Signal>> {
        loop {
            match self.rx.recv().await {
                Ok((sender, _)) if sender == self.id => continue,
                Ok((_, signal)) => return Ok(Some(signal)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "signaling channel lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> KvmeshResult<()> {
        Ok(())
    }
}
