//! Same-process room fan-out.
//!
//! A `BroadcastHub` is the platform channel primitive: one `tokio::sync::broadcast`
//! channel per room. Every `LocalBroadcastTransport` connected to the same hub
//! and room sees every message sent to that room, including its own.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kvmesh_core::{
    ConnectionState, KvmeshError, KvmeshResult, Subscription, SyncMessage, TransportKind,
};

use crate::transport::{EventListener, MessageListener, Transport, TransportCore, TransportEvent};

const DEFAULT_ROOM_CAPACITY: usize = 256;

/// Registry of broadcast rooms, shared by cloning.
#[derive(Clone)]
pub struct BroadcastHub {
    rooms: Arc<Mutex<HashMap<String, broadcast::Sender<SyncMessage>>>>,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ROOM_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` is how many messages a slow subscriber may fall behind.
    pub fn with_capacity(capacity: usize) -> Self {
        BroadcastHub {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to `room`, creating it on first use.
    ///
    /// The receiver is created under the registry lock so a concurrent join
    /// cannot prune the room in between.
    pub fn join(
        &self,
        room: &str,
    ) -> (broadcast::Sender<SyncMessage>, broadcast::Receiver<SyncMessage>) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        // drop rooms nobody listens to any more
        rooms.retain(|_, tx| tx.receiver_count() > 0);
        let tx = rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let rx = tx.subscribe();
        (tx, rx)
    }

    /// Number of subscribers currently in `room`.
    pub fn subscribers(&self, room: &str) -> usize {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

struct Session {
    tx: broadcast::Sender<SyncMessage>,
    task: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Transport over a `BroadcastHub` room. No handshake, no reconnection.
pub struct LocalBroadcastTransport {
    core: Arc<TransportCore>,
    hub: Option<BroadcastHub>,
    room: String,
    session: Mutex<Option<Session>>,
}

impl LocalBroadcastTransport {
    /// A `None` hub models a platform without the channel primitive:
    /// `connect()` then fails permanently.
    pub fn new(hub: Option<BroadcastHub>, room: impl Into<String>) -> Self {
        LocalBroadcastTransport {
            core: TransportCore::new(TransportKind::Broadcast),
            hub,
            room: room.into(),
            session: Mutex::new(None),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }
}

#[async_trait]
impl Transport for LocalBroadcastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    async fn connect(&self) -> KvmeshResult<()> {
        let Some(hub) = &self.hub else {
            let reason = "broadcast channel primitive unavailable".to_string();
            self.core.set_state(ConnectionState::Failed);
            self.core.emit(TransportEvent::Fatal(reason.clone()));
            return Err(KvmeshError::Unavailable(reason));
        };

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = hub.join(&self.room);
        let core = self.core.clone();
        let room = self.room.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => core.deliver(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(room = %room, skipped, "broadcast subscriber lagged, messages lost");
                        core.emit(TransportEvent::Error(format!(
                            "lagged behind room {room} by {skipped} messages"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *session = Some(Session { tx, task });
        drop(session);

        debug!(room = %self.room, "broadcast transport connected");
        self.core.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> KvmeshResult<()> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(session);
        if self.core.state() != ConnectionState::Failed {
            self.core.set_state(ConnectionState::Disconnected);
        }
        Ok(())
    }

    async fn send(&self, message: &SyncMessage) -> KvmeshResult<()> {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = session.as_ref() else {
            return Err(KvmeshError::NotConnected);
        };
        session
            .tx
            .send(message.clone())
            .map(|_| ())
            .map_err(|_| KvmeshError::Transport(format!("room {} has no subscribers", self.room)))
    }

    fn on_message(&self, listener: MessageListener) -> Subscription {
        self.core.on_message(listener)
    }

    fn on_event(&self, listener: EventListener) -> Subscription {
        self.core.on_event(listener)
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvmesh_core::{MessageType, PeerId};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn message(source: &str, n: u64) -> SyncMessage {
        SyncMessage::new(
            format!("{source}-{n}"),
            MessageType::State,
            PeerId::from(source),
            json!({"key": "k", "value": n}),
            n,
        )
    }

    fn collect(transport: &LocalBroadcastTransport) -> (Subscription, mpsc::UnboundedReceiver<SyncMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = transport.on_message(Arc::new(move |m| {
            let _ = tx.send(m);
        }));
        (sub, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) -> SyncMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_same_room_exchange_in_order() {
        let hub = BroadcastHub::new();
        let a = LocalBroadcastTransport::new(Some(hub.clone()), "room");
        let b = LocalBroadcastTransport::new(Some(hub.clone()), "room");
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let (_sub, mut rx) = collect(&b);

        for n in 1..=3 {
            a.send(&message("a", n)).await.unwrap();
        }
        for n in 1..=3 {
            assert_eq!(next(&mut rx).await.version, n);
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = BroadcastHub::new();
        let a = LocalBroadcastTransport::new(Some(hub.clone()), "one");
        let b = LocalBroadcastTransport::new(Some(hub.clone()), "two");
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let (_sub, mut rx) = collect(&b);

        a.send(&message("a", 1)).await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err(), "message leaked across rooms");
    }

    #[tokio::test]
    async fn test_connect_without_hub_fails_permanently() {
        let t = LocalBroadcastTransport::new(None, "room");
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, KvmeshError::Unavailable(_)));
        assert_eq!(t.state(), ConnectionState::Failed);
        assert!(t.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let hub = BroadcastHub::new();
        let t = LocalBroadcastTransport::new(Some(hub.clone()), "room");
        t.connect().await.unwrap();
        t.connect().await.unwrap();
        assert_eq!(hub.subscribers("room"), 1);
        assert!(t.is_connected());
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let hub = BroadcastHub::new();
        let t = LocalBroadcastTransport::new(Some(hub), "room");
        t.connect().await.unwrap();
        t.disconnect().await.unwrap();
        assert!(matches!(
            t.send(&message("a", 1)).await,
            Err(KvmeshError::NotConnected)
        ));
        assert_eq!(t.state(), ConnectionState::Disconnected);
    }
}
