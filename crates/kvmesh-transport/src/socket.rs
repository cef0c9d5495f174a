//! Reconnecting websocket transport through a relay.
//!
//! A supervisor task owns the connection and walks the state machine
//! `Disconnected -> Connecting -> Connected -> Disconnected`. While connected
//! it runs one session: a reader, a writer fed by an mpsc queue, and a
//! heartbeat ticker whose acks feed `TransportEvent::Latency`. Unexpected
//! closes go through `Backoff`; running out of attempts is terminal.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kvmesh_core::{
    AckPayload, ConnectionState, KvmeshError, KvmeshResult, MessageType, PeerId, Subscription,
    SyncConfig, SyncMessage, TransportKind,
};

use crate::backoff::Backoff;
use crate::transport::{EventListener, MessageListener, Transport, TransportCore, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Relay endpoint without the room segment, e.g. `ws://127.0.0.1:8787/ws`
    pub url: String,
    pub room: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl SocketOptions {
    pub fn new(url: impl Into<String>) -> Self {
        SocketOptions {
            url: url.into(),
            room: None,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }

    pub fn from_config(config: &SyncConfig) -> KvmeshResult<Self> {
        let url = config
            .socket_url
            .clone()
            .ok_or_else(|| KvmeshError::Config("socket transport requires socket_url".into()))?;
        Ok(SocketOptions {
            url,
            room: Some(config.room().to_string()),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        })
    }

    /// Full URL including the room segment.
    pub fn endpoint(&self) -> String {
        match &self.room {
            Some(room) => format!("{}/{}", self.url.trim_end_matches('/'), room),
            None => self.url.clone(),
        }
    }
}

struct Shared {
    core: Arc<TransportCore>,
    id: PeerId,
    options: SocketOptions,
    /// Outbound queue of the live session, if any.
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    heartbeats: AtomicU64,
}

impl Shared {
    fn set_writer(&self, writer: Option<mpsc::UnboundedSender<Message>>) {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = writer;
    }
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct SocketTransport {
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

impl SocketTransport {
    /// `id` is stamped as the source of heartbeat messages.
    pub fn new(id: PeerId, options: SocketOptions) -> Self {
        SocketTransport {
            shared: Arc::new(Shared {
                core: TransportCore::new(TransportKind::Socket),
                id,
                options,
                writer: Mutex::new(None),
                heartbeats: AtomicU64::new(0),
            }),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    pub fn options(&self) -> &SocketOptions {
        &self.shared.options
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    /// Starts the supervisor and waits for the first open attempt. A failed
    /// first attempt is returned but reconnection continues in the background.
    async fn connect(&self) -> KvmeshResult<()> {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(running) = supervisor.as_ref() {
            if !running.task.is_finished() {
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(self.shared.clone(), cancel.clone(), first_tx));
        *supervisor = Some(Supervisor { cancel, task });
        drop(supervisor);

        first_rx
            .await
            .unwrap_or_else(|_| Err(KvmeshError::Transport("connect cancelled".into())))
    }

    async fn disconnect(&self) -> KvmeshResult<()> {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(mut supervisor) = supervisor {
            supervisor.cancel.cancel();
            let _ = (&mut supervisor.task).await;
        }
        self.shared.set_writer(None);
        if self.shared.core.state() != ConnectionState::Failed {
            self.shared.core.set_state(ConnectionState::Disconnected);
        }
        Ok(())
    }

    async fn send(&self, message: &SyncMessage) -> KvmeshResult<()> {
        if self.shared.core.state() != ConnectionState::Connected {
            return Err(KvmeshError::NotConnected);
        }
        let json = message.to_json()?;
        let writer = self.shared.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.as_ref() {
            Some(tx) => tx
                .send(Message::Text(json.into()))
                .map_err(|_| KvmeshError::NotConnected),
            None => Err(KvmeshError::NotConnected),
        }
    }

    fn on_message(&self, listener: MessageListener) -> Subscription {
        self.shared.core.on_message(listener)
    }

    fn on_event(&self, listener: EventListener) -> Subscription {
        self.shared.core.on_event(listener)
    }

    fn state(&self) -> ConnectionState {
        self.shared.core.state()
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

async fn supervise(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    first: oneshot::Sender<KvmeshResult<()>>,
) {
    let endpoint = shared.options.endpoint();
    let mut backoff = Backoff::new(
        shared.options.reconnect_delay,
        shared.options.max_reconnect_attempts,
    );
    let mut first = Some(first);

    loop {
        shared.core.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = tokio_tungstenite::connect_async(endpoint.as_str()) => opened,
        };

        match opened {
            Ok((ws, _)) => {
                backoff.reset();
                info!(endpoint = %endpoint, "socket transport connected");
                // writer goes in first so `Connected` listeners can send
                let (tx, rx) = mpsc::unbounded_channel::<Message>();
                shared.set_writer(Some(tx));
                shared.core.set_state(ConnectionState::Connected);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }

                let outcome = run_session(&shared, ws, rx, &cancel).await;
                shared.set_writer(None);
                if cancel.is_cancelled() {
                    return;
                }
                let reason = match outcome {
                    Ok(()) => "closed by relay".to_string(),
                    Err(e) => e.to_string(),
                };
                warn!(endpoint = %endpoint, reason = %reason, "socket closed unexpectedly");
                shared.core.set_state(ConnectionState::Disconnected);
                shared.core.emit(TransportEvent::Error(reason));
            }
            Err(e) => {
                let reason = format!("connecting to {endpoint}: {e}");
                warn!(attempt = backoff.attempt(), "{reason}");
                shared.core.set_state(ConnectionState::Disconnected);
                shared.core.emit(TransportEvent::Error(reason.clone()));
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(KvmeshError::Transport(reason)));
                }
            }
        }

        match backoff.next_delay() {
            Some(delay) => {
                info!(
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling socket reconnect"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                let reason = format!(
                    "giving up on {endpoint} after {} reconnect attempts",
                    shared.options.max_reconnect_attempts
                );
                error!("{reason}");
                shared.core.set_state(ConnectionState::Failed);
                shared.core.emit(TransportEvent::Fatal(reason));
                return;
            }
        }
    }
}

/// Pump one websocket session until it closes or `cancel` fires.
///
/// Returns `Ok(())` for an orderly close from either side.
async fn run_session(
    shared: &Shared,
    ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: &CancellationToken,
) -> KvmeshResult<()> {
    let (mut sink, mut stream) = ws.split();

    let interval = shared.options.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut outstanding: Option<(String, Instant)> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            Some(frame) = rx.recv() => {
                sink.send(frame)
                    .await
                    .map_err(|e| KvmeshError::Transport(format!("writing frame: {e}")))?;
            }
            _ = ticker.tick() => {
                let n = shared.heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
                let heartbeat = SyncMessage::new(
                    format!("{}-hb-{n}", shared.id),
                    MessageType::Heartbeat,
                    shared.id.clone(),
                    json!({}),
                    0,
                );
                outstanding = Some((heartbeat.id.clone(), Instant::now()));
                sink.send(Message::Text(heartbeat.to_json()?.into()))
                    .await
                    .map_err(|e| KvmeshError::Transport(format!("writing heartbeat: {e}")))?;
            }
            frame = stream.next() => match frame {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(e)) => return Err(KvmeshError::Transport(format!("reading frame: {e}"))),
                Some(Ok(Message::Text(text))) => match SyncMessage::from_json(text.as_str()) {
                    Ok(message) => {
                        if let Some(rtt) = heartbeat_ack(&message, &mut outstanding) {
                            debug!(rtt_ms = rtt.as_millis() as u64, "heartbeat acked");
                            shared.core.emit(TransportEvent::Latency(rtt));
                            continue;
                        }
                        shared.core.deliver(message);
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping unparsable socket frame");
                        shared.core.emit(TransportEvent::Error(format!("unparsable frame: {e}")));
                    }
                },
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Round-trip time if `message` acknowledges the outstanding heartbeat.
fn heartbeat_ack(
    message: &SyncMessage,
    outstanding: &mut Option<(String, Instant)>,
) -> Option<Duration> {
    if message.kind != MessageType::Ack {
        return None;
    }
    let acked = message.payload::<AckPayload>().ok()?.heartbeat?;
    match outstanding.take() {
        Some((id, sent)) if id == acked => Some(sent.elapsed()),
        other => {
            *outstanding = other;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_room() {
        let mut options = SocketOptions::new("ws://relay:8787/ws/");
        assert_eq!(options.endpoint(), "ws://relay:8787/ws/");
        options.room = Some("board".into());
        assert_eq!(options.endpoint(), "ws://relay:8787/ws/board");
    }

    #[test]
    fn test_options_from_config() {
        let config = SyncConfig {
            socket_url: Some("ws://localhost:9000/ws".into()),
            room_id: Some("r".into()),
            heartbeat_interval_ms: 500,
            reconnect_delay_ms: 20,
            max_reconnect_attempts: 2,
            ..Default::default()
        };
        let options = SocketOptions::from_config(&config).unwrap();
        assert_eq!(options.endpoint(), "ws://localhost:9000/ws/r");
        assert_eq!(options.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(options.reconnect_delay, Duration::from_millis(20));
        assert_eq!(options.max_reconnect_attempts, 2);

        let missing = SyncConfig::default();
        assert!(matches!(
            SocketOptions::from_config(&missing),
            Err(KvmeshError::Config(_))
        ));
    }

    #[test]
    fn test_heartbeat_ack_matches_outstanding_only() {
        let ack = |id: &str| {
            SyncMessage::new(
                "relay-1",
                MessageType::Ack,
                PeerId::from("relay"),
                json!({ "heartbeat": id }),
                0,
            )
        };
        let mut outstanding = Some(("p-hb-2".to_string(), Instant::now()));

        assert!(heartbeat_ack(&ack("p-hb-1"), &mut outstanding).is_none());
        assert!(outstanding.is_some());
        assert!(heartbeat_ack(&ack("p-hb-2"), &mut outstanding).is_some());
        assert!(outstanding.is_none());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let t = SocketTransport::new(PeerId::from("p"), SocketOptions::new("ws://127.0.0.1:1/ws"));
        let msg = SyncMessage::new("p-1", MessageType::State, PeerId::from("p"), json!({}), 1);
        assert!(matches!(t.send(&msg).await, Err(KvmeshError::NotConnected)));
    }
}
