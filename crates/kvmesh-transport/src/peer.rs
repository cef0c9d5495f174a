//! Direct peer link negotiated over a signaling channel.
//!
//! `connect()` opens a signaling session for the room, announces itself with
//! `hello` and pairs with the first foreign peer it hears from. The peer with
//! the lexicographically smaller id offers: it binds a TCP listener, sends
//! `offer` and `candidate`, then waits for the `answer` and the inbound dial.
//! The other side answers and dials the candidate address. Its first line on
//! the new stream is the session token so the offerer can match the dial to
//! the offer.
//!
//! Once open, the link carries newline-delimited JSON `SyncMessage`s.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use kvmesh_core::{
    now_millis, ConnectionState, KvmeshError, KvmeshResult, PeerId, Subscription, SyncConfig,
    SyncMessage, TransportKind,
};

use crate::signaling::{Signal, SignalingChannel, SignalingConnector};
use crate::transport::{EventListener, MessageListener, Transport, TransportCore, TransportEvent};

const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

type LineStream = Framed<TcpStream, LinesCodec>;

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub room: String,
    /// Address the offering side listens on
    pub bind_addr: String,
    /// Upper bound on the whole signaling handshake
    pub signaling_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            room: "default".into(),
            bind_addr: "127.0.0.1:0".into(),
            signaling_timeout: Duration::from_secs(10),
        }
    }
}

impl PeerOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            room: config.room().to_string(),
            bind_addr: config.peer_bind_addr.clone(),
            signaling_timeout: config.signaling_timeout(),
        }
    }
}

/// Open data path. Dropping it tears the link down.
struct Link {
    remote: PeerId,
    tx: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct PeerTransport {
    core: Arc<TransportCore>,
    id: PeerId,
    connector: Arc<dyn SignalingConnector>,
    options: PeerOptions,
    link: Mutex<Option<Link>>,
    connecting: tokio::sync::Mutex<()>,
    sessions: AtomicU64,
}

impl PeerTransport {
    pub fn new(id: PeerId, connector: Arc<dyn SignalingConnector>, options: PeerOptions) -> Self {
        PeerTransport {
            core: TransportCore::new(TransportKind::Peer),
            id,
            connector,
            options,
            link: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            sessions: AtomicU64::new(0),
        }
    }

    /// Id of the peer on the other end of the open link.
    pub fn remote(&self) -> Option<PeerId> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|link| link.remote.clone())
    }

    async fn handshake(&self) -> KvmeshResult<(PeerId, LineStream)> {
        let mut channel = self.connector.open(&self.options.room).await?;
        let result = self.negotiate(channel.as_mut()).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "closing signaling channel");
        }
        result
    }

    async fn negotiate(
        &self,
        channel: &mut dyn SignalingChannel,
    ) -> KvmeshResult<(PeerId, LineStream)> {
        channel.send(&Signal::Hello { from: self.id.clone() }).await?;
        let mut reannounced = false;

        loop {
            let signal = next_signal(channel, &self.id).await?;
            match signal {
                Signal::Hello { from } => {
                    if !reannounced {
                        channel.send(&Signal::Hello { from: self.id.clone() }).await?;
                        reannounced = true;
                    }
                    if self.id < from {
                        let stream = self.offer(channel, &from).await?;
                        return Ok((from, stream));
                    }
                }
                Signal::Offer { from, session, .. } => {
                    let stream = self.answer(channel, &from, session).await?;
                    return Ok((from, stream));
                }
                other => debug!(signal = ?other, "ignoring out-of-order signal"),
            }
        }
    }

    async fn offer(
        &self,
        channel: &mut dyn SignalingChannel,
        remote: &PeerId,
    ) -> KvmeshResult<LineStream> {
        let listener = TcpListener::bind(&self.options.bind_addr).await?;
        let addr = listener.local_addr()?;
        let n = self.sessions.fetch_add(1, Ordering::Relaxed);
        let session = format!("{}-{}-{n}", self.id, now_millis());
        debug!(remote = %remote, addr = %addr, "offering peer link");

        channel
            .send(&Signal::Offer {
                from: self.id.clone(),
                to: remote.clone(),
                session: session.clone(),
            })
            .await?;
        channel
            .send(&Signal::Candidate {
                from: self.id.clone(),
                to: remote.clone(),
                addr: addr.to_string(),
            })
            .await?;

        loop {
            match next_signal(channel, &self.id).await? {
                Signal::Answer { from, session: answered, .. }
                    if &from == remote && answered == session =>
                {
                    break
                }
                other => debug!(signal = ?other, "waiting for answer"),
            }
        }

        let (stream, dialer) = listener.accept().await?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        match framed.next().await {
            Some(Ok(token)) if token == session => {
                debug!(remote = %remote, dialer = %dialer, "peer link accepted");
                Ok(framed)
            }
            Some(Ok(_)) => Err(KvmeshError::Signaling(format!(
                "dial from {dialer} presented the wrong session"
            ))),
            Some(Err(e)) => Err(KvmeshError::Signaling(format!("reading session token: {e}"))),
            None => Err(KvmeshError::Signaling(format!(
                "dial from {dialer} closed before the session token"
            ))),
        }
    }

    async fn answer(
        &self,
        channel: &mut dyn SignalingChannel,
        remote: &PeerId,
        session: String,
    ) -> KvmeshResult<LineStream> {
        debug!(remote = %remote, "answering peer offer");
        channel
            .send(&Signal::Answer {
                from: self.id.clone(),
                to: remote.clone(),
                session: session.clone(),
            })
            .await?;

        let addr = loop {
            match next_signal(channel, &self.id).await? {
                Signal::Candidate { from, addr, .. } if &from == remote => break addr,
                other => debug!(signal = ?other, "waiting for candidate"),
            }
        };
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| KvmeshError::Signaling(format!("bad candidate address {addr}: {e}")))?;

        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        framed
            .send(session)
            .await
            .map_err(|e| KvmeshError::Signaling(format!("sending session token: {e}")))?;
        Ok(framed)
    }

    /// Spawn the link tasks. The reader stays parked until `opened` fires so
    /// a remote close can never be reported before `Connected`.
    fn open_link(&self, remote: PeerId, stream: LineStream) -> (Link, oneshot::Sender<()>) {
        let (sink, lines) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (opened, ready) = oneshot::channel();
        let reader = tokio::spawn(read_lines(self.core.clone(), remote.clone(), lines, ready));
        let writer = tokio::spawn(write_lines(sink, rx));
        let link = Link {
            remote,
            tx,
            reader,
            writer,
        };
        (link, opened)
    }
}

/// Next signal from another peer addressed to `me` or to the whole room.
async fn next_signal(channel: &mut dyn SignalingChannel, me: &PeerId) -> KvmeshResult<Signal> {
    loop {
        let signal = channel
            .recv()
            .await?
            .ok_or_else(|| KvmeshError::Signaling("signaling channel closed".into()))?;
        if signal.sender() == me {
            continue;
        }
        if signal.recipient().is_some_and(|to| to != me) {
            continue;
        }
        return Ok(signal);
    }
}

async fn read_lines(
    core: Arc<TransportCore>,
    remote: PeerId,
    mut lines: SplitStream<LineStream>,
    ready: oneshot::Receiver<()>,
) {
    if ready.await.is_err() {
        return;
    }
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => match SyncMessage::from_json(&line) {
                Ok(message) => core.deliver(message),
                Err(e) => {
                    warn!(remote = %remote, error = %e, "dropping malformed peer message");
                    core.emit(TransportEvent::Error(format!("malformed peer message: {e}")));
                }
            },
            Err(e) => {
                warn!(remote = %remote, error = %e, "peer link read failed");
                core.emit(TransportEvent::Error(format!("peer link read failed: {e}")));
                break;
            }
        }
    }
    info!(remote = %remote, "peer link closed");
    core.set_state(ConnectionState::Disconnected);
}

async fn write_lines(
    mut sink: SplitSink<LineStream, String>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            warn!(error = %e, "peer link write failed");
            break;
        }
    }
}

#[async_trait]
impl Transport for PeerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Peer
    }

    async fn connect(&self) -> KvmeshResult<()> {
        let _guard = self.connecting.lock().await;
        if self.core.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.core.set_state(ConnectionState::Connecting);

        let outcome = match tokio::time::timeout(self.options.signaling_timeout, self.handshake())
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(KvmeshError::Timeout(format!(
                "peer signaling in room {} after {:?}",
                self.options.room, self.options.signaling_timeout
            ))),
        };

        match outcome {
            Ok((remote, stream)) => {
                info!(remote = %remote, room = %self.options.room, "peer link open");
                let (link, opened) = self.open_link(remote, stream);
                *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
                self.core.set_state(ConnectionState::Connected);
                let _ = opened.send(());
                Ok(())
            }
            Err(e) => {
                warn!(room = %self.options.room, error = %e, "peer connect failed");
                self.core.set_state(ConnectionState::Disconnected);
                self.core.emit(TransportEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> KvmeshResult<()> {
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(link);
        self.core.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&self, message: &SyncMessage) -> KvmeshResult<()> {
        if self.core.state() != ConnectionState::Connected {
            return Err(KvmeshError::NotConnected);
        }
        let json = message.to_json()?;
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        match link.as_ref() {
            Some(link) => link.tx.send(json).map_err(|_| KvmeshError::NotConnected),
            None => Err(KvmeshError::NotConnected),
        }
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
