//! The coordinator's single writer.
//!
//! One task owns local state, remote state, the version counter, watchers and
//! the peer table. Handles, transport listeners and send pumps talk to it only
//! through `Command`s, so none of that state is ever shared.

use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use kvmesh_core::{
    now_millis, AckPayload, ConnectionState, KvmeshError, MessageType, PatchPayload, PeerId,
    StatePayload, Subscription, SyncConfig, SyncMessage, SyncPayload, SyncStatus,
};
use kvmesh_transport::{Transport, TransportEvent};

use crate::conflict::{Conflict, Resolver};
use crate::watchers::{WatchCallback, Watchers};

pub(crate) enum Command {
    Set {
        key: String,
        value: Value,
        reply: oneshot::Sender<()>,
    },
    Batch {
        updates: Map<String, Value>,
        reply: oneshot::Sender<()>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    Snapshot {
        reply: oneshot::Sender<Map<String, Value>>,
    },
    Watch {
        key: String,
        callback: WatchCallback,
        reply: oneshot::Sender<u64>,
    },
    Unwatch {
        key: String,
        id: u64,
    },
    Sync {
        reply: oneshot::Sender<()>,
    },
    SyncFlushed,
    Status {
        reply: oneshot::Sender<SyncStatus>,
    },
    Inbound {
        transport: usize,
        message: SyncMessage,
    },
    Event {
        transport: usize,
        event: TransportEvent,
    },
    SendFailed {
        transport: usize,
        error: KvmeshError,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// One queued send. `flushed` fires once the transport has taken the message.
struct Outbound {
    message: Arc<SyncMessage>,
    flushed: Option<oneshot::Sender<()>>,
}

struct Slot {
    transport: Arc<dyn Transport>,
    queue: mpsc::UnboundedSender<Outbound>,
    pump: JoinHandle<()>,
    connecting: Option<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
    ever_connected: bool,
}

pub(crate) struct Actor {
    id: PeerId,
    config: SyncConfig,
    resolver: Resolver,
    weak: mpsc::WeakUnboundedSender<Command>,
    status_tx: watch::Sender<SyncStatus>,

    local: HashMap<String, Value>,
    remote: HashMap<String, Value>,
    version: u64,
    sent: u64,
    watchers: Watchers,
    slots: Vec<Slot>,
    peers: HashMap<PeerId, Instant>,

    syncing: bool,
    sync_waiters: Vec<oneshot::Sender<()>>,
    last_sync: Option<i64>,
    errors: u64,
    latency: Duration,
}

impl Actor {
    pub(crate) fn new(
        id: PeerId,
        config: SyncConfig,
        resolver: Resolver,
        transports: Vec<Arc<dyn Transport>>,
        weak: mpsc::WeakUnboundedSender<Command>,
        status_tx: watch::Sender<SyncStatus>,
    ) -> Self {
        let slots = transports
            .into_iter()
            .enumerate()
            .map(|(index, transport)| attach(index, transport, &weak))
            .collect();

        Actor {
            id,
            config,
            resolver,
            weak,
            status_tx,
            local: HashMap::new(),
            remote: HashMap::new(),
            version: 0,
            sent: 0,
            watchers: Watchers::new(),
            slots,
            peers: HashMap::new(),
            syncing: false,
            sync_waiters: Vec::new(),
            last_sync: None,
            errors: 0,
            latency: Duration::ZERO,
        }
    }

    /// Kick off `connect()` on every transport without waiting for them.
    pub(crate) fn start_connecting(&mut self) {
        for slot in &mut self.slots {
            let transport = slot.transport.clone();
            slot.connecting = Some(tokio::spawn(async move {
                if let Err(e) = transport.connect().await {
                    debug!(transport = %transport.kind(), error = %e, "initial connect failed");
                }
            }));
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            if let Command::Dispose { reply } = command {
                self.dispose().await;
                let _ = reply.send(());
                return;
            }
            self.handle(command);
        }
        // every handle was dropped without an explicit dispose
        self.dispose().await;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Set { key, value, reply } => {
                self.set(key, value);
                let _ = reply.send(());
            }
            Command::Batch { updates, reply } => {
                self.batch(updates);
                let _ = reply.send(());
            }
            Command::Get { key, reply } => {
                let _ = reply.send(self.merged(&key).cloned());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Watch {
                key,
                callback,
                reply,
            } => {
                let _ = reply.send(self.watchers.add(key, callback));
            }
            Command::Unwatch { key, id } => self.watchers.remove(&key, id),
            Command::Sync { reply } => {
                self.sync_waiters.push(reply);
                if self.syncing {
                    debug!("sync already in flight, coalescing");
                } else {
                    self.start_sync();
                }
            }
            Command::SyncFlushed => self.sync_flushed(),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Inbound { transport, message } => self.on_inbound(transport, message),
            Command::Event { transport, event } => self.on_event(transport, event),
            Command::SendFailed { transport, error } => {
                let kind = self.slots.get(transport).map(|s| s.transport.kind());
                warn!(transport = ?kind, error = %error, "send failed");
                self.errors += 1;
                self.publish();
            }
            Command::Dispose { .. } => {}
        }
    }

    // ── Local operations ──────────────────────────────────────────────────────

    fn set(&mut self, key: String, value: Value) {
        let before = self.merged(&key).cloned();
        self.local.insert(key.clone(), value.clone());
        self.version += 1;

        let data = json!({ "key": key, "value": value, "previous": before });
        let message = self.next_message(MessageType::State, data);
        self.enqueue(message, false);

        if before.as_ref() != Some(&value) {
            self.watchers.notify(&key, Some(&value), before.as_ref());
        }
    }

    fn batch(&mut self, updates: Map<String, Value>) {
        if updates.is_empty() {
            return;
        }
        let mut changes = Vec::with_capacity(updates.len());
        for (key, value) in &updates {
            let before = self.merged(key).cloned();
            self.local.insert(key.clone(), value.clone());
            changes.push((key.clone(), before));
        }
        self.version += 1;

        let message = self.next_message(MessageType::Patch, json!({ "updates": updates }));
        self.enqueue(message, false);

        // every key is applied before the first watcher runs
        for (key, before) in changes {
            let after = self.local.get(&key);
            if after != before.as_ref() {
                self.watchers.notify(&key, after, before.as_ref());
            }
        }
    }

    fn start_sync(&mut self) {
        self.syncing = true;
        let state: Map<String, Value> = self
            .local
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        info!(keys = state.len(), "broadcasting full state");
        let message = self.next_message(MessageType::Sync, json!({ "state": state }));
        let flushed = self.enqueue(message, true);

        let weak = self.weak.clone();
        tokio::spawn(async move {
            join_all(flushed).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::SyncFlushed);
            }
        });
        self.publish();
    }

    fn sync_flushed(&mut self) {
        self.syncing = false;
        self.last_sync = Some(now_millis());
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.publish();
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    fn on_inbound(&mut self, transport: usize, message: SyncMessage) {
        if message.source == self.id {
            trace!(id = %message.id, "dropping own echo");
            return;
        }
        if let Err(e) = message.verify_checksum() {
            warn!(source = %message.source, error = %e, "dropping corrupted message");
            self.errors += 1;
            self.publish();
            return;
        }

        let outcome = match message.kind {
            MessageType::State => message.payload::<StatePayload>().map(|payload| {
                self.apply_remote(vec![(payload.key, payload.value)], message.version);
            }),
            MessageType::Patch => message.payload::<PatchPayload>().map(|payload| {
                self.apply_remote(payload.updates.into_iter().collect(), message.version);
            }),
            MessageType::Sync => message.payload::<SyncPayload>().map(|payload| {
                debug!(source = %message.source, keys = payload.state.len(), "applying full sync");
                self.apply_remote(payload.state.into_iter().collect(), message.version);
                self.last_sync = Some(now_millis());
                self.acknowledge(&message);
            }),
            MessageType::Ack => match message.payload::<AckPayload>() {
                // relay heartbeat acks the socket transport did not consume
                Ok(ack) if ack.heartbeat.is_some() => return,
                Ok(ack) => {
                    if ack.target.as_ref() == Some(&self.id) {
                        debug!(source = %message.source, ack = ?ack.ack, "sync acknowledged");
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MessageType::Heartbeat => {
                let age = (now_millis() - message.timestamp).max(0) as u64;
                self.latency = Duration::from_millis(age);
                Ok(())
            }
            MessageType::Unknown => {
                debug!(id = %message.id, "ignoring message of unknown type");
                return;
            }
        };

        match outcome {
            Ok(()) => {
                self.peers.insert(message.source.clone(), Instant::now());
            }
            Err(e) => {
                warn!(
                    transport,
                    source = %message.source,
                    kind = %message.kind,
                    error = %e,
                    "dropping malformed message"
                );
                self.errors += 1;
            }
        }
        self.publish();
    }

    /// Resolve each incoming value against local state and notify watchers
    /// of every key whose merged value changed.
    fn apply_remote(&mut self, updates: Vec<(String, Value)>, remote_version: u64) {
        let mut changes = Vec::new();
        for (key, incoming) in updates {
            let before = self.merged(&key).cloned();
            let resolved = self.resolver.resolve(&Conflict {
                key: &key,
                local: self.local.get(&key),
                remote: &incoming,
                local_version: self.version,
                remote_version,
            });
            if let Some(local) = self.local.get_mut(&key) {
                *local = resolved.clone();
            }
            self.remote.insert(key.clone(), resolved);

            let after = self.merged(&key).cloned();
            if after != before {
                trace!(key = %key, "remote change accepted");
                changes.push((key, after, before));
            }
        }
        for (key, after, before) in &changes {
            self.watchers.notify(key, after.as_ref(), before.as_ref());
        }
    }

    fn acknowledge(&mut self, sync: &SyncMessage) {
        let data = json!({ "target": sync.source, "ack": sync.id });
        let ack = self.next_message(MessageType::Ack, data);
        self.enqueue(ack, false);
    }

    fn on_event(&mut self, transport: usize, event: TransportEvent) {
        let Some(slot) = self.slots.get_mut(transport) else {
            return;
        };
        let kind = slot.transport.kind();
        match event {
            TransportEvent::StateChanged(ConnectionState::Connected) => {
                let reconnected = slot.ever_connected;
                slot.ever_connected = true;
                info!(transport = %kind, reconnected, "transport connected");
                if reconnected && !self.syncing {
                    self.start_sync();
                }
            }
            TransportEvent::StateChanged(state) => {
                debug!(transport = %kind, ?state, "transport state changed");
            }
            TransportEvent::Error(reason) => {
                warn!(transport = %kind, reason = %reason, "transport error");
                self.errors += 1;
            }
            TransportEvent::Fatal(reason) => {
                error!(transport = %kind, reason = %reason, "transport gave up");
                self.errors += 1;
            }
            TransportEvent::Latency(rtt) => self.latency = rtt,
        }
        self.publish();
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn merged(&self, key: &str) -> Option<&Value> {
        self.local.get(key).or_else(|| self.remote.get(key))
    }

    fn snapshot(&self) -> Map<String, Value> {
        let mut merged: Map<String, Value> = self
            .remote
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &self.local {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    fn next_message(&mut self, kind: MessageType, data: Value) -> SyncMessage {
        self.sent += 1;
        SyncMessage::new(
            format!("{}-{}", self.id, self.sent),
            kind,
            self.id.clone(),
            data,
            self.version,
        )
    }

    /// Queue `message` on every connected transport. With `track`, returns
    /// one receiver per queued copy that resolves once it was handed over.
    fn enqueue(&self, message: SyncMessage, track: bool) -> Vec<oneshot::Receiver<()>> {
        let message = Arc::new(message);
        let mut flushed = Vec::new();
        for slot in self.slots.iter().filter(|s| s.transport.is_connected()) {
            let (tx, rx) = if track {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            let queued = slot.queue.send(Outbound {
                message: message.clone(),
                flushed: tx,
            });
            if let (Ok(()), Some(rx)) = (queued, rx) {
                flushed.push(rx);
            }
        }
        flushed
    }

    fn status(&mut self) -> SyncStatus {
        let window = self.config.peer_timeout();
        self.peers.retain(|_, seen| seen.elapsed() <= window);
        SyncStatus {
            connected: self.slots.iter().any(|s| s.transport.is_connected()),
            syncing: self.syncing,
            last_sync: self.last_sync,
            peers: self.peers.len(),
            errors: self.errors,
            latency: self.latency,
        }
    }

    fn publish(&mut self) {
        let next = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn dispose(&mut self) {
        info!(peer = %self.id, "disposing coordinator");
        for slot in &mut self.slots {
            for subscription in slot.subscriptions.drain(..) {
                subscription.unsubscribe();
            }
            if let Some(connecting) = slot.connecting.take() {
                connecting.abort();
            }
        }

        let disconnects = self.slots.iter().map(|slot| {
            let transport = slot.transport.clone();
            async move { (transport.kind(), transport.disconnect().await) }
        });
        for (kind, result) in join_all(disconnects).await {
            if let Err(e) = result {
                warn!(transport = %kind, error = %e, "disconnect failed");
            }
        }
        for slot in self.slots.drain(..) {
            slot.pump.abort();
        }

        self.local.clear();
        self.remote.clear();
        self.watchers.clear();
        self.peers.clear();
        self.sync_waiters.clear();
        self.syncing = false;
        self.publish();
    }
}

/// Register listeners on `transport` and start its send pump.
fn attach(
    index: usize,
    transport: Arc<dyn Transport>,
    weak: &mpsc::WeakUnboundedSender<Command>,
) -> Slot {
    let messages = {
        let weak = weak.clone();
        transport.on_message(Arc::new(move |message| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::Inbound {
                    transport: index,
                    message,
                });
            }
        }))
    };
    let events = {
        let weak = weak.clone();
        transport.on_event(Arc::new(move |event| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::Event {
                    transport: index,
                    event,
                });
            }
        }))
    };

    let (queue, outbound) = mpsc::unbounded_channel();
    let pump = tokio::spawn(drain_queue(index, transport.clone(), outbound, weak.clone()));

    Slot {
        transport,
        queue,
        pump,
        connecting: None,
        subscriptions: vec![messages, events],
        ever_connected: false,
    }
}

/// Drain one transport's send queue in order. Failures go back to the actor.
async fn drain_queue(
    index: usize,
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    weak: mpsc::WeakUnboundedSender<Command>,
) {
    while let Some(Outbound { message, flushed }) = outbound.recv().await {
        if let Err(error) = transport.send(&message).await {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::SendFailed {
                    transport: index,
                    error,
                });
            }
        }
        if let Some(flushed) = flushed {
            let _ = flushed.send(());
        }
    }
}
