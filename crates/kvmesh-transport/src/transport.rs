//! The transport contract shared by every channel implementation.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use kvmesh_core::{ConnectionState, KvmeshResult, Listeners, Subscription, SyncMessage, TransportKind};

/// Out-of-band notifications a transport raises besides messages.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Recoverable problem (failed open, dropped frame, lag)
    Error(String),
    /// The transport gave up and will not recover on its own
    Fatal(String),
    /// Measured heartbeat round-trip
    Latency(Duration),
}

pub type MessageListener = Arc<dyn Fn(SyncMessage) + Send + Sync>;
pub type EventListener = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// One communication channel.
///
/// `connect` is idempotent, `send` fails with `NotConnected` instead of
/// queueing, and every received message reaches each registered listener
/// exactly once, in arrival order.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self) -> KvmeshResult<()>;

    async fn disconnect(&self) -> KvmeshResult<()>;

    async fn send(&self, message: &SyncMessage) -> KvmeshResult<()>;

    fn on_message(&self, listener: MessageListener) -> Subscription;

    fn on_event(&self, listener: EventListener) -> Subscription;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// State and listener bookkeeping common to all transports.
///
/// I/O tasks hold an `Arc<TransportCore>` and push inbound messages and
/// state transitions through it.
pub struct TransportCore {
    kind: TransportKind,
    state: Mutex<ConnectionState>,
    messages: Listeners<SyncMessage>,
    events: Listeners<TransportEvent>,
}

impl TransportCore {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(TransportCore {
            kind,
            state: Mutex::new(ConnectionState::Disconnected),
            messages: Listeners::new(),
            events: Listeners::new(),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, emitting `StateChanged` only on an actual transition.
    pub fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            debug!(transport = %self.kind, state = ?next, "transport state changed");
            self.events.emit(TransportEvent::StateChanged(next));
        }
    }

    pub fn deliver(&self, message: SyncMessage) {
        self.messages.emit(message);
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    pub fn on_message(&self, listener: MessageListener) -> Subscription {
        self.messages.add(listener)
    }

    pub fn on_event(&self, listener: EventListener) -> Subscription {
        self.events.add(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_state_emits_only_on_change() {
        let core = TransportCore::new(TransportKind::Broadcast);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = core.on_event(Arc::new(move |e| s.lock().unwrap().push(e)));

        core.set_state(ConnectionState::Connecting);
        core.set_state(ConnectionState::Connecting);
        core.set_state(ConnectionState::Connected);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TransportEvent::StateChanged(ConnectionState::Connecting),
                TransportEvent::StateChanged(ConnectionState::Connected),
            ]
        );
        assert_eq!(core.state(), ConnectionState::Connected);
    }
}
