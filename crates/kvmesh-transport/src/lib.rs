//! kvmesh-transport: the `Transport` contract and its three implementations
//!
//! - `broadcast` - same-process room fan-out over a shared `BroadcastHub`
//! - `socket`    - websocket through a relay, with heartbeat and exponential backoff
//! - `peer`      - direct TCP link negotiated over a signaling channel
//!
//! Transports never interpret message contents; they only move `SyncMessage`s
//! and report connection state through `TransportEvent`s.

pub mod backoff;
pub mod broadcast;
pub mod peer;
pub mod signaling;
pub mod socket;
pub mod transport;

pub use backoff::Backoff;
pub use broadcast::{BroadcastHub, LocalBroadcastTransport};
pub use peer::{PeerOptions, PeerTransport};
pub use signaling::{
    LocalSignaling, Signal, SignalingChannel, SignalingConnector, WsSignaling,
};
pub use socket::{SocketOptions, SocketTransport};
pub use transport::{EventListener, MessageListener, Transport, TransportCore, TransportEvent};
