//! kvmesh-core: wire messages, identities, config schema, and error types
//! shared by every kvmesh crate.

pub mod config;
pub mod error;
pub mod subscription;
pub mod types;

pub use config::{KvmeshConfig, SyncConfig};
pub use error::{KvmeshError, KvmeshResult};
pub use subscription::{Listener, Listeners, Subscription};
pub use types::{
    checksum_of, now_millis, AckPayload, ConflictStrategy, ConnectionState, MessageType,
    PatchPayload, PeerId, StatePayload, SyncMessage, SyncPayload, SyncStatus, TransportKind,
};
