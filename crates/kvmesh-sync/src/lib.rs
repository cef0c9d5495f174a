//! kvmesh-sync: the coordinator that keeps one replica's key-value state in
//! step with its peers over any mix of transports.

mod actor;
pub mod conflict;
pub mod coordinator;
pub mod watchers;

pub use conflict::{last_write_wins, shallow_merge, Conflict, ConflictResolver, Resolver};
pub use coordinator::{build_transports, SyncCoordinator, SyncCoordinatorBuilder};
pub use watchers::WatchCallback;
