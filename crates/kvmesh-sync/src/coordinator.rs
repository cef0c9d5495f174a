//! Public handle to a running replica.

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

use kvmesh_core::{
    KvmeshError, KvmeshResult, PeerId, Subscription, SyncConfig, SyncStatus, TransportKind,
};
use kvmesh_transport::{
    BroadcastHub, LocalBroadcastTransport, PeerOptions, PeerTransport, SignalingConnector,
    SocketOptions, SocketTransport, Transport, WsSignaling,
};

use crate::actor::{Actor, Command};
use crate::conflict::{ConflictResolver, Resolver};
use crate::watchers::WatchCallback;

/// Cloneable handle to one replica.
///
/// Every clone talks to the same actor task. Once `dispose()` has run (or the
/// last handle is dropped) every operation fails with `KvmeshError::Disposed`.
#[derive(Clone)]
pub struct SyncCoordinator {
    id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("id", &self.id)
            .field("disposed", &self.commands.is_closed())
            .finish()
    }
}

impl SyncCoordinator {
    pub fn builder(config: SyncConfig) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            config,
            transports: None,
            hub: None,
            signaling: None,
            resolver: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.id
    }

    /// Set `key` locally, notify its watchers and broadcast a `state` message.
    pub async fn set(&self, key: impl Into<String>, value: Value) -> KvmeshResult<()> {
        let key = key.into();
        self.request(|reply| Command::Set { key, value, reply }).await
    }

    /// Apply several keys under one version and one `patch` message.
    pub async fn batch(&self, updates: Map<String, Value>) -> KvmeshResult<()> {
        self.request(|reply| Command::Batch { updates, reply }).await
    }

    /// Local value if present, else the last accepted remote value.
    ///
    /// A remote value that wins conflict resolution replaces the local one.
    pub async fn get(&self, key: &str) -> KvmeshResult<Option<Value>> {
        let key = key.to_string();
        self.request(|reply| Command::Get { key, reply }).await
    }

    /// Merged view of every known key.
    pub async fn snapshot(&self) -> KvmeshResult<Map<String, Value>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Call `callback(new, old)` whenever the merged value of `key` changes.
    pub async fn watch<F>(&self, key: impl Into<String>, callback: F) -> KvmeshResult<Subscription>
    where
        F: Fn(Option<&Value>, Option<&Value>) + Send + Sync + 'static,
    {
        let key = key.into();
        let callback: WatchCallback = Arc::new(callback);
        let watched = key.clone();
        let id = self
            .request(|reply| Command::Watch {
                key: watched,
                callback,
                reply,
            })
            .await?;

        let weak = self.commands.downgrade();
        Ok(Subscription::new(move || {
            if let Some(commands) = weak.upgrade() {
                let _ = commands.send(Command::Unwatch { key, id });
            }
        }))
    }

    /// Broadcast the whole local state. Returns once every connected transport
    /// has taken the message; calls made meanwhile share that broadcast.
    pub async fn sync(&self) -> KvmeshResult<()> {
        self.request(|reply| Command::Sync { reply }).await
    }

    pub async fn status(&self) -> KvmeshResult<SyncStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Status updates, published whenever any field changes. The stream
    /// closes when the coordinator is disposed.
    pub fn status_stream(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Disconnect every transport and drop all state and watchers.
    ///
    /// Terminal; disposing twice is a no-op.
    pub async fn dispose(&self) -> KvmeshResult<()> {
        match self.request(|reply| Command::Dispose { reply }).await {
            Ok(()) | Err(KvmeshError::Disposed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> KvmeshResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| KvmeshError::Disposed)?;
        response.await.map_err(|_| KvmeshError::Disposed)
    }
}

pub struct SyncCoordinatorBuilder {
    config: SyncConfig,
    transports: Option<Vec<Arc<dyn Transport>>>,
    hub: Option<BroadcastHub>,
    signaling: Option<Arc<dyn SignalingConnector>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl SyncCoordinatorBuilder {
    /// Use these transports instead of building them from `config.transports`.
    pub fn transports(mut self, transports: Vec<Arc<dyn Transport>>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Hub for broadcast transports. Without one, each coordinator gets a
    /// private hub and only ever hears itself.
    pub fn broadcast_hub(mut self, hub: BroadcastHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Signaling for peer transports, overriding `config.signaling_url`.
    pub fn signaling(mut self, connector: Arc<dyn SignalingConnector>) -> Self {
        self.signaling = Some(connector);
        self
    }

    /// Resolve conflicts with `resolver`, regardless of the configured strategy.
    pub fn resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, &Value, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Spawn the coordinator and start connecting its transports.
    ///
    /// Returns as soon as the actor is running; connection progress shows up
    /// in `status_stream()`.
    pub async fn start(self) -> KvmeshResult<SyncCoordinator> {
        let config = self.config;
        config.validate()?;
        let resolver = Resolver::new(config.strategy, self.resolver)?;
        let id = config
            .id
            .clone()
            .map(PeerId::new)
            .unwrap_or_else(PeerId::generate);

        let transports = match self.transports {
            Some(transports) => transports,
            None => build_transports(&config, &id, self.hub, self.signaling)?,
        };
        let kinds: Vec<TransportKind> = transports.iter().map(|t| t.kind()).collect();

        let (commands, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SyncStatus::default());
        info!(
            peer = %id,
            room = %config.room(),
            transports = ?kinds,
            strategy = ?resolver.strategy(),
            "starting sync coordinator"
        );

        let mut actor = Actor::new(
            id.clone(),
            config,
            resolver,
            transports,
            commands.downgrade(),
            status_tx,
        );
        actor.start_connecting();
        tokio::spawn(actor.run(inbox));

        Ok(SyncCoordinator {
            id,
            commands,
            status,
        })
    }
}

/// One transport per entry in `config.transports`.
pub fn build_transports(
    config: &SyncConfig,
    id: &PeerId,
    hub: Option<BroadcastHub>,
    signaling: Option<Arc<dyn SignalingConnector>>,
) -> KvmeshResult<Vec<Arc<dyn Transport>>> {
    let hub = hub.unwrap_or_default();
    config
        .transports
        .iter()
        .map(|kind| -> KvmeshResult<Arc<dyn Transport>> {
            Ok(match kind {
                TransportKind::Broadcast => Arc::new(LocalBroadcastTransport::new(
                    Some(hub.clone()),
                    config.room(),
                )),
                TransportKind::Socket => Arc::new(SocketTransport::new(
                    id.clone(),
                    SocketOptions::from_config(config)?,
                )),
                TransportKind::Peer => {
                    let connector: Arc<dyn SignalingConnector> =
                        match (&signaling, &config.signaling_url) {
                            (Some(connector), _) => connector.clone(),
                            (None, Some(url)) => Arc::new(WsSignaling::new(url.clone())),
                            (None, None) => {
                                return Err(KvmeshError::Config(
                                    "peer transport requires signaling_url".into(),
                                ))
                            }
                        };
                    Arc::new(PeerTransport::new(
                        id.clone(),
                        connector,
                        PeerOptions::from_config(config),
                    ))
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvmesh_core::ConflictStrategy;
    use kvmesh_transport::LocalSignaling;

    fn local_only() -> SyncConfig {
        SyncConfig {
            transports: vec![],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_transports_from_config() {
        let config = SyncConfig {
            transports: vec![TransportKind::Broadcast, TransportKind::Socket, TransportKind::Peer],
            socket_url: Some("ws://127.0.0.1:1/ws".into()),
            ..Default::default()
        };
        let signaling: Arc<dyn SignalingConnector> = Arc::new(LocalSignaling::new());
        let built =
            build_transports(&config, &PeerId::from("p"), None, Some(signaling)).unwrap();
        let kinds: Vec<TransportKind> = built.iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, config.transports);
    }

    #[test]
    fn test_peer_without_signaling_rejected() {
        let config = SyncConfig {
            transports: vec![TransportKind::Peer],
            ..Default::default()
        };
        let err = build_transports(&config, &PeerId::from("p"), None, None).err();
        assert!(matches!(err, Some(KvmeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_configured_id_is_used() {
        let c = SyncCoordinator::builder(SyncConfig {
            id: Some("fixed".into()),
            ..local_only()
        })
        .start()
        .await
        .unwrap();
        assert_eq!(c.peer_id().as_str(), "fixed");
        c.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_strategy_needs_resolver() {
        let config = SyncConfig {
            strategy: ConflictStrategy::Custom,
            ..local_only()
        };
        let err = SyncCoordinator::builder(config.clone()).start().await.err();
        assert!(matches!(err, Some(KvmeshError::Config(_))));

        let c = SyncCoordinator::builder(config)
            .resolver(|_, _, remote| Ok(remote.clone()))
            .start()
            .await
            .unwrap();
        c.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_actor() {
        let c = SyncCoordinator::builder(local_only()).start().await.unwrap();
        let mut status = c.status_stream();
        drop(c);
        // the actor disposes itself and drops the status sender
        let closed = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while status.changed().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok());
    }
}
