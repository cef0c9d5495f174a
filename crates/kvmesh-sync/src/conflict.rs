//! Version-based conflict resolution between a local and an incoming value.
//!
//! The version counter only orders one peer's own writes, so last-write-wins
//! here is an approximation rather than a causal order.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use kvmesh_core::{ConflictStrategy, KvmeshError, KvmeshResult};

/// Caller-supplied resolution, taking precedence over the configured strategy.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, key: &str, local: &Value, remote: &Value) -> anyhow::Result<Value>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&str, &Value, &Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn resolve(&self, key: &str, local: &Value, remote: &Value) -> anyhow::Result<Value> {
        self(key, local, remote)
    }
}

/// One key whose incoming value has to be reconciled with local state.
#[derive(Debug, Clone, Copy)]
pub struct Conflict<'a> {
    pub key: &'a str,
    pub local: Option<&'a Value>,
    pub remote: &'a Value,
    /// This peer's version counter
    pub local_version: u64,
    /// `version` of the incoming message
    pub remote_version: u64,
}

#[derive(Clone)]
pub struct Resolver {
    strategy: ConflictStrategy,
    custom: Option<Arc<dyn ConflictResolver>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("strategy", &self.strategy)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl Resolver {
    /// The `custom` strategy requires a resolver function.
    pub fn new(
        strategy: ConflictStrategy,
        custom: Option<Arc<dyn ConflictResolver>>,
    ) -> KvmeshResult<Self> {
        if strategy == ConflictStrategy::Custom && custom.is_none() {
            return Err(KvmeshError::Config(
                "custom conflict strategy requires a resolver function".into(),
            ));
        }
        Ok(Resolver { strategy, custom })
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Pick the value to keep for `conflict.key`.
    ///
    /// Without a local value the remote one is accepted unconditionally.
    pub fn resolve(&self, conflict: &Conflict<'_>) -> Value {
        let Some(local) = conflict.local else {
            return conflict.remote.clone();
        };

        if let Some(custom) = &self.custom {
            return run_custom(custom.as_ref(), conflict.key, local, conflict.remote);
        }

        match self.strategy {
            ConflictStrategy::LastWriteWins | ConflictStrategy::Custom => last_write_wins(
                local,
                conflict.remote,
                conflict.local_version,
                conflict.remote_version,
            ),
            ConflictStrategy::FirstWriteWins => local.clone(),
            ConflictStrategy::Merge => shallow_merge(local, conflict.remote).unwrap_or_else(|| {
                last_write_wins(
                    local,
                    conflict.remote,
                    conflict.local_version,
                    conflict.remote_version,
                )
            }),
        }
    }
}

/// Remote wins only with a strictly higher version; ties keep the local value.
pub fn last_write_wins(local: &Value, remote: &Value, local_version: u64, remote_version: u64) -> Value {
    if remote_version > local_version {
        remote.clone()
    } else {
        local.clone()
    }
}

/// `{...local, ...remote}` when both are objects, `None` otherwise.
pub fn shallow_merge(local: &Value, remote: &Value) -> Option<Value> {
    match (local, remote) {
        (Value::Object(local), Value::Object(remote)) => {
            let mut merged = local.clone();
            for (k, v) in remote {
                merged.insert(k.clone(), v.clone());
            }
            Some(Value::Object(merged))
        }
        _ => None,
    }
}

/// Run a user resolver; failures and panics fall back to the remote value.
fn run_custom(resolver: &dyn ConflictResolver, key: &str, local: &Value, remote: &Value) -> Value {
    match catch_unwind(AssertUnwindSafe(|| resolver.resolve(key, local, remote))) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(key, error = %e, "conflict resolver failed, accepting remote value");
            remote.clone()
        }
        Err(_) => {
            warn!(key, "conflict resolver panicked, accepting remote value");
            remote.clone()
        }
    }
}
