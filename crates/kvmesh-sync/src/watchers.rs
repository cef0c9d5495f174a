//! Per-key change callbacks, owned by the coordinator actor.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Receives `(new, old)` for one key. `None` means the key had no value.
pub type WatchCallback = Arc<dyn Fn(Option<&Value>, Option<&Value>) + Send + Sync>;

#[derive(Default)]
pub struct Watchers {
    next_id: u64,
    by_key: HashMap<String, Vec<(u64, WatchCallback)>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `key`, returning the id to remove it by.
    pub fn add(&mut self, key: String, callback: WatchCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_key.entry(key).or_default().push((id, callback));
        id
    }

    pub fn remove(&mut self, key: &str, id: u64) {
        if let Some(list) = self.by_key.get_mut(key) {
            list.retain(|(entry, _)| *entry != id);
            if list.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    /// Invoke every watcher of `key` once. A panicking watcher is logged and
    /// does not stop the others.
    pub fn notify(&self, key: &str, new: Option<&Value>, old: Option<&Value>) {
        let Some(list) = self.by_key.get(key) else {
            return;
        };
        for (id, callback) in list {
            if catch_unwind(AssertUnwindSafe(|| callback(new, old))).is_err() {
                warn!(key, watcher = id, "watcher panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
    }
}
