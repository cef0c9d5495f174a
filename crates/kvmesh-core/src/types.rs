use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::error::{KvmeshError, KvmeshResult};

// ── Identity ──────────────────────────────────────────────────────────────────

/// Identifier of one running replica. Generated per process, not persisted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Fresh random id of the form `peer-<12 hex>`.
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        PeerId(format!("peer-{}", &raw[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

// ── Wire message ──────────────────────────────────────────────────────────────

/// Message type tag. Unknown tags from newer peers decode to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    State,
    Patch,
    Sync,
    Ack,
    Heartbeat,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::State => "state",
            MessageType::Patch => "patch",
            MessageType::Sync => "sync",
            MessageType::Ack => "ack",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single message shape exchanged over every transport.
///
/// Immutable once sent. `checksum` is the blake3 hex digest of the
/// JSON-serialized `data` and is verified on receipt when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub source: PeerId,
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl SyncMessage {
    /// Build a message stamped with the current time and a data checksum.
    pub fn new(
        id: impl Into<String>,
        kind: MessageType,
        source: PeerId,
        data: Value,
        version: u64,
    ) -> Self {
        let checksum = Some(checksum_of(&data));
        SyncMessage {
            id: id.into(),
            kind,
            source,
            timestamp: now_millis(),
            data,
            version,
            checksum,
        }
    }

    /// Verify `checksum` against `data`. Messages without one pass.
    pub fn verify_checksum(&self) -> KvmeshResult<()> {
        match &self.checksum {
            Some(expected) if *expected != checksum_of(&self.data) => Err(KvmeshError::Checksum {
                id: self.id.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Decode `data` into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> KvmeshResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_json(&self) -> KvmeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> KvmeshResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// blake3 hex digest of the canonical JSON encoding of `data`.
pub fn checksum_of(data: &Value) -> String {
    // serde_json maps are ordered, so the encoding is stable across peers
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// `data` of a `state` message: one key changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub previous: Option<Value>,
}

/// `data` of a `patch` message: several keys changed under one version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatchPayload {
    pub updates: Map<String, Value>,
}

/// `data` of a `sync` message: the sender's full local state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncPayload {
    pub state: Map<String, Value>,
}

/// `data` of an `ack` message.
///
/// Coordinators acknowledge a `sync` with `target` + `ack`; the relay
/// acknowledges a heartbeat with `heartbeat`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<String>,
}

// ── Transport / strategy enums ────────────────────────────────────────────────

/// Which concrete transport a coordinator should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Same-process room fan-out
    Broadcast,
    /// Reconnecting websocket through a relay
    Socket,
    /// Direct link negotiated over signaling
    Peer,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Broadcast => "broadcast",
            TransportKind::Socket => "socket",
            TransportKind::Peer => "peer",
        })
    }
}

/// Connection lifecycle of a single transport. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Conflict resolution rule applied when both sides hold a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    FirstWriteWins,
    Merge,
    Custom,
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Aggregate replication health exposed to the embedding application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// At least one transport is connected
    pub connected: bool,
    /// A full `sync()` broadcast is in flight
    pub syncing: bool,
    /// Unix millis of the last completed sync, if any
    pub last_sync: Option<i64>,
    /// Distinct remote peers seen recently
    pub peers: usize,
    /// Cumulative transport, send and decode errors
    pub errors: u64,
    /// Latest heartbeat round-trip (or heartbeat age)
    pub latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let msg = SyncMessage::new(
            "peer-a-1",
            MessageType::State,
            PeerId::from("peer-a"),
            json!({"key": "x", "value": 1, "previous": null}),
            1,
        );
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["source"], "peer-a");
        assert_eq!(value["version"], 1);
        assert!(value["checksum"].is_string());
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_unknown_type_is_ignorable() {
        let text = r#"{"id":"p-9","type":"presence","source":"p","timestamp":1,"data":{},"version":0}"#;
        let msg = SyncMessage::from_json(text).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
        assert!(msg.checksum.is_none());
        assert!(msg.verify_checksum().is_ok());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut msg = SyncMessage::new(
            "p-1",
            MessageType::Patch,
            PeerId::from("p"),
            json!({"updates": {"a": 1}}),
            3,
        );
        assert!(msg.verify_checksum().is_ok());
        msg.data = json!({"updates": {"a": 2}});
        assert!(matches!(
            msg.verify_checksum(),
            Err(KvmeshError::Checksum { .. })
        ));
    }

    #[test]
    fn test_payload_decode() {
        let msg = SyncMessage::new(
            "p-2",
            MessageType::State,
            PeerId::from("p"),
            json!({"key": "k", "value": [1, 2]}),
            2,
        );
        let payload: StatePayload = msg.payload().unwrap();
        assert_eq!(payload.key, "k");
        assert_eq!(payload.value, json!([1, 2]));
        assert_eq!(payload.previous, None);
    }

    #[test]
    fn test_peer_id_generate_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("peer-"));
        assert_eq!(a.as_str().len(), "peer-".len() + 12);
    }

    #[test]
    fn test_strategy_serde_names() {
        let s: ConflictStrategy = serde_json::from_str("\"first-write-wins\"").unwrap();
        assert_eq!(s, ConflictStrategy::FirstWriteWins);
        assert_eq!(
            serde_json::to_string(&ConflictStrategy::LastWriteWins).unwrap(),
            "\"last-write-wins\""
        );
    }

    #[test]
    fn test_float_checksum_after_parse() {
        for f in [971.9863718547629, 124.89148443491327, 104.16736132693127] {
            let sent = SyncMessage::new(
                "p-1",
                MessageType::State,
                PeerId::from("p"),
                json!({"key": "price", "value": f}),
                1,
            );
            let received = SyncMessage::from_json(&sent.to_json().unwrap()).unwrap();
            assert!(received.verify_checksum().is_ok(), "{f} failed verification");
        }
    }

    mod proptest_suite {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A message that crossed the wire still verifies, whatever
            /// float it carries.
            #[test]
            fn float_payload_survives_the_wire(
                f in any::<f64>().prop_filter("finite", |f| f.is_finite()),
            ) {
                let sent = SyncMessage::new(
                    "p-1",
                    MessageType::State,
                    PeerId::from("p"),
                    json!({"key": "price", "value": f}),
                    1,
                );
                let received = SyncMessage::from_json(&sent.to_json().unwrap()).unwrap();
                prop_assert!(received.verify_checksum().is_ok());
                prop_assert_eq!(received.data["value"].as_f64(), Some(f));
            }
        }
    }
}
