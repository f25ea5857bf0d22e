//! Log events and their identity.
//!
//! An event is uniquely identified by the position of its log inside the
//! chain: `<block_hash>:<block_number>:<tx_index>:<log_index>`. The id is
//! the primary key of the ingest store, which is what makes overlapping
//! scans idempotent.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::partition_key;

/// A log subscription: optional contract address and/or topic0 filter.
/// An empty subscription set means "everything in range".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic0: Option<String>,
}

/// A normalized chain log as returned by the read pool.
///
/// All hex strings are lowercase and `0x`-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: String,
    pub block_hash: String,
    pub block_number: u64,
    pub topics: Vec<String>,
    pub data: String,
    pub tx_hash: String,
    pub tx_index: u64,
    pub log_index: u64,
}

impl ChainLog {
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(|s| s.as_str())
    }
}

/// Derive the canonical event id for a log position.
pub fn event_id(block_hash: &str, block_number: u64, tx_index: u64, log_index: u64) -> String {
    format!("{block_hash}:{block_number}:{tx_index}:{log_index}")
}

/// A persisted ingest event. Append-only; also the shape handed to batch
/// handlers by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub event_id: String,
    pub block_number: u64,
    pub block_hash: String,
    pub address: String,
    pub topic0: Option<String>,
    pub partition_key: String,
    pub payload: serde_json::Value,
}

impl IngestEvent {
    /// Build the persisted event from a wire log. The payload keeps the
    /// wire shape (hex-encoded numeric fields) so handlers decode at the
    /// edge.
    pub fn from_log(log: &ChainLog, address_shards: u32) -> Self {
        let payload = json!({
            "address": log.address,
            "blockHash": log.block_hash,
            "blockNumber": format!("{:#x}", log.block_number),
            "data": log.data,
            "logIndex": format!("{:#x}", log.log_index),
            "topics": log.topics,
            "transactionHash": log.tx_hash,
            "transactionIndex": format!("{:#x}", log.tx_index),
        });

        Self {
            event_id: event_id(&log.block_hash, log.block_number, log.tx_index, log.log_index),
            block_number: log.block_number,
            block_hash: log.block_hash.clone(),
            address: log.address.clone(),
            topic0: log.topic0().map(str::to_string),
            partition_key: partition_key(&log.address, address_shards),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> ChainLog {
        ChainLog {
            address: "0x00000000000000000000000000000000000000aa".to_string(),
            block_hash: "0xdead".to_string(),
            block_number: 16,
            topics: vec!["0xddf2".to_string(), "0x01".to_string()],
            data: "0x".to_string(),
            tx_hash: "0xbeef".to_string(),
            tx_index: 1,
            log_index: 2,
        }
    }

    #[test]
    fn event_id_embeds_log_position() {
        assert_eq!(event_id("0xdead", 16, 1, 2), "0xdead:16:1:2");
    }

    #[test]
    fn from_log_derives_identity_and_topic0() {
        let event = IngestEvent::from_log(&sample_log(), 1);
        assert_eq!(event.event_id, "0xdead:16:1:2");
        assert_eq!(event.block_number, 16);
        assert_eq!(event.topic0.as_deref(), Some("0xddf2"));
    }

    #[test]
    fn from_log_payload_keeps_wire_shape() {
        let event = IngestEvent::from_log(&sample_log(), 1);
        assert_eq!(event.payload["blockNumber"], "0x10");
        assert_eq!(event.payload["logIndex"], "0x2");
        assert_eq!(event.payload["transactionIndex"], "0x1");
        assert_eq!(event.payload["transactionHash"], "0xbeef");
    }

    #[test]
    fn from_log_without_topics_has_no_topic0() {
        let mut log = sample_log();
        log.topics.clear();
        let event = IngestEvent::from_log(&log, 1);
        assert!(event.topic0.is_none());
    }

    #[test]
    fn subscription_parses_partial_json() {
        let sub: Subscription = serde_json::from_str(r#"{"address": "0xaa"}"#).unwrap();
        assert_eq!(sub.address.as_deref(), Some("0xaa"));
        assert!(sub.topic0.is_none());
    }
}
