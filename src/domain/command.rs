//! Domain outbox commands and inbox status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of an inbox entry.
///
/// `PENDING` and `FAIL` are transient (FAIL requires an operator reset to
/// retry); `ACK` and `DLQ` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxStatus {
    Pending,
    Ack,
    Fail,
    Dlq,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Pending => "PENDING",
            InboxStatus::Ack => "ACK",
            InboxStatus::Fail => "FAIL",
            InboxStatus::Dlq => "DLQ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(InboxStatus::Pending),
            "ACK" => Some(InboxStatus::Ack),
            "FAIL" => Some(InboxStatus::Fail),
            "DLQ" => Some(InboxStatus::Dlq),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InboxStatus::Ack | InboxStatus::Dlq)
    }
}

impl std::fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending (or settled) on-chain command in the domain outbox.
///
/// `command_key` is domain-deterministic (e.g.
/// `"mint:collection:recipient:tokenId"`), which is what makes submission
/// idempotent across executor restarts and races.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCommand {
    pub command_key: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub published_at: Option<DateTime<Utc>>,
    pub tx_hash: Option<String>,
}

impl DomainCommand {
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}
