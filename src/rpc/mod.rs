//! Chain RPC adapter.
//!
//! Two capability traits: [`ReadClient`] for head polling and log range
//! queries, [`WriteClient`] for raw transaction submission. The production
//! implementations in [`http`] wrap every call with three layered policies,
//! in order: token-bucket rate limit, circuit breaker, per-call deadline.

mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ChainLog, Subscription};

pub use http::{AlloyReadClient, AlloyWriteClient, ReadClientConfig, WriteClientConfig};

/// Errors surfaced by the RPC adapter.
///
/// All kinds are retriable at the outer loop: the scanner narrows its step
/// and re-enters after the poll interval, the executor skips the row until
/// the next iteration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcClientError {
    /// Breaker is open; the call was rejected without touching the network
    #[error("circuit open for {pool} pool")]
    CircuitOpen { pool: &'static str },

    /// The per-method deadline elapsed
    #[error("{method} timed out after {timeout_ms} ms")]
    Timeout { method: &'static str, timeout_ms: u64 },

    /// Protocol-level error reported by the node
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response that could not be interpreted (missing fields, bad hex)
    #[error("malformed rpc response: {0}")]
    Protocol(String),

    /// Network-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcClientError {
    /// Whether a retry of the same call has a chance of succeeding without
    /// operator involvement. Used by the write-path backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcClientError::Timeout { .. } | RpcClientError::Transport(_)
        )
    }
}

/// A block range plus the optional address/topic0 narrowing of one
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub address: Option<String>,
    pub topic0: Option<String>,
}

impl RangeFilter {
    /// An unfiltered range query.
    pub fn range(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            address: None,
            topic0: None,
        }
    }

    /// The range narrowed to one subscription.
    pub fn for_subscription(from_block: u64, to_block: u64, sub: &Subscription) -> Self {
        Self {
            from_block,
            to_block,
            address: sub.address.clone(),
            topic0: sub.topic0.clone(),
        }
    }
}

/// Read pool capability: head polling and log range queries.
#[async_trait]
pub trait ReadClient: Send + Sync {
    async fn get_head_block(&self) -> Result<u64, RpcClientError>;

    async fn get_logs(&self, filter: &RangeFilter) -> Result<Vec<ChainLog>, RpcClientError>;
}

/// Write pool capability: submit a pre-signed raw transaction, returning
/// the transaction hash. Nonce, gas, and signing are the caller's concern.
#[async_trait]
pub trait WriteClient: Send + Sync {
    async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<String, RpcClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RpcClientError::Transport("reset".into()).is_transient());
        assert!(RpcClientError::Timeout {
            method: "eth_getLogs",
            timeout_ms: 15_000
        }
        .is_transient());
        assert!(!RpcClientError::CircuitOpen { pool: "read" }.is_transient());
        assert!(!RpcClientError::Rpc {
            code: -32000,
            message: "nonce too low".into()
        }
        .is_transient());
    }

    #[test]
    fn filter_for_subscription_carries_narrowing() {
        let sub = Subscription {
            address: Some("0xaa".into()),
            topic0: None,
        };
        let filter = RangeFilter::for_subscription(5, 10, &sub);
        assert_eq!(filter.from_block, 5);
        assert_eq!(filter.to_block, 10);
        assert_eq!(filter.address.as_deref(), Some("0xaa"));
        assert!(filter.topic0.is_none());
    }
}
