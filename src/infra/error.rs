//! Error types for the indexer infrastructure.

use thiserror::Error;

use crate::rpc::RpcClientError;

/// Errors that can occur in the indexer infrastructure.
#[derive(Error, Debug)]
pub enum IndexerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Chain RPC error (already classified by the adapter)
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcClientError),

    /// A log returned by the node is missing fields the pipeline requires
    #[error("invalid log: {0}")]
    InvalidLog(String),

    /// Handler kind not present in the registry
    #[error("unknown handler kind: {0}")]
    UnknownHandler(String),

    /// User batch handler failed; recorded into the inbox, never fatal
    #[error("handler failure: {0}")]
    Handler(String),

    /// Configuration error; fatal at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for indexer operations.
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Check if a database error is transient and worth retrying on the next
/// loop iteration.
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // Serialization failure, deadlock, connection exceptions,
            // operator intervention.
            code == "40001"
                || code == "40P01"
                || code.starts_with("08")
                || code.starts_with("57")
        }
        _ => false,
    }
}

/// Truncate an error message for storage in `inbox.last_error`.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        message.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_error_short_message_unchanged() {
        assert_eq!(truncate_error("boom", 500), "boom");
    }

    #[test]
    fn truncate_error_cuts_at_limit() {
        let long = "x".repeat(700);
        let cut = truncate_error(&long, 500);
        assert_eq!(cut.chars().count(), 500);
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let msg = "é".repeat(10);
        let cut = truncate_error(&msg, 5);
        assert_eq!(cut.chars().count(), 5);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<IndexerError>();
    }

    #[test]
    fn unknown_handler_display() {
        let err = IndexerError::UnknownHandler("examples.missing".to_string());
        assert!(err.to_string().contains("examples.missing"));
    }
}
