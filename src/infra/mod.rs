//! Infrastructure layer.
//!
//! Contains the cross-cutting machinery the pipeline tiers share:
//! - Error taxonomy and retryable-database classification
//! - Circuit breaker and token bucket guarding the RPC pools
//! - Jittered retry for the write path
//! - Graceful shutdown signalling
//! - PostgreSQL store implementations

mod circuit_breaker;
mod error;
mod graceful_shutdown;
pub mod postgres;
mod rate_limit;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{is_retryable_db_error, truncate_error, IndexerError, Result};
pub use graceful_shutdown::{listen_for_signals, ShutdownSignal};
pub use rate_limit::TokenBucket;
pub use retry::{retry_with_predicate, RetryConfig};
