//! logflume
//!
//! A polling blockchain log indexer that turns an at-least-once stream of
//! chain events into an exactly-once, partition-ordered pipeline ending in
//! domain projections and idempotent on-chain writes.
//!
//! ## Modules
//!
//! - [`rpc`] - read/write pool clients with rate limit, breaker, deadline
//! - [`ingest`] - adaptive log-range scanner and outbox publisher
//! - [`dispatch`] - partition-ordered exactly-once handler dispatch
//! - [`executor`] - domain outbox to on-chain transaction executor
//! - [`domain`] - event identity, partitioning, command records
//! - [`infra`] - errors, breaker, rate limiting, shutdown, Postgres stores
//! - [`metrics`] - registry behind the `/metrics` endpoint
//! - [`handlers`] - built-in example handlers

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod executor;
pub mod handlers;
pub mod infra;
pub mod ingest;
pub mod metrics;
pub mod migrations;
pub mod rpc;
pub mod server;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{BatchHandler, Dispatcher, DispatcherConfig, HandlerRegistry};
pub use domain::{ChainLog, DomainCommand, IngestEvent, InboxStatus, Subscription};
pub use executor::{CommandSource, CommandSubmitter, DomainExecutor, ExecutorConfig};
pub use infra::{IndexerError, Result, ShutdownSignal};
pub use ingest::{Publisher, PublisherConfig, Scanner, ScannerConfig};
pub use rpc::{ReadClient, RpcClientError, WriteClient};
