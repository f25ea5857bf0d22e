//! Core domain types for the log pipeline.
//!
//! - [`event`] - wire logs, ingest events, event identity
//! - [`partition`] - deterministic partition key derivation
//! - [`command`] - domain outbox commands and inbox status

mod command;
mod event;
mod partition;

pub use command::{DomainCommand, InboxStatus};
pub use event::{event_id, ChainLog, IngestEvent, Subscription};
pub use partition::partition_key;
