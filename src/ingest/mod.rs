//! Ingest tier: the adaptive log-range scanner and the outbox publisher.

mod publisher;
mod scanner;

pub use publisher::{OutboxSource, PublishSink, Publisher, PublisherConfig};
pub use scanner::{IngestSink, Scanner, ScannerConfig, ScanOutcome};
