//! PostgreSQL-backed stores for the pipeline tiers.

mod domain_outbox;
mod ingest_store;
mod inbox_store;

pub use domain_outbox::PgDomainOutbox;
pub use ingest_store::PgIngestStore;
pub use inbox_store::{InboxStatusCount, PgInboxStore};
