//! Dispatch tier: partition-ordered, exactly-once delivery of published
//! events to user batch handlers.

mod dispatcher;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use crate::domain::IngestEvent;
use crate::infra::{IndexerError, Result};

pub use dispatcher::{Dispatcher, DispatcherConfig};

/// A user batch handler.
///
/// Receives the ordered, deduplicated claim set and the dispatch
/// transaction handle. All side effects must go through `tx`: they commit
/// atomically with the inbox acknowledgment, which is the pipeline's
/// exactly-once guarantee. A returned error rolls the handler's writes back
/// and records FAIL (or DLQ once the attempt budget is exhausted).
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Stable handler kind, e.g. `"examples.erc20"`. One inbox row exists
    /// per `(event_id, kind)`.
    fn kind(&self) -> &str;

    async fn handle(
        &self,
        events: &[IngestEvent],
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<()>;
}

/// Map from handler kind to handler. Kinds are supplied out-of-tree, so
/// registration errors surface at startup when a dispatcher is asked to run
/// a kind the registry does not know.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn BatchHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn BatchHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn BatchHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| IndexerError::UnknownHandler(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
