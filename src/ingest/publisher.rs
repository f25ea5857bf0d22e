//! Ingest outbox publisher.
//!
//! Pushes each persisted event to the transport sink once, in FIFO-by-id
//! order, and stamps `published_at` whether the sink succeeded or not. The
//! outbox contract is "attempted to publish": the dispatcher downstream
//! reads the joined published view and carries its own idempotency in the
//! inbox, so re-trying a failed publish here would only duplicate transport
//! delivery without adding safety. A failing sink therefore shows up in
//! `publish_errors_total`, never as a stuck head-of-line row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::infra::{Result, ShutdownSignal};
use crate::metrics::{metric_names, Labels, MetricsRegistry};

/// Source of unpublished outbox rows.
#[async_trait]
pub trait OutboxSource: Send + Sync {
    /// Up to `limit` unpublished event ids, ordered by `event_id ASC`.
    async fn unpublished_batch(&self, limit: i64) -> Result<Vec<String>>;

    /// Stamp `published_at` for a row. Returns false when another publisher
    /// already stamped it (safe race under the per-row idempotent update).
    async fn mark_published(&self, event_id: &str) -> Result<bool>;
}

/// Transport sink receiving event ids at-least-once.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, event_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub batch_size: i64,
    pub idle_sleep: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            idle_sleep: Duration::from_millis(250),
        }
    }
}

/// One publisher per deployment per logical outbox is sufficient;
/// duplicates are safe but wasteful.
pub struct Publisher {
    config: PublisherConfig,
    source: Arc<dyn OutboxSource>,
    sink: Arc<dyn PublishSink>,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownSignal,
}

impl Publisher {
    pub fn new(
        config: PublisherConfig,
        source: Arc<dyn OutboxSource>,
        sink: Arc<dyn PublishSink>,
        metrics: Arc<MetricsRegistry>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            metrics,
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!(batch_size = self.config.batch_size, "starting publisher");

        while !self.shutdown.is_shutdown() {
            match self.run_once().await {
                Ok(0) => self.shutdown.sleep(self.config.idle_sleep).await,
                Ok(published) => debug!(published, "outbox batch published"),
                Err(e) => {
                    warn!(error = %e, "publisher iteration failed");
                    self.shutdown.sleep(self.config.idle_sleep).await;
                }
            }
        }

        info!("publisher stopped");
        Ok(())
    }

    /// Publish one batch; returns the number of rows processed.
    pub async fn run_once(&self) -> Result<usize> {
        let batch = self.source.unpublished_batch(self.config.batch_size).await?;

        for event_id in &batch {
            match self.sink.publish(event_id).await {
                Ok(()) => {
                    self.metrics
                        .inc_counter(metric_names::PUBLISHED_TOTAL, Labels::new())
                        .await;
                }
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "publish sink failed");
                    self.metrics
                        .inc_counter(metric_names::PUBLISH_ERRORS_TOTAL, Labels::new())
                        .await;
                }
            }

            // Stamp on success and failure alike; see module docs.
            self.source.mark_published(event_id).await?;
        }

        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::IndexerError;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeOutbox {
        // event_id -> published
        rows: Mutex<BTreeMap<String, bool>>,
    }

    impl FakeOutbox {
        async fn seed(&self, ids: &[&str]) {
            let mut rows = self.rows.lock().await;
            for id in ids {
                rows.insert(id.to_string(), false);
            }
        }
    }

    #[async_trait]
    impl OutboxSource for FakeOutbox {
        async fn unpublished_batch(&self, limit: i64) -> Result<Vec<String>> {
            Ok(self
                .rows
                .lock()
                .await
                .iter()
                .filter(|(_, published)| !**published)
                .take(limit as usize)
                .map(|(id, _)| id.clone())
                .collect())
        }

        async fn mark_published(&self, event_id: &str) -> Result<bool> {
            let mut rows = self.rows.lock().await;
            match rows.get_mut(event_id) {
                Some(published) if !*published => {
                    *published = true;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
        fail_ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PublishSink for RecordingSink {
        async fn publish(&self, event_id: &str) -> Result<()> {
            if self.fail_ids.lock().await.iter().any(|id| id == event_id) {
                return Err(IndexerError::Internal("sink down".to_string()));
            }
            self.delivered.lock().await.push(event_id.to_string());
            Ok(())
        }
    }

    fn publisher_with(
        source: Arc<FakeOutbox>,
        sink: Arc<RecordingSink>,
    ) -> Publisher {
        Publisher::new(
            PublisherConfig::default(),
            source,
            sink,
            Arc::new(MetricsRegistry::new()),
            ShutdownSignal::new(),
        )
    }

    #[tokio::test]
    async fn publishes_in_event_id_order_and_stamps() {
        let source = Arc::new(FakeOutbox::default());
        source.seed(&["0xa:1:0:0", "0xb:2:0:0", "0xc:3:0:0"]).await;
        let sink = Arc::new(RecordingSink::default());
        let publisher = publisher_with(source.clone(), sink.clone());

        assert_eq!(publisher.run_once().await.unwrap(), 3);
        assert_eq!(
            *sink.delivered.lock().await,
            vec!["0xa:1:0:0", "0xb:2:0:0", "0xc:3:0:0"]
        );
        // Nothing left unpublished.
        assert_eq!(publisher.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sink_failure_still_stamps_row() {
        let source = Arc::new(FakeOutbox::default());
        source.seed(&["0xa:1:0:0", "0xb:2:0:0"]).await;
        let sink = Arc::new(RecordingSink::default());
        sink.fail_ids.lock().await.push("0xa:1:0:0".to_string());
        let publisher = publisher_with(source.clone(), sink.clone());

        assert_eq!(publisher.run_once().await.unwrap(), 2);
        // The failed row does not block the queue and is not re-offered.
        assert_eq!(publisher.run_once().await.unwrap(), 0);
        assert_eq!(*sink.delivered.lock().await, vec!["0xb:2:0:0"]);
    }
}
