//! Partition-ordered dispatcher.
//!
//! For one `handler_kind` and an optional partition selector, delivers
//! every published event to the batch handler exactly once:
//!
//! 1. **Select** published events this kind may still process (no inbox
//!    row yet, or an operator-reset PENDING row), ordered by block number.
//! 2. **Claim** them inside a transaction via an
//!    `INSERT .. ON CONFLICT .. RETURNING` upsert. Two workers racing on
//!    the same selector each win a disjoint subset; no advisory lock is
//!    needed.
//! 3. **Project** by invoking the handler on a savepoint of the same
//!    transaction.
//! 4. **Settle** the claimed inbox rows to ACK, or roll the handler's
//!    writes back to the savepoint and settle FAIL/DLQ.
//!
//! The outer transaction commits atomically, so handler effects and inbox
//! transitions are indivisible.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::domain::InboxStatus;
use crate::infra::postgres::PgInboxStore;
use crate::infra::{is_retryable_db_error, truncate_error, IndexerError, Result, ShutdownSignal};
use crate::metrics::{metric_names, Labels, MetricsRegistry};

use super::{BatchHandler, HandlerRegistry};

/// Maximum stored length of a handler error message.
const LAST_ERROR_MAX_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub handler_kind: String,
    /// Partition key prefix this worker is scoped to; empty matches all
    pub partition_selector: String,
    pub batch_size: i64,
    /// Attempts after which a failing entry goes to DLQ
    pub max_attempts: i32,
    pub idle_sleep: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_kind: String::new(),
            partition_selector: String::new(),
            batch_size: 200,
            max_attempts: 3,
            idle_sleep: Duration::from_millis(200),
        }
    }
}

/// One dispatcher worker for one handler kind.
pub struct Dispatcher {
    config: DispatcherConfig,
    pool: PgPool,
    inbox: PgInboxStore,
    handler: Arc<dyn BatchHandler>,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownSignal,
}

impl Dispatcher {
    /// Resolve the configured handler kind against the registry; unknown
    /// kinds refuse to start.
    pub fn new(
        config: DispatcherConfig,
        pool: PgPool,
        registry: &HandlerRegistry,
        metrics: Arc<MetricsRegistry>,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let handler = registry.get(&config.handler_kind)?;
        Ok(Self {
            inbox: PgInboxStore::new(pool.clone()),
            config,
            pool,
            handler,
            metrics,
            shutdown,
        })
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            handler_kind = %self.config.handler_kind,
            partition_selector = %self.config.partition_selector,
            batch_size = self.config.batch_size,
            "starting dispatcher"
        );

        while !self.shutdown.is_shutdown() {
            match self.run_once().await {
                Ok(0) => self.shutdown.sleep(self.config.idle_sleep).await,
                Ok(delivered) => {
                    debug!(
                        handler_kind = %self.config.handler_kind,
                        delivered,
                        "batch settled"
                    );
                }
                Err(IndexerError::Database(e)) if is_retryable_db_error(&e) => {
                    warn!(error = %e, "transient database error, retrying after idle sleep");
                    self.shutdown.sleep(self.config.idle_sleep).await;
                }
                Err(e) => {
                    warn!(error = %e, "dispatch iteration failed");
                    self.shutdown.sleep(self.config.idle_sleep).await;
                }
            }
        }

        info!(handler_kind = %self.config.handler_kind, "dispatcher stopped");
        Ok(())
    }

    /// One selection + claim + project + settle cycle. Returns the number
    /// of events settled (ACK or FAIL/DLQ).
    pub async fn run_once(&self) -> Result<usize> {
        let candidates = self
            .inbox
            .select_candidates(
                &self.config.partition_selector,
                &self.config.handler_kind,
                self.config.batch_size,
            )
            .await?;

        if candidates.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let claimed_ids = self
            .inbox
            .claim_batch(&mut tx, &self.config.handler_kind, &candidates)
            .await?;

        if claimed_ids.is_empty() {
            // Another worker claimed the whole batch between our select and
            // insert; nothing to do.
            tx.rollback().await?;
            return Ok(0);
        }

        let claimed_set: HashSet<&str> = claimed_ids.iter().map(String::as_str).collect();
        let claimed: Vec<_> = candidates
            .into_iter()
            .filter(|e| claimed_set.contains(e.event_id.as_str()))
            .collect();

        // The handler runs on a savepoint so its writes can be rolled back
        // on failure while the claim and FAIL/DLQ settle still commit.
        let mut handler_tx = tx.begin().await?;
        let outcome = self.handler.handle(&claimed, &mut handler_tx).await;

        let settled = claimed.len();
        match outcome {
            Ok(()) => {
                handler_tx.commit().await?;
                self.inbox
                    .settle_ack(&mut tx, &self.config.handler_kind, &claimed_ids)
                    .await?;
                tx.commit().await?;

                self.metrics
                    .add_counter(
                        metric_names::INBOX_ATTEMPTS_TOTAL,
                        Labels::new()
                            .handler_kind(&self.config.handler_kind)
                            .status(InboxStatus::Ack.as_str()),
                        settled as u64,
                    )
                    .await;
            }
            Err(e) => {
                handler_tx.rollback().await?;

                let message = truncate_error(&e.to_string(), LAST_ERROR_MAX_CHARS);
                let dlq_count = self
                    .inbox
                    .settle_failure(
                        &mut tx,
                        &self.config.handler_kind,
                        &claimed_ids,
                        &message,
                        self.config.max_attempts,
                    )
                    .await?;
                tx.commit().await?;

                warn!(
                    handler_kind = %self.config.handler_kind,
                    failed = settled,
                    dlq = dlq_count,
                    error = %message,
                    "handler failed, batch settled to FAIL/DLQ"
                );

                self.metrics
                    .add_counter(
                        metric_names::INBOX_ATTEMPTS_TOTAL,
                        Labels::new()
                            .handler_kind(&self.config.handler_kind)
                            .status(InboxStatus::Fail.as_str()),
                        settled as u64 - dlq_count,
                    )
                    .await;
                if dlq_count > 0 {
                    self.metrics
                        .add_counter(
                            metric_names::INBOX_ATTEMPTS_TOTAL,
                            Labels::new()
                                .handler_kind(&self.config.handler_kind)
                                .status(InboxStatus::Dlq.as_str()),
                            dlq_count,
                        )
                        .await;
                    self.metrics
                        .add_counter(
                            metric_names::DLQ_TOTAL,
                            Labels::new().handler_kind(&self.config.handler_kind),
                            dlq_count,
                        )
                        .await;
                }
            }
        }

        Ok(settled)
    }
}
