//! Domain executor: turns pending outbox commands into on-chain
//! transactions, exactly once per `command_key`.
//!
//! Idempotency rests entirely on the settle guard
//! `UPDATE .. WHERE command_key = $1 AND published_at IS NULL`: when two
//! executors race, both may submit, but only one settle takes effect and a
//! deterministic `command_key` makes the duplicate submission itself a
//! no-op at the contract level.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::DomainCommand;
use crate::infra::{
    retry_with_predicate, CircuitBreaker, IndexerError, Result, RetryConfig, ShutdownSignal,
};
use crate::metrics::{metric_names, Labels, MetricsRegistry};
use crate::rpc::{RpcClientError, WriteClient};

/// Source of pending domain commands and the settle primitive.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Up to `limit` unpublished commands, ordered by `command_key ASC`.
    async fn pending_commands(&self, limit: i64) -> Result<Vec<DomainCommand>>;

    async fn count_pending(&self) -> Result<u64>;

    /// Record `tx_hash` and stamp `published_at` under the idempotency
    /// guard. Returns false when another executor already settled the key.
    async fn settle(&self, command_key: &str, tx_hash: &str) -> Result<bool>;
}

/// Turns one command into one on-chain submission.
///
/// Nonce, gas, and signing belong behind this seam; the executor only
/// cares that `submit` returns a transaction hash or raises.
#[async_trait]
pub trait CommandSubmitter: Send + Sync {
    async fn submit(&self, command: &DomainCommand) -> Result<String>;
}

/// Submitter for commands carrying a pre-signed transaction in their
/// payload (`{"raw_tx": "0x.."}`). Transient transport failures are
/// retried with jittered backoff before the row is left for the next
/// iteration.
pub struct RawTransactionSubmitter {
    write: Arc<dyn WriteClient>,
    retry: RetryConfig,
}

impl RawTransactionSubmitter {
    pub fn new(write: Arc<dyn WriteClient>) -> Self {
        Self {
            write,
            retry: RetryConfig::submission(),
        }
    }
}

#[async_trait]
impl CommandSubmitter for RawTransactionSubmitter {
    async fn submit(&self, command: &DomainCommand) -> Result<String> {
        let raw_hex = command
            .payload
            .get("raw_tx")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                IndexerError::Internal(format!(
                    "command {} has no raw_tx payload field",
                    command.command_key
                ))
            })?;
        let raw = hex::decode(raw_hex.trim_start_matches("0x"))
            .map_err(|e| IndexerError::Internal(format!("bad raw_tx hex: {e}")))?;

        let tx_hash = retry_with_predicate(
            &self.retry,
            "send_raw_transaction",
            || self.write.send_raw_transaction(&raw),
            RpcClientError::is_transient,
        )
        .await?;

        Ok(tx_hash)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub batch_size: i64,
    pub idle_sleep: Duration,
    /// When false, handlers keep enqueueing but nothing is submitted;
    /// used for draining before maintenance.
    pub enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_sleep: Duration::from_millis(300),
            enabled: true,
        }
    }
}

/// Single-writer by design; duplicates are safe but wasteful.
pub struct DomainExecutor {
    config: ExecutorConfig,
    source: Arc<dyn CommandSource>,
    submitter: Arc<dyn CommandSubmitter>,
    write_breaker: Option<Arc<CircuitBreaker>>,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownSignal,
}

impl DomainExecutor {
    pub fn new(
        config: ExecutorConfig,
        source: Arc<dyn CommandSource>,
        submitter: Arc<dyn CommandSubmitter>,
        metrics: Arc<MetricsRegistry>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            source,
            submitter,
            write_breaker: None,
            metrics,
            shutdown,
        }
    }

    /// Attach the write pool's breaker so the executor can publish the
    /// `cb_open_seconds{pool="write"}` gauge.
    pub fn with_write_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.write_breaker = Some(breaker);
        self
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            enabled = self.config.enabled,
            "starting domain executor"
        );

        while !self.shutdown.is_shutdown() {
            match self.run_once().await {
                Ok(0) => self.shutdown.sleep(self.config.idle_sleep).await,
                Ok(submitted) => debug!(submitted, "command batch processed"),
                Err(e) => {
                    warn!(error = %e, "executor iteration failed");
                    self.shutdown.sleep(self.config.idle_sleep).await;
                }
            }
        }

        info!("domain executor stopped");
        Ok(())
    }

    /// One gauge + fetch + submit + settle pass. Returns the number of
    /// commands successfully settled by this executor.
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self.source.count_pending().await?;
        self.metrics
            .set_gauge(
                metric_names::DOMAIN_OUTBOX_UNPUBLISHED,
                Labels::new(),
                pending,
            )
            .await;
        self.publish_breaker_gauge().await;

        if !self.config.enabled || pending == 0 {
            return Ok(0);
        }

        let commands = self.source.pending_commands(self.config.batch_size).await?;
        let mut settled = 0usize;

        for command in &commands {
            if self.shutdown.is_shutdown() {
                break;
            }

            match self.submitter.submit(command).await {
                Ok(tx_hash) => {
                    if self.source.settle(&command.command_key, &tx_hash).await? {
                        info!(
                            command_key = %command.command_key,
                            kind = %command.kind,
                            tx_hash = %tx_hash,
                            "command submitted"
                        );
                        self.metrics
                            .inc_counter(metric_names::COMMANDS_SUBMITTED_TOTAL, Labels::new())
                            .await;
                        settled += 1;
                    } else {
                        // Lost the race: another executor settled first.
                        debug!(
                            command_key = %command.command_key,
                            "command already settled elsewhere"
                        );
                    }
                }
                Err(e) => {
                    // Skip this row; it stays unpublished and is retried on
                    // the next iteration.
                    warn!(
                        command_key = %command.command_key,
                        error = %e,
                        "command submission failed"
                    );
                    self.metrics
                        .inc_counter(metric_names::COMMAND_ERRORS_TOTAL, Labels::new())
                        .await;
                }
            }
        }

        Ok(settled)
    }

    async fn publish_breaker_gauge(&self) {
        if let Some(breaker) = &self.write_breaker {
            self.metrics
                .set_gauge(
                    metric_names::CB_OPEN_SECONDS,
                    Labels::new().pool(breaker.pool()),
                    breaker.open_seconds().await,
                )
                .await;
        }
    }
}
