//! Alloy-backed RPC clients.
//!
//! Every outbound call goes through the same three policies in order:
//! token bucket, circuit breaker, deadline. Breaker rejections do not count
//! as pool failures; everything else (timeout, transport, protocol, node
//! error) does.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;

use crate::domain::ChainLog;
use crate::infra::{CircuitBreaker, CircuitBreakerConfig, IndexerError, TokenBucket};
use crate::metrics::{metric_names, Labels, MetricsRegistry};

use super::{RangeFilter, ReadClient, RpcClientError, WriteClient};

/// Configuration for the read pool client.
#[derive(Debug, Clone)]
pub struct ReadClientConfig {
    pub url: String,
    pub head_rps: f64,
    pub logs_rps: f64,
    pub head_deadline: Duration,
    pub logs_deadline: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for ReadClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8545".to_string(),
            head_rps: 10.0,
            logs_rps: 5.0,
            head_deadline: Duration::from_secs(1),
            logs_deadline: Duration::from_secs(15),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Configuration for the write pool client.
#[derive(Debug, Clone)]
pub struct WriteClientConfig {
    pub url: String,
    pub rps: f64,
    pub send_deadline: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for WriteClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8545".to_string(),
            rps: 2.0,
            send_deadline: Duration::from_secs(10),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Rate limit -> breaker -> deadline, with request/error counters and an
/// optional latency histogram around the wire call itself.
async fn call_with_policies<T, F>(
    pool: &'static str,
    method: &'static str,
    bucket: &TokenBucket,
    breaker: &CircuitBreaker,
    metrics: &MetricsRegistry,
    deadline: Duration,
    latency_metric: Option<&'static str>,
    fut: F,
) -> Result<T, RpcClientError>
where
    F: Future<Output = Result<T, RpcClientError>>,
{
    bucket.take().await;

    if !breaker.is_allowed().await {
        metrics
            .inc_counter(metric_names::RPC_ERRORS_TOTAL, Labels::new().method(method))
            .await;
        return Err(RpcClientError::CircuitOpen { pool });
    }

    metrics
        .inc_counter(metric_names::RPC_REQUESTS_TOTAL, Labels::new().method(method))
        .await;

    let start = Instant::now();
    let result = match tokio::time::timeout(deadline, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(RpcClientError::Timeout {
            method,
            timeout_ms: deadline.as_millis() as u64,
        }),
    };

    if let Some(name) = latency_metric {
        metrics
            .observe_histogram(name, Labels::new(), start.elapsed().as_secs_f64())
            .await;
    }

    match &result {
        Ok(_) => breaker.record_success().await,
        Err(_) => {
            breaker.record_failure().await;
            metrics
                .inc_counter(metric_names::RPC_ERRORS_TOTAL, Labels::new().method(method))
                .await;
        }
    }

    result
}

fn map_rpc_error(method: &'static str, err: RpcError<TransportErrorKind>) -> RpcClientError {
    match err {
        RpcError::ErrorResp(payload) => RpcClientError::Rpc {
            code: payload.code,
            message: payload.message.to_string(),
        },
        RpcError::DeserError { err, .. } => {
            RpcClientError::Protocol(format!("{method}: {err}"))
        }
        other => RpcClientError::Transport(other.to_string()),
    }
}

fn to_chain_log(log: Log) -> Result<ChainLog, RpcClientError> {
    let block_hash = log
        .block_hash
        .ok_or_else(|| RpcClientError::Protocol("log without blockHash".to_string()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| RpcClientError::Protocol("log without blockNumber".to_string()))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| RpcClientError::Protocol("log without transactionHash".to_string()))?;
    let tx_index = log
        .transaction_index
        .ok_or_else(|| RpcClientError::Protocol("log without transactionIndex".to_string()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| RpcClientError::Protocol("log without logIndex".to_string()))?;

    Ok(ChainLog {
        address: format!("{:#x}", log.address()),
        block_hash: format!("{block_hash:#x}"),
        block_number,
        topics: log.topics().iter().map(|t| format!("{t:#x}")).collect(),
        data: format!("0x{}", hex::encode(&log.data().data)),
        tx_hash: format!("{tx_hash:#x}"),
        tx_index,
        log_index,
    })
}

/// Read pool client: head polling and log range queries.
pub struct AlloyReadClient {
    provider: Arc<dyn Provider + Send + Sync>,
    head_bucket: TokenBucket,
    logs_bucket: TokenBucket,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsRegistry>,
    head_deadline: Duration,
    logs_deadline: Duration,
}

impl AlloyReadClient {
    pub fn new(config: ReadClientConfig, metrics: Arc<MetricsRegistry>) -> Result<Self, IndexerError> {
        let url = config
            .url
            .parse()
            .map_err(|e| IndexerError::Configuration(format!("invalid read RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self {
            provider: Arc::new(provider),
            head_bucket: TokenBucket::new("read:head", config.head_rps),
            logs_bucket: TokenBucket::new("read:logs", config.logs_rps),
            breaker: Arc::new(CircuitBreaker::with_config("read", config.breaker)),
            metrics,
            head_deadline: config.head_deadline,
            logs_deadline: config.logs_deadline,
        })
    }

    /// The read pool's breaker, for the `cb_open_seconds` gauge.
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }
}

#[async_trait]
impl ReadClient for AlloyReadClient {
    async fn get_head_block(&self) -> Result<u64, RpcClientError> {
        let provider = self.provider.clone();
        call_with_policies(
            "read",
            "eth_blockNumber",
            &self.head_bucket,
            &self.breaker,
            &self.metrics,
            self.head_deadline,
            Some(metric_names::HEAD_FETCH_LATENCY),
            async move {
                provider
                    .get_block_number()
                    .await
                    .map_err(|e| map_rpc_error("eth_blockNumber", e))
            },
        )
        .await
    }

    async fn get_logs(&self, filter: &RangeFilter) -> Result<Vec<ChainLog>, RpcClientError> {
        let mut wire_filter = Filter::new()
            .from_block(filter.from_block)
            .to_block(filter.to_block);

        if let Some(address) = &filter.address {
            let parsed: Address = address
                .parse()
                .map_err(|e| RpcClientError::Protocol(format!("bad filter address: {e}")))?;
            wire_filter = wire_filter.address(parsed);
        }
        if let Some(topic0) = &filter.topic0 {
            let parsed: B256 = topic0
                .parse()
                .map_err(|e| RpcClientError::Protocol(format!("bad filter topic0: {e}")))?;
            wire_filter = wire_filter.event_signature(parsed);
        }

        let provider = self.provider.clone();
        let logs = call_with_policies(
            "read",
            "eth_getLogs",
            &self.logs_bucket,
            &self.breaker,
            &self.metrics,
            self.logs_deadline,
            Some(metric_names::LOG_FETCH_LATENCY),
            async move {
                provider
                    .get_logs(&wire_filter)
                    .await
                    .map_err(|e| map_rpc_error("eth_getLogs", e))
            },
        )
        .await?;

        logs.into_iter().map(to_chain_log).collect()
    }
}

/// Write pool client: raw transaction submission.
pub struct AlloyWriteClient {
    provider: Arc<dyn Provider + Send + Sync>,
    bucket: TokenBucket,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsRegistry>,
    send_deadline: Duration,
}

impl AlloyWriteClient {
    pub fn new(
        config: WriteClientConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, IndexerError> {
        let url = config
            .url
            .parse()
            .map_err(|e| IndexerError::Configuration(format!("invalid write RPC URL: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self {
            provider: Arc::new(provider),
            bucket: TokenBucket::new("write:send", config.rps),
            breaker: Arc::new(CircuitBreaker::with_config("write", config.breaker)),
            metrics,
            send_deadline: config.send_deadline,
        })
    }

    /// The write pool's breaker, for the `cb_open_seconds` gauge.
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }
}

#[async_trait]
impl WriteClient for AlloyWriteClient {
    async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<String, RpcClientError> {
        let provider = self.provider.clone();
        let raw = raw_tx.to_vec();
        call_with_policies(
            "write",
            "eth_sendRawTransaction",
            &self.bucket,
            &self.breaker,
            &self.metrics,
            self.send_deadline,
            None,
            async move {
                let pending = provider
                    .send_raw_transaction(&raw)
                    .await
                    .map_err(|e| map_rpc_error("eth_sendRawTransaction", e))?;
                Ok(format!("{:#x}", pending.tx_hash()))
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::with_config(
            "read",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                success_threshold: 2,
                open_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn policies_pass_through_success() {
        let bucket = TokenBucket::new("test", 100.0);
        let breaker = test_breaker(5);
        let metrics = MetricsRegistry::new();

        let result = call_with_policies(
            "read",
            "eth_blockNumber",
            &bucket,
            &breaker,
            &metrics,
            Duration::from_secs(1),
            None,
            async { Ok::<_, RpcClientError>(42u64) },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(
            metrics
                .get_counter(
                    metric_names::RPC_REQUESTS_TOTAL,
                    &Labels::new().method("eth_blockNumber")
                )
                .await,
            1
        );
    }

    #[tokio::test]
    async fn deadline_produces_timeout_error() {
        let bucket = TokenBucket::new("test", 100.0);
        let breaker = test_breaker(5);
        let metrics = MetricsRegistry::new();

        let result: Result<(), _> = call_with_policies(
            "read",
            "eth_getLogs",
            &bucket,
            &breaker,
            &metrics,
            Duration::from_millis(10),
            None,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(RpcClientError::Timeout { .. })));
        assert_eq!(
            metrics
                .get_counter(
                    metric_names::RPC_ERRORS_TOTAL,
                    &Labels::new().method("eth_getLogs")
                )
                .await,
            1
        );
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_calling() {
        let bucket = TokenBucket::new("test", 100.0);
        let breaker = test_breaker(1);
        let metrics = MetricsRegistry::new();
        breaker.record_failure().await;

        let result: Result<(), _> = call_with_policies(
            "read",
            "eth_blockNumber",
            &bucket,
            &breaker,
            &metrics,
            Duration::from_secs(1),
            None,
            async {
                panic!("must not run while the circuit is open");
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(RpcClientError::CircuitOpen { pool: "read" })
        ));
        // No request counted for a rejected call.
        assert_eq!(
            metrics
                .get_counter(
                    metric_names::RPC_REQUESTS_TOTAL,
                    &Labels::new().method("eth_blockNumber")
                )
                .await,
            0
        );
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_breaker() {
        let bucket = TokenBucket::new("test", 100.0);
        let breaker = test_breaker(2);
        let metrics = MetricsRegistry::new();

        for _ in 0..2 {
            let _: Result<(), _> = call_with_policies(
                "read",
                "eth_getLogs",
                &bucket,
                &breaker,
                &metrics,
                Duration::from_secs(1),
                None,
                async { Err(RpcClientError::Transport("connection reset".to_string())) },
            )
            .await;
        }

        let result: Result<(), _> = call_with_policies(
            "read",
            "eth_getLogs",
            &bucket,
            &breaker,
            &metrics,
            Duration::from_secs(1),
            None,
            async { Ok(()) },
        )
        .await;
        assert!(matches!(result, Err(RpcClientError::CircuitOpen { .. })));
    }
}
