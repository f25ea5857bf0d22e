//! Environment-driven configuration.
//!
//! Missing or malformed required values refuse to start the process
//! (non-zero exit); everything else has a sensible default.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatch::DispatcherConfig;
use crate::domain::Subscription;
use crate::executor::ExecutorConfig;
use crate::infra::{IndexerError, Result};
use crate::ingest::{PublisherConfig, ScannerConfig};
use crate::rpc::{ReadClientConfig, WriteClientConfig};

/// Process-wide configuration assembled from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_db_connections: u32,
    pub metrics_addr: SocketAddr,
    pub read_client: ReadClientConfig,
    /// Absent when no write URL is configured; required by the executor
    pub write_client: Option<WriteClientConfig>,
    pub scanner: ScannerConfig,
    pub publisher: PublisherConfig,
    pub dispatcher: DispatcherConfig,
    pub executor: ExecutorConfig,
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| IndexerError::Configuration(format!("{key} is required")))
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| IndexerError::Configuration(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Parse the `SUBSCRIPTIONS` value: a JSON list of `{address?, topic0?}`.
pub fn parse_subscriptions(raw: &str) -> Result<Vec<Subscription>> {
    serde_json::from_str(raw)
        .map_err(|e| IndexerError::Configuration(format!("invalid SUBSCRIPTIONS: {e}")))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let rpc_read_url = required("RPC_READ_URL")?;
        let rpc_write_url = std::env::var("RPC_WRITE_URL").ok();

        let poll_interval_ms: u64 = parsed_or("POLL_INTERVAL_MS", 300)?;
        let step_init: u64 = parsed_or("STEP_INIT", 1_000)?;
        let step_min: u64 = parsed_or("STEP_MIN", 1)?.max(1);
        let step_max: u64 = parsed_or("STEP_MAX", 20_000)?;
        if step_min > step_max {
            return Err(IndexerError::Configuration(format!(
                "STEP_MIN ({step_min}) must not exceed STEP_MAX ({step_max})"
            )));
        }

        let subscriptions = match std::env::var("SUBSCRIPTIONS") {
            Ok(raw) => parse_subscriptions(&raw)?,
            Err(_) => Vec::new(),
        };

        let scanner = ScannerConfig {
            cursor_id: parsed_or("CURSOR_ID", "default:shard-0".to_string())?,
            start_block: parsed_or("START_BLOCK", 0)?,
            poll_interval: Duration::from_millis(poll_interval_ms),
            step_init,
            step_min,
            step_max,
            address_shards: parsed_or("ADDRESS_SHARDS", 1)?,
            subscriptions,
        };

        let read_client = ReadClientConfig {
            url: rpc_read_url,
            head_rps: parsed_or("HEAD_RPS", 10.0)?,
            logs_rps: parsed_or("LOGS_RPS", 5.0)?,
            ..ReadClientConfig::default()
        };

        let write_client = rpc_write_url
            .map(|url| -> Result<WriteClientConfig> {
                Ok(WriteClientConfig {
                    url,
                    rps: parsed_or("WRITE_RPS", 2.0)?,
                    ..WriteClientConfig::default()
                })
            })
            .transpose()?;

        let publisher = PublisherConfig {
            batch_size: parsed_or("PUBLISH_BATCH_SIZE", 500)?,
            ..PublisherConfig::default()
        };

        let dispatcher = DispatcherConfig {
            handler_kind: std::env::var("HANDLER_KIND").unwrap_or_default(),
            partition_selector: std::env::var("PARTITION_SELECTOR").unwrap_or_default(),
            batch_size: parsed_or("DISPATCH_BATCH_SIZE", 200)?,
            max_attempts: parsed_or("MAX_ATTEMPTS", 3)?,
            ..DispatcherConfig::default()
        };

        let executor = ExecutorConfig {
            batch_size: parsed_or("EXECUTOR_BATCH_SIZE", 100)?,
            enabled: parsed_or("EXECUTOR_ENABLED", true)?,
            ..ExecutorConfig::default()
        };

        Ok(Self {
            database_url,
            max_db_connections: parsed_or("MAX_DB_CONNECTIONS", 10)?,
            metrics_addr: parsed_or("METRICS_ADDR", "0.0.0.0:9090".parse().unwrap())?,
            read_client,
            write_client,
            scanner,
            publisher,
            dispatcher,
            executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_parse_address_and_topic_filters() {
        let subs = parse_subscriptions(
            r#"[{"address": "0xaa"}, {"topic0": "0xddf2"}, {"address": "0xbb", "topic0": "0xddf2"}]"#,
        )
        .unwrap();

        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].address.as_deref(), Some("0xaa"));
        assert!(subs[0].topic0.is_none());
        assert_eq!(subs[1].topic0.as_deref(), Some("0xddf2"));
        assert_eq!(subs[2].address.as_deref(), Some("0xbb"));
    }

    #[test]
    fn empty_subscription_list_is_valid() {
        assert!(parse_subscriptions("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_subscriptions_are_fatal() {
        assert!(matches!(
            parse_subscriptions("{not json"),
            Err(IndexerError::Configuration(_))
        ));
    }
}
