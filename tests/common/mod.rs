//! Common test utilities for the Postgres-backed integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use sqlx::postgres::PgPoolOptions;

use logflume::domain::{partition_key, IngestEvent};

/// Connect to the test database, or None when DATABASE_URL is not set.
pub async fn connect_db() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .ok()?;
    Some(pool)
}

static SEQ: AtomicU64 = AtomicU64::new(0);

/// Process-unique prefix so tests never collide on shared tables.
pub fn unique_prefix(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{name}-{nanos}-{seq}")
}

/// Build an ingest event at a given block for a given address.
pub fn make_event(prefix: &str, block: u64, tx_index: u64, address: &str) -> IngestEvent {
    let block_hash = format!("0x{prefix}-{block}");
    IngestEvent {
        event_id: format!("{block_hash}:{block}:{tx_index}:0"),
        block_number: block,
        block_hash,
        address: address.to_string(),
        topic0: Some("0xddf2".to_string()),
        partition_key: partition_key(address, 1),
        payload: json!({
            "address": address,
            "blockNumber": format!("{block:#x}"),
            "data": "0x",
            "topics": ["0xddf2"],
        }),
    }
}
