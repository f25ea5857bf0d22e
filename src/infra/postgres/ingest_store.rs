//! PostgreSQL ingest store: append-only events, paired outbox, cursors.

use async_trait::async_trait;
use sqlx::postgres::PgPool;

use crate::domain::IngestEvent;
use crate::infra::Result;
use crate::ingest::{IngestSink, OutboxSource};

/// Store shared by the scanner (chunk appends) and the publisher (outbox
/// pump).
#[derive(Clone)]
pub struct PgIngestStore {
    pool: PgPool,
}

impl PgIngestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Outbox rows not yet stamped, for the status surface.
    pub async fn pending_outbox_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM infra.ingest_outbox WHERE published_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// All cursors, for the status surface.
    pub async fn cursors(&self) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT id, last_processed_block FROM infra.cursors ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, block)| (id, block as u64))
            .collect())
    }
}

#[async_trait]
impl IngestSink for PgIngestStore {
    async fn last_processed_block(&self, cursor_id: &str) -> Result<Option<u64>> {
        let block: Option<i64> =
            sqlx::query_scalar("SELECT last_processed_block FROM infra.cursors WHERE id = $1")
                .bind(cursor_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(block.map(|b| b as u64))
    }

    async fn append_chunk(
        &self,
        cursor_id: &str,
        events: &[IngestEvent],
        to_block: u64,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for event in events {
            let result = sqlx::query(
                r#"
                INSERT INTO infra.ingest_events
                    (event_id, block_number, block_hash, address, topic0, partition_key, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&event.event_id)
            .bind(event.block_number as i64)
            .bind(&event.block_hash)
            .bind(&event.address)
            .bind(&event.topic0)
            .bind(&event.partition_key)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();

            sqlx::query(
                r#"
                INSERT INTO infra.ingest_outbox (event_id)
                VALUES ($1)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&event.event_id)
            .execute(&mut *tx)
            .await?;
        }

        // GREATEST keeps the cursor monotone even if a stale scanner
        // commits late.
        sqlx::query(
            r#"
            INSERT INTO infra.cursors (id, last_processed_block, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (id) DO UPDATE
            SET last_processed_block =
                    GREATEST(infra.cursors.last_processed_block, EXCLUDED.last_processed_block),
                updated_at = now()
            "#,
        )
        .bind(cursor_id)
        .bind(to_block as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl OutboxSource for PgIngestStore {
    async fn unpublished_batch(&self, limit: i64) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT event_id FROM infra.ingest_outbox
            WHERE published_at IS NULL
            ORDER BY event_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn mark_published(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE infra.ingest_outbox
            SET published_at = now()
            WHERE event_id = $1 AND published_at IS NULL
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
