//! PostgreSQL inbox store: the per-`(event_id, handler_kind)` records that
//! guarantee at-most-once handler effects, plus the operator tooling over
//! them (replay, failure reset, status counts).

use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};

use crate::domain::IngestEvent;
use crate::infra::Result;

#[derive(Debug, FromRow)]
struct CandidateRow {
    event_id: String,
    block_number: i64,
    block_hash: String,
    address: String,
    topic0: Option<String>,
    partition_key: String,
    payload: serde_json::Value,
}

impl From<CandidateRow> for IngestEvent {
    fn from(row: CandidateRow) -> Self {
        IngestEvent {
            event_id: row.event_id,
            block_number: row.block_number as u64,
            block_hash: row.block_hash,
            address: row.address,
            topic0: row.topic0,
            partition_key: row.partition_key,
            payload: row.payload,
        }
    }
}

/// Per-handler-kind, per-status row count for the status surface.
#[derive(Debug, Clone, FromRow)]
pub struct InboxStatusCount {
    pub handler_kind: String,
    pub status: String,
    pub count: i64,
}

#[derive(Clone)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Published events matching the partition selector that this handler
    /// kind may still process, in block order. Eligible events either have
    /// no inbox row yet, or carry a PENDING row put back by the replay /
    /// reset tools. ACK and DLQ are terminal; FAIL waits for an operator
    /// reset.
    pub async fn select_candidates(
        &self,
        partition_selector: &str,
        handler_kind: &str,
        limit: i64,
    ) -> Result<Vec<IngestEvent>> {
        let rows: Vec<CandidateRow> = sqlx::query_as(
            r#"
            SELECT e.event_id, e.block_number, e.block_hash, e.address,
                   e.topic0, e.partition_key, e.payload
            FROM infra.ingest_events e
            JOIN infra.ingest_outbox o ON o.event_id = e.event_id
            WHERE o.published_at IS NOT NULL
              AND e.partition_key LIKE $1 || '%'
              AND NOT EXISTS (
                  SELECT 1 FROM infra.inbox i
                  WHERE i.event_id = e.event_id
                    AND i.handler_kind = $2
                    AND i.status <> 'PENDING'
              )
            ORDER BY e.block_number ASC
            LIMIT $3
            "#,
        )
        .bind(partition_selector)
        .bind(handler_kind)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(IngestEvent::from).collect())
    }

    /// Claim the batch: insert PENDING rows for unseen events and re-claim
    /// rows an operator put back to PENDING. The returned ids are the rows
    /// this transaction owns; anything claimed or settled by another
    /// worker is skipped. Concurrent claimers serialize on the row lock,
    /// and the `status = 'PENDING'` guard is re-checked after the winner
    /// commits, so no event is ever handed to two workers.
    pub async fn claim_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        handler_kind: &str,
        events: &[IngestEvent],
    ) -> Result<Vec<String>> {
        let event_ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();
        let block_numbers: Vec<i64> = events.iter().map(|e| e.block_number as i64).collect();
        let partition_keys: Vec<String> = events.iter().map(|e| e.partition_key.clone()).collect();

        let claimed: Vec<String> = sqlx::query_scalar(
            r#"
            INSERT INTO infra.inbox AS ib
                (event_id, handler_kind, status, attempts, block_number, partition_key, first_seen_at)
            SELECT t.event_id, $1, 'PENDING', 0, t.block_number, t.partition_key, now()
            FROM UNNEST($2::TEXT[], $3::BIGINT[], $4::TEXT[])
                 AS t(event_id, block_number, partition_key)
            ON CONFLICT (event_id, handler_kind)
            DO UPDATE SET status = 'PENDING'
            WHERE ib.status = 'PENDING'
            RETURNING event_id
            "#,
        )
        .bind(handler_kind)
        .bind(&event_ids)
        .bind(&block_numbers)
        .bind(&partition_keys)
        .fetch_all(&mut **tx)
        .await?;

        Ok(claimed)
    }

    /// Settle a successfully handled batch to ACK.
    pub async fn settle_ack(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        handler_kind: &str,
        event_ids: &[String],
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE infra.inbox
            SET status = 'ACK',
                attempts = attempts + 1,
                last_attempt_at = now(),
                last_error = NULL
            WHERE handler_kind = $1 AND event_id = ANY($2)
            "#,
        )
        .bind(handler_kind)
        .bind(event_ids)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Settle a failed batch to FAIL, or DLQ once the attempt budget is
    /// exhausted. Returns how many rows went to DLQ.
    pub async fn settle_failure(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        handler_kind: &str,
        event_ids: &[String],
        error: &str,
        max_attempts: i32,
    ) -> Result<u64> {
        let statuses: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE infra.inbox
            SET attempts = attempts + 1,
                last_attempt_at = now(),
                last_error = $3,
                status = CASE
                    WHEN attempts + 1 >= $4 THEN 'DLQ'::infra.inbox_status
                    ELSE 'FAIL'::infra.inbox_status
                END
            WHERE handler_kind = $1 AND event_id = ANY($2)
            RETURNING status::TEXT
            "#,
        )
        .bind(handler_kind)
        .bind(event_ids)
        .bind(error)
        .bind(max_attempts)
        .fetch_all(&mut **tx)
        .await?;

        Ok(statuses.iter().filter(|s| s.as_str() == "DLQ").count() as u64)
    }

    /// Upsert inbox rows back to PENDING for every published event in the
    /// block range. New rows start at zero attempts; existing rows keep
    /// their attempt count but lose FAIL/DLQ status and `last_error`.
    /// Returns `(inserted, reset)`.
    pub async fn replay_range(
        &self,
        handler_kind: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<(u64, u64)> {
        let inserted_flags: Vec<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO infra.inbox
                (event_id, handler_kind, status, attempts, block_number, partition_key, first_seen_at)
            SELECT e.event_id, $1, 'PENDING', 0, e.block_number, e.partition_key, now()
            FROM infra.ingest_events e
            JOIN infra.ingest_outbox o ON o.event_id = e.event_id
            WHERE o.published_at IS NOT NULL
              AND e.block_number BETWEEN $2 AND $3
            ON CONFLICT (event_id, handler_kind)
            DO UPDATE SET status = 'PENDING', last_error = NULL
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(handler_kind)
        .bind(from_block as i64)
        .bind(to_block as i64)
        .fetch_all(&self.pool)
        .await?;

        let inserted = inserted_flags.iter().filter(|i| **i).count() as u64;
        let reset = inserted_flags.len() as u64 - inserted;
        Ok((inserted, reset))
    }

    /// Reset FAIL rows (and optionally DLQ rows) back to PENDING. Returns
    /// the number of rows reset.
    pub async fn reset_failures(&self, handler_kind: &str, include_dlq: bool) -> Result<u64> {
        let statuses: Vec<&str> = if include_dlq {
            vec!["FAIL", "DLQ"]
        } else {
            vec!["FAIL"]
        };
        let statuses: Vec<String> = statuses.into_iter().map(String::from).collect();

        let result = sqlx::query(
            r#"
            UPDATE infra.inbox
            SET status = 'PENDING', last_error = NULL
            WHERE handler_kind = $1 AND status::TEXT = ANY($2)
            "#,
        )
        .bind(handler_kind)
        .bind(&statuses)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Row counts per handler kind and status, for the status surface.
    pub async fn status_counts(&self) -> Result<Vec<InboxStatusCount>> {
        let counts: Vec<InboxStatusCount> = sqlx::query_as(
            r#"
            SELECT handler_kind, status::TEXT AS status, COUNT(*) AS count
            FROM infra.inbox
            GROUP BY handler_kind, status
            ORDER BY handler_kind, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }
}
