//! PostgreSQL domain outbox.
//!
//! The infrastructure tier reads only the public shape of this table
//! (`command_key, kind, payload, published_at, tx_hash`); everything else
//! in the `domain` schema belongs to the business context.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};

use crate::domain::DomainCommand;
use crate::executor::CommandSource;
use crate::infra::Result;

#[derive(Debug, FromRow)]
struct CommandRow {
    command_key: String,
    kind: String,
    payload: serde_json::Value,
    published_at: Option<DateTime<Utc>>,
    tx_hash: Option<String>,
}

impl From<CommandRow> for DomainCommand {
    fn from(row: CommandRow) -> Self {
        DomainCommand {
            command_key: row.command_key,
            kind: row.kind,
            payload: row.payload,
            published_at: row.published_at,
            tx_hash: row.tx_hash,
        }
    }
}

#[derive(Clone)]
pub struct PgDomainOutbox {
    pool: PgPool,
}

impl PgDomainOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a command inside a dispatch transaction. A duplicate
    /// `command_key` is a no-op: the first enqueue wins, which is exactly
    /// what a deterministic key is for.
    pub async fn enqueue(
        tx: &mut Transaction<'_, Postgres>,
        command_key: &str,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO domain.domain_outbox (command_key, kind, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (command_key) DO NOTHING
            "#,
        )
        .bind(command_key)
        .bind(kind)
        .bind(payload)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CommandSource for PgDomainOutbox {
    async fn pending_commands(&self, limit: i64) -> Result<Vec<DomainCommand>> {
        let rows: Vec<CommandRow> = sqlx::query_as(
            r#"
            SELECT command_key, kind, payload, published_at, tx_hash
            FROM domain.domain_outbox
            WHERE published_at IS NULL
            ORDER BY command_key ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DomainCommand::from).collect())
    }

    async fn count_pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM domain.domain_outbox WHERE published_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn settle(&self, command_key: &str, tx_hash: &str) -> Result<bool> {
        // The guard makes the update a no-op when another executor already
        // finished this command.
        let result = sqlx::query(
            r#"
            UPDATE domain.domain_outbox
            SET published_at = now(), tx_hash = $1
            WHERE command_key = $2 AND published_at IS NULL
            "#,
        )
        .bind(tx_hash)
        .bind(command_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
