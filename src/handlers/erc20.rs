//! Example projector: ERC-20 Transfer events into a balances table.
//!
//! Doubles as the reference implementation of the [`BatchHandler`]
//! contract: decode at the edge, write only through the dispatch
//! transaction, and let undecodable events pass (a projector is not a
//! validator).

use alloy::primitives::{Address, Bytes, LogData, B256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use crate::dispatch::BatchHandler;
use crate::domain::IngestEvent;
use crate::infra::Result;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Handler kind `"examples.erc20"`: maintains
/// `domain.erc20_balances(token, holder, balance)`.
pub struct Erc20Projector;

impl Erc20Projector {
    pub const KIND: &'static str = "examples.erc20";

    fn decode(event: &IngestEvent) -> Option<(Address, Address, String)> {
        let topics: Vec<B256> = event
            .payload
            .get("topics")?
            .as_array()?
            .iter()
            .filter_map(|t| t.as_str()?.parse().ok())
            .collect();
        if topics.first() != Some(&Transfer::SIGNATURE_HASH) {
            return None;
        }

        let data_hex = event.payload.get("data")?.as_str()?;
        let data = hex::decode(data_hex.trim_start_matches("0x")).ok()?;
        let log_data = LogData::new(topics, Bytes::from(data))?;

        let transfer = Transfer::decode_log_data(&log_data, true).ok()?;
        Some((transfer.from, transfer.to, transfer.value.to_string()))
    }

    async fn apply_delta(
        tx: &mut Transaction<'_, Postgres>,
        token: &str,
        holder: Address,
        delta: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain.erc20_balances (token, holder, balance)
            VALUES ($1, $2, $3::NUMERIC)
            ON CONFLICT (token, holder)
            DO UPDATE SET balance = domain.erc20_balances.balance + EXCLUDED.balance
            "#,
        )
        .bind(token)
        .bind(format!("{holder:#x}"))
        .bind(delta)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for Erc20Projector {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn handle(
        &self,
        events: &[IngestEvent],
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<()> {
        for event in events {
            let Some((from, to, value)) = Self::decode(event) else {
                debug!(event_id = %event.event_id, "not an ERC-20 transfer, skipping");
                continue;
            };

            // Mints (from zero) and burns (to zero) only touch one side.
            if from != Address::ZERO {
                Self::apply_delta(tx, &event.address, from, &format!("-{value}")).await?;
            }
            if to != Address::ZERO {
                Self::apply_delta(tx, &event.address, to, &value).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transfer_event(from: &str, to: &str, value_hex: &str) -> IngestEvent {
        IngestEvent {
            event_id: "0xdead:16:1:2".to_string(),
            block_number: 16,
            block_hash: "0xdead".to_string(),
            address: "0x00000000000000000000000000000000000000aa".to_string(),
            topic0: Some(format!("{:#x}", Transfer::SIGNATURE_HASH)),
            partition_key: "pk".to_string(),
            payload: json!({
                "topics": [
                    format!("{:#x}", Transfer::SIGNATURE_HASH),
                    format!("0x000000000000000000000000{from}"),
                    format!("0x000000000000000000000000{to}"),
                ],
                "data": value_hex,
            }),
        }
    }

    #[test]
    fn decodes_transfer_event() {
        let event = transfer_event(
            "1111111111111111111111111111111111111111",
            "2222222222222222222222222222222222222222",
            &format!("0x{:064x}", 1000),
        );

        let (from, to, value) = Erc20Projector::decode(&event).unwrap();
        assert_eq!(
            format!("{from:#x}"),
            "0x1111111111111111111111111111111111111111"
        );
        assert_eq!(
            format!("{to:#x}"),
            "0x2222222222222222222222222222222222222222"
        );
        assert_eq!(value, "1000");
    }

    #[test]
    fn ignores_foreign_topic0() {
        let mut event = transfer_event(
            "1111111111111111111111111111111111111111",
            "2222222222222222222222222222222222222222",
            &format!("0x{:064x}", 1),
        );
        event.payload["topics"][0] = json!(format!("0x{:064x}", 0xffu32));

        assert!(Erc20Projector::decode(&event).is_none());
    }

    #[test]
    fn ignores_malformed_data() {
        let mut event = transfer_event(
            "1111111111111111111111111111111111111111",
            "2222222222222222222222222222222222222222",
            &format!("0x{:064x}", 1),
        );
        event.payload["data"] = json!("0xzz");

        assert!(Erc20Projector::decode(&event).is_none());
    }
}
