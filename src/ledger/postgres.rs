//! PostgreSQL-backed auction store.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{AuctionStore, LeadMutation};
use crate::breaker::{BreakerSnapshot, CircuitState};
use crate::domain::{AttemptOutcome, Lead, Transaction, TransactionKind};
use crate::error::{EngineError, Result};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AuctionStore for PostgresStore {
    #[instrument(skip(self, lead), fields(lead_id = %lead.id))]
    async fn insert_lead(&self, lead: &Lead) -> Result<()> {
        let answers = serde_json::to_string(&lead.answers)?;
        let attestations = serde_json::to_string(&lead.attestations)?;

        sqlx::query(
            r#"
            INSERT INTO leads
                (id, service_type_id, zip, quality_score, answers, attestations,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(lead.id)
        .bind(&lead.service_type_id)
        .bind(&lead.zip)
        .bind(lead.quality_score as i16)
        .bind(answers)
        .bind(attestations)
        .bind(lead.status.to_string())
        .bind(lead.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, tx), fields(lead_id = %tx.lead_id, buyer_id = %tx.buyer_id))]
    async fn record_transaction(&self, tx: &Transaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, lead_id, buyer_id, service_type_id, kind, outcome,
                 amount, attempt, latency_ms, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(tx.id)
        .bind(tx.lead_id)
        .bind(&tx.buyer_id)
        .bind(&tx.service_type_id)
        .bind(tx.kind.to_string())
        .bind(tx.outcome.to_string())
        .bind(tx.amount)
        .bind(tx.attempt as i32)
        .bind(tx.latency_ms as i64)
        .bind(&tx.detail)
        .bind(tx.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, mutation), fields(lead_id = %mutation.lead_id))]
    async fn apply_lead_mutation(&self, mutation: &LeadMutation) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE leads SET
                status = $2,
                winning_buyer_id = $3,
                winning_bid = $4,
                rejection_cause = $5,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(mutation.lead_id)
        .bind(mutation.status.to_string())
        .bind(&mutation.winning_buyer_id)
        .bind(mutation.winning_bid)
        .bind(mutation.rejection_cause.map(|c| c.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transactions_for_lead(&self, lead_id: Uuid) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, lead_id, buyer_id, service_type_id, kind, outcome,
                   amount, attempt, latency_ms, detail, created_at
            FROM transactions
            WHERE lead_id = $1
            ORDER BY created_at ASC, attempt ASC
            "#,
        )
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let kind_str: String = row.get("kind");
                let outcome_str: String = row.get("outcome");
                let attempt: i32 = row.get("attempt");
                let latency_ms: i64 = row.get("latency_ms");

                Ok(Transaction {
                    id: row.get("id"),
                    lead_id: row.get("lead_id"),
                    buyer_id: row.get("buyer_id"),
                    service_type_id: row.get("service_type_id"),
                    kind: parse_kind(&kind_str)?,
                    outcome: parse_outcome(&outcome_str)?,
                    amount: row.get("amount"),
                    attempt: attempt as u32,
                    latency_ms: latency_ms as u64,
                    detail: row.get("detail"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self, snapshots), fields(count = snapshots.len()))]
    async fn save_breaker_snapshots(&self, snapshots: &[BreakerSnapshot]) -> Result<()> {
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO breaker_states
                    (buyer_id, state, consecutive_failures, opened_at,
                     last_failure, last_trip_reason, total_trips, taken_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (buyer_id) DO UPDATE SET
                    state = EXCLUDED.state,
                    consecutive_failures = EXCLUDED.consecutive_failures,
                    opened_at = EXCLUDED.opened_at,
                    last_failure = EXCLUDED.last_failure,
                    last_trip_reason = EXCLUDED.last_trip_reason,
                    total_trips = EXCLUDED.total_trips,
                    taken_at = EXCLUDED.taken_at
                "#,
            )
            .bind(&snapshot.buyer_id)
            .bind(snapshot.state.to_string())
            .bind(snapshot.consecutive_failures as i32)
            .bind(snapshot.opened_at)
            .bind(snapshot.last_failure)
            .bind(&snapshot.last_trip_reason)
            .bind(snapshot.total_trips as i64)
            .bind(snapshot.taken_at)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn load_breaker_snapshots(&self) -> Result<Vec<BreakerSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT buyer_id, state, consecutive_failures, opened_at,
                   last_failure, last_trip_reason, total_trips, taken_at
            FROM breaker_states
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let state_str: String = row.get("state");
                let consecutive_failures: i32 = row.get("consecutive_failures");
                let total_trips: i64 = row.get("total_trips");

                Ok(BreakerSnapshot {
                    buyer_id: row.get("buyer_id"),
                    state: parse_circuit(&state_str)?,
                    consecutive_failures: consecutive_failures as u32,
                    opened_at: row.get("opened_at"),
                    last_failure: row.get("last_failure"),
                    last_trip_reason: row.get("last_trip_reason"),
                    total_trips: total_trips as u64,
                    taken_at: row.get("taken_at"),
                })
            })
            .collect()
    }
}

fn parse_kind(raw: &str) -> Result<TransactionKind> {
    match raw {
        "PING" => Ok(TransactionKind::Ping),
        "POST" => Ok(TransactionKind::Post),
        other => Err(EngineError::Internal(format!(
            "unknown transaction kind '{other}' in ledger"
        ))),
    }
}

fn parse_outcome(raw: &str) -> Result<AttemptOutcome> {
    match raw {
        "SUCCESS" => Ok(AttemptOutcome::Success),
        "TIMEOUT" => Ok(AttemptOutcome::Timeout),
        "REJECTED" => Ok(AttemptOutcome::Rejected),
        "ERROR" => Ok(AttemptOutcome::Error),
        other => Err(EngineError::Internal(format!(
            "unknown attempt outcome '{other}' in ledger"
        ))),
    }
}

fn parse_circuit(raw: &str) -> Result<CircuitState> {
    match raw {
        "closed" => Ok(CircuitState::Closed),
        "open" => Ok(CircuitState::Open),
        "half-open" => Ok(CircuitState::HalfOpen),
        other => Err(EngineError::Internal(format!(
            "unknown circuit state '{other}' in ledger"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_forms_round_trip() {
        assert_eq!(parse_kind("PING").unwrap(), TransactionKind::Ping);
        assert_eq!(parse_outcome("TIMEOUT").unwrap(), AttemptOutcome::Timeout);
        assert_eq!(parse_circuit("half-open").unwrap(), CircuitState::HalfOpen);
        assert!(parse_kind("JUNK").is_err());
    }
}
