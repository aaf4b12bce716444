use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which half of the protocol an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    /// Bid solicitation; no commitment to deliver
    Ping,
    /// Delivery of the full lead payload to a winner
    Post,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Ping => write!(f, "PING"),
            TransactionKind::Post => write!(f, "POST"),
        }
    }
}

/// Terminal result of one attempt against a buyer webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptOutcome {
    /// 2xx reply the engine could interpret
    Success,
    /// Per-call or auction deadline elapsed first
    Timeout,
    /// Buyer answered but declined or failed validation
    Rejected,
    /// Transport, auth, or payload-construction failure
    Error,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "SUCCESS"),
            AttemptOutcome::Timeout => write!(f, "TIMEOUT"),
            AttemptOutcome::Rejected => write!(f, "REJECTED"),
            AttemptOutcome::Error => write!(f, "ERROR"),
        }
    }
}

/// Immutable ledger row: one buyer interaction during one auction.
/// Every ping and post attempt produces exactly one of these, success
/// or not, so the ledger reconstructs the full auction after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub buyer_id: String,
    pub service_type_id: String,
    pub kind: TransactionKind,
    pub outcome: AttemptOutcome,
    /// Bid amount for pings, clearing price for posts
    pub amount: Option<Decimal>,
    /// 1-based attempt number within the retry chain
    pub attempt: u32,
    pub latency_ms: u64,
    /// Human-readable cause: decline reason, HTTP status, error text
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn ping(
        lead_id: Uuid,
        buyer_id: impl Into<String>,
        service_type_id: impl Into<String>,
        outcome: AttemptOutcome,
    ) -> Self {
        Self::record(lead_id, buyer_id, service_type_id, TransactionKind::Ping, outcome)
    }

    pub fn post(
        lead_id: Uuid,
        buyer_id: impl Into<String>,
        service_type_id: impl Into<String>,
        outcome: AttemptOutcome,
    ) -> Self {
        Self::record(lead_id, buyer_id, service_type_id, TransactionKind::Post, outcome)
    }

    fn record(
        lead_id: Uuid,
        buyer_id: impl Into<String>,
        service_type_id: impl Into<String>,
        kind: TransactionKind,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            buyer_id: buyer_id.into(),
            service_type_id: service_type_id.into(),
            kind,
            outcome,
            amount: None,
            attempt: 1,
            latency_ms: 0,
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ping_row_defaults() {
        let lead_id = Uuid::new_v4();
        let tx = Transaction::ping(lead_id, "acme", "solar", AttemptOutcome::Success)
            .with_amount(dec!(35))
            .with_latency(212);
        assert_eq!(tx.lead_id, lead_id);
        assert_eq!(tx.kind, TransactionKind::Ping);
        assert_eq!(tx.attempt, 1);
        assert_eq!(tx.amount, Some(dec!(35)));
        assert!(tx.outcome.is_success());
    }

    #[test]
    fn outcome_display_matches_storage_form() {
        assert_eq!(AttemptOutcome::Timeout.to_string(), "TIMEOUT");
        assert_eq!(AttemptOutcome::Rejected.to_string(), "REJECTED");
        assert_eq!(TransactionKind::Post.to_string(), "POST");
    }

    #[test]
    fn post_error_row_carries_detail() {
        let tx = Transaction::post(Uuid::new_v4(), "acme", "solar", AttemptOutcome::Error)
            .with_attempt(2)
            .with_detail("connect: dns failure");
        assert_eq!(tx.attempt, 2);
        assert_eq!(tx.detail.as_deref(), Some("connect: dns failure"));
    }
}
