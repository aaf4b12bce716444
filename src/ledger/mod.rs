//! Durable auction ledger.
//!
//! Two kinds of writes ever happen: append-only [`Transaction`] rows as
//! attempts complete, and exactly one [`LeadMutation`] when the auction
//! reaches its terminal state. Stores must tolerate concurrent
//! transaction appends, since ping tasks record their own attempts.

pub mod postgres;

pub use postgres::PostgresStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

use crate::breaker::BreakerSnapshot;
use crate::domain::{Lead, LeadStatus, Transaction};
use crate::error::Result;

/// Why a lead ended Rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RejectionCause {
    /// Eligibility resolution produced an empty candidate set
    NoEligibleBuyers,
    /// Buyers were pinged but none returned a valid accepting bid
    NoValidBids,
    /// Valid bids existed but every post in the cascade failed
    AllBuyersExhausted,
    /// The auction deadline expired before delivery completed
    DeadlineExceeded,
}

impl fmt::Display for RejectionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionCause::NoEligibleBuyers => "NO_ELIGIBLE_BUYERS",
            RejectionCause::NoValidBids => "NO_VALID_BIDS",
            RejectionCause::AllBuyersExhausted => "ALL_BUYERS_EXHAUSTED",
            RejectionCause::DeadlineExceeded => "DEADLINE_EXCEEDED",
        };
        write!(f, "{}", s)
    }
}

/// The single terminal write for one auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadMutation {
    pub lead_id: Uuid,
    pub status: LeadStatus,
    pub winning_buyer_id: Option<String>,
    pub winning_bid: Option<Decimal>,
    pub rejection_cause: Option<RejectionCause>,
}

impl LeadMutation {
    pub fn sold(lead_id: Uuid, buyer_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            lead_id,
            status: LeadStatus::Sold,
            winning_buyer_id: Some(buyer_id.into()),
            winning_bid: Some(amount),
            rejection_cause: None,
        }
    }

    pub fn rejected(lead_id: Uuid, cause: RejectionCause) -> Self {
        Self {
            lead_id,
            status: LeadStatus::Rejected,
            winning_buyer_id: None,
            winning_bid: None,
            rejection_cause: Some(cause),
        }
    }
}

/// Persistence seam for auctions.
#[async_trait]
pub trait AuctionStore: Send + Sync {
    /// Record the lead as received, before any buyer contact.
    async fn insert_lead(&self, lead: &Lead) -> Result<()>;

    /// Append one attempt row. Called concurrently by ping tasks.
    async fn record_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Apply the terminal mutation for an auction.
    async fn apply_lead_mutation(&self, mutation: &LeadMutation) -> Result<()>;

    /// Attempt history for one lead, oldest first.
    async fn transactions_for_lead(&self, lead_id: Uuid) -> Result<Vec<Transaction>>;

    /// Persist breaker state so restarts keep misbehaving buyers gated.
    async fn save_breaker_snapshots(&self, snapshots: &[BreakerSnapshot]) -> Result<()>;

    async fn load_breaker_snapshots(&self) -> Result<Vec<BreakerSnapshot>>;
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    leads: Mutex<BTreeMap<Uuid, Lead>>,
    transactions: Mutex<Vec<Transaction>>,
    mutations: Mutex<Vec<LeadMutation>>,
    breaker_snapshots: Mutex<BTreeMap<String, BreakerSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock(&self.transactions).clone()
    }

    pub fn mutations(&self) -> Vec<LeadMutation> {
        self.lock(&self.mutations).clone()
    }

    pub fn lead(&self, lead_id: Uuid) -> Option<Lead> {
        self.lock(&self.leads).get(&lead_id).cloned()
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AuctionStore for MemoryStore {
    async fn insert_lead(&self, lead: &Lead) -> Result<()> {
        self.lock(&self.leads).insert(lead.id, lead.clone());
        Ok(())
    }

    async fn record_transaction(&self, tx: &Transaction) -> Result<()> {
        self.lock(&self.transactions).push(tx.clone());
        Ok(())
    }

    async fn apply_lead_mutation(&self, mutation: &LeadMutation) -> Result<()> {
        if let Some(lead) = self.lock(&self.leads).get_mut(&mutation.lead_id) {
            lead.status = mutation.status;
            lead.winning_buyer_id = mutation.winning_buyer_id.clone();
            lead.winning_bid = mutation.winning_bid;
        }
        self.lock(&self.mutations).push(mutation.clone());
        Ok(())
    }

    async fn transactions_for_lead(&self, lead_id: Uuid) -> Result<Vec<Transaction>> {
        Ok(self
            .lock(&self.transactions)
            .iter()
            .filter(|tx| tx.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn save_breaker_snapshots(&self, snapshots: &[BreakerSnapshot]) -> Result<()> {
        let mut map = self.lock(&self.breaker_snapshots);
        for snapshot in snapshots {
            map.insert(snapshot.buyer_id.clone(), snapshot.clone());
        }
        Ok(())
    }

    async fn load_breaker_snapshots(&self) -> Result<Vec<BreakerSnapshot>> {
        Ok(self.lock(&self.breaker_snapshots).values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttemptOutcome;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn mutation_updates_the_stored_lead() {
        let store = MemoryStore::new();
        let lead = Lead::new("solar", "90210");
        let lead_id = lead.id;
        store.insert_lead(&lead).await.unwrap();

        store
            .apply_lead_mutation(&LeadMutation::sold(lead_id, "acme", dec!(42)))
            .await
            .unwrap();

        let stored = store.lead(lead_id).unwrap();
        assert_eq!(stored.status, LeadStatus::Sold);
        assert_eq!(stored.winning_buyer_id.as_deref(), Some("acme"));
        assert_eq!(stored.winning_bid, Some(dec!(42)));
        assert_eq!(store.mutations().len(), 1);
    }

    #[tokio::test]
    async fn transaction_history_filters_by_lead() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        for (lead_id, buyer) in [(a, "acme"), (a, "beta"), (b, "acme")] {
            store
                .record_transaction(&Transaction::ping(
                    lead_id,
                    buyer,
                    "solar",
                    AttemptOutcome::Success,
                ))
                .await
                .unwrap();
        }

        assert_eq!(store.transactions_for_lead(a).await.unwrap().len(), 2);
        assert_eq!(store.transactions_for_lead(b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn breaker_snapshots_upsert_by_buyer() {
        let store = MemoryStore::new();
        let breaker = crate::breaker::BuyerBreaker::new(
            "acme",
            crate::breaker::BreakerConfig::default(),
        );

        let first = breaker.snapshot().await;
        store.save_breaker_snapshots(&[first.clone()]).await.unwrap();
        store.save_breaker_snapshots(&[first]).await.unwrap();

        assert_eq!(store.load_breaker_snapshots().await.unwrap().len(), 1);
    }

    #[test]
    fn rejection_causes_have_storage_form() {
        assert_eq!(RejectionCause::NoValidBids.to_string(), "NO_VALID_BIDS");
        assert_eq!(
            RejectionCause::DeadlineExceeded.to_string(),
            "DEADLINE_EXCEEDED"
        );
    }
}
