use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One buyer's answer to a ping, normalized for winner selection.
///
/// `priority_rank` and `arrival_seq` are the deterministic tie-breakers:
/// lower rank wins, then earlier arrival. `arrival_seq` is assigned by
/// the collector in completion order, so re-running selection over the
/// same bid set always yields the same winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub buyer_id: String,
    pub accepted: bool,
    /// Effective amount after bounds policy; zero for declines
    pub amount: Decimal,
    pub latency_ms: u64,
    pub priority_rank: u32,
    pub arrival_seq: u64,
}

impl Bid {
    pub fn accepted(buyer_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            buyer_id: buyer_id.into(),
            accepted: true,
            amount,
            latency_ms: 0,
            priority_rank: u32::MAX,
            arrival_seq: 0,
        }
    }

    pub fn declined(buyer_id: impl Into<String>) -> Self {
        Self {
            buyer_id: buyer_id.into(),
            accepted: false,
            amount: Decimal::ZERO,
            latency_ms: 0,
            priority_rank: u32::MAX,
            arrival_seq: 0,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_priority_rank(mut self, rank: u32) -> Self {
        self.priority_rank = rank;
        self
    }

    pub fn with_arrival_seq(mut self, seq: u64) -> Self {
        self.arrival_seq = seq;
        self
    }
}
