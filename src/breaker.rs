//! Per-buyer circuit breakers.
//!
//! A buyer whose webhook keeps failing is cut out of auctions entirely
//! instead of burning the ping window on a dead endpoint. Consecutive
//! failures trip the circuit; after a cooldown the next auction admits a
//! limited number of probe requests, and a probe success closes the
//! circuit again.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, buyer participates in auctions
    Closed,
    /// Failure threshold exceeded, buyer excluded
    Open,
    /// Cooldown elapsed, limited probe traffic allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Why a circuit was tripped
#[derive(Debug, Clone)]
pub enum TripReason {
    ConsecutiveFailures(u32),
    ProbeFailed,
    Manual(String),
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveFailures(n) => write!(f, "{} consecutive failures", n),
            TripReason::ProbeFailed => write!(f, "half-open probe failed"),
            TripReason::Manual(reason) => write!(f, "manual: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Seconds to wait in Open before admitting probes
    pub cooldown_secs: u64,
    /// Probe requests admitted per HalfOpen episode
    pub half_open_probes: u32,
    /// Probe successes needed to close the circuit
    pub half_open_success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            half_open_probes: 1,
            half_open_success_threshold: 1,
        }
    }
}

/// Outcome of asking the breaker whether a buyer may be contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    Block { retry_in_secs: u64 },
}

impl BreakerDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BreakerDecision::Allow)
    }
}

/// Circuit breaker for one buyer's webhooks.
pub struct BuyerBreaker {
    buyer_id: String,
    config: BreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<DateTime<Utc>>>,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_failure: RwLock<Option<DateTime<Utc>>>,
    last_trip_reason: RwLock<Option<TripReason>>,
    half_open_probes_used: AtomicU32,
    half_open_successes: AtomicU32,
    total_trips: AtomicU64,
}

impl BuyerBreaker {
    pub fn new(buyer_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            buyer_id: buyer_id.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            last_success: RwLock::new(None),
            last_failure: RwLock::new(None),
            last_trip_reason: RwLock::new(None),
            half_open_probes_used: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            total_trips: AtomicU64::new(0),
        }
    }

    pub fn buyer_id(&self) -> &str {
        &self.buyer_id
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Decide whether this buyer may be contacted for one request.
    ///
    /// Call once per candidate admission: in HalfOpen a positive answer
    /// consumes one probe from the episode's budget.
    pub async fn allow_request(&self) -> BreakerDecision {
        match self.state().await {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                if self.cooldown_elapsed().await {
                    self.transition_to_half_open().await;
                    self.allow_probe().await
                } else {
                    BreakerDecision::Block {
                        retry_in_secs: self.time_until_recovery().await,
                    }
                }
            }
            CircuitState::HalfOpen => self.allow_probe().await,
        }
    }

    async fn allow_probe(&self) -> BreakerDecision {
        let used = self.half_open_probes_used.load(Ordering::SeqCst);
        if used >= self.config.half_open_probes {
            return BreakerDecision::Block {
                retry_in_secs: self.time_until_recovery().await,
            };
        }
        self.half_open_probes_used.fetch_add(1, Ordering::SeqCst);
        BreakerDecision::Allow
    }

    /// Record a successful ping or post.
    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_success.write().await = Some(Utc::now());

        if self.state().await == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.half_open_success_threshold {
                self.close().await;
            }
        }
    }

    /// Record an outcome that proves the endpoint is answering without
    /// being a chargeable success (an explicit decline, an out-of-bounds
    /// bid). Leaves the failure count alone, but resolves a HalfOpen
    /// probe: a buyer that answers is back, whatever the answer was.
    pub async fn record_neutral(&self) {
        if self.state().await == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.half_open_success_threshold {
                self.close().await;
            }
        }
    }

    /// Record a chargeable failure (timeout, transport error, or a
    /// post-phase rejection of a committed delivery).
    pub async fn record_failure(&self, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_failure.write().await = Some(Utc::now());

        debug!(buyer_id = %self.buyer_id, failures, reason, "webhook failure recorded");

        if self.state().await == CircuitState::HalfOpen {
            self.trip(TripReason::ProbeFailed).await;
            return;
        }

        if failures >= self.config.failure_threshold {
            self.trip(TripReason::ConsecutiveFailures(failures)).await;
        }
    }

    pub async fn trip(&self, reason: TripReason) {
        let mut state = self.state.write().await;
        if *state != CircuitState::Open {
            *state = CircuitState::Open;
            *self.opened_at.write().await = Some(Utc::now());
            *self.last_trip_reason.write().await = Some(reason.clone());
            self.half_open_probes_used.store(0, Ordering::SeqCst);
            self.half_open_successes.store(0, Ordering::SeqCst);
            self.total_trips.fetch_add(1, Ordering::SeqCst);

            warn!(buyer_id = %self.buyer_id, %reason, "circuit TRIPPED");
        }
    }

    pub async fn manual_trip(&self, reason: &str) {
        self.trip(TripReason::Manual(reason.to_string())).await;
    }

    async fn transition_to_half_open(&self) {
        let mut state = self.state.write().await;
        if *state == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            self.half_open_probes_used.store(0, Ordering::SeqCst);
            self.half_open_successes.store(0, Ordering::SeqCst);
            info!(buyer_id = %self.buyer_id, "circuit half-open, probing");
        }
    }

    /// Close the circuit and resume normal participation.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.write().await = None;
        self.half_open_probes_used.store(0, Ordering::SeqCst);
        self.half_open_successes.store(0, Ordering::SeqCst);

        info!(buyer_id = %self.buyer_id, "circuit CLOSED");
    }

    async fn cooldown_elapsed(&self) -> bool {
        if let Some(opened_at) = *self.opened_at.read().await {
            let elapsed = Utc::now().signed_duration_since(opened_at).num_seconds() as u64;
            elapsed >= self.config.cooldown_secs
        } else {
            false
        }
    }

    async fn time_until_recovery(&self) -> u64 {
        if let Some(opened_at) = *self.opened_at.read().await {
            let elapsed = Utc::now().signed_duration_since(opened_at).num_seconds() as u64;
            self.config.cooldown_secs.saturating_sub(elapsed)
        } else {
            self.config.cooldown_secs
        }
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            buyer_id: self.buyer_id.clone(),
            state: self.state().await,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            opened_at: *self.opened_at.read().await,
            last_failure: *self.last_failure.read().await,
            last_trip_reason: self
                .last_trip_reason
                .read()
                .await
                .as_ref()
                .map(|r| r.to_string()),
            total_trips: self.total_trips.load(Ordering::SeqCst),
            taken_at: Utc::now(),
        }
    }

    /// Rehydrate state saved by a previous process. An Open circuit
    /// whose cooldown already elapsed will move to HalfOpen on the next
    /// `allow_request`, so stale snapshots resolve themselves.
    pub async fn restore(&self, snapshot: &BreakerSnapshot) {
        *self.state.write().await = snapshot.state;
        self.consecutive_failures
            .store(snapshot.consecutive_failures, Ordering::SeqCst);
        *self.opened_at.write().await = snapshot.opened_at;
        *self.last_failure.write().await = snapshot.last_failure;
        self.total_trips.store(snapshot.total_trips, Ordering::SeqCst);
    }
}

/// Durable form of one buyer's breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub buyer_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_trip_reason: Option<String>,
    pub total_trips: u64,
    pub taken_at: DateTime<Utc>,
}

/// One breaker per buyer, created lazily on first contact.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<BuyerBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn for_buyer(&self, buyer_id: &str) -> Arc<BuyerBreaker> {
        self.breakers
            .entry(buyer_id.to_string())
            .or_insert_with(|| {
                Arc::new(BuyerBreaker::new(buyer_id.to_string(), self.config.clone()))
            })
            .clone()
    }

    pub async fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let handles: Vec<Arc<BuyerBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for breaker in handles {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots
    }

    pub async fn restore_all(&self, snapshots: &[BreakerSnapshot]) {
        for snapshot in snapshots {
            let breaker = self.for_buyer(&snapshot.buyer_id);
            breaker.restore(snapshot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripping_config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn starts_closed_and_allows() {
        let cb = BuyerBreaker::new("acme", BreakerConfig::default());
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.allow_request().await.is_allowed());
    }

    #[tokio::test]
    async fn trips_after_threshold_failures() {
        let cb = BuyerBreaker::new("acme", tripping_config(3));

        cb.record_failure("timeout").await;
        cb.record_failure("timeout").await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure("timeout").await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.allow_request().await.is_allowed());
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = BuyerBreaker::new("acme", tripping_config(3));

        cb.record_failure("timeout").await;
        cb.record_failure("timeout").await;
        cb.record_success().await;

        cb.record_failure("timeout").await;
        cb.record_failure("timeout").await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_probe() {
        let config = BreakerConfig {
            cooldown_secs: 0,
            half_open_probes: 1,
            ..Default::default()
        };
        let cb = BuyerBreaker::new("acme", config);

        cb.manual_trip("test").await;
        assert_eq!(cb.state().await, CircuitState::Open);

        // First request after cooldown becomes the probe.
        assert!(cb.allow_request().await.is_allowed());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // Budget exhausted until the probe resolves.
        assert!(!cb.allow_request().await.is_allowed());
    }

    #[tokio::test]
    async fn probe_success_closes_probe_failure_retrips() {
        let config = BreakerConfig {
            cooldown_secs: 0,
            ..Default::default()
        };

        let cb = BuyerBreaker::new("acme", config.clone());
        cb.manual_trip("test").await;
        assert!(cb.allow_request().await.is_allowed());
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        let cb = BuyerBreaker::new("beta", config);
        cb.manual_trip("test").await;
        assert!(cb.allow_request().await.is_allowed());
        cb.record_failure("still down").await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn neutral_answer_resolves_a_probe() {
        let config = BreakerConfig {
            cooldown_secs: 0,
            ..Default::default()
        };
        let cb = BuyerBreaker::new("acme", config);

        cb.manual_trip("test").await;
        assert!(cb.allow_request().await.is_allowed());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // A decline proves the endpoint is alive; the buyer must not
        // stay locked out of every later auction.
        cb.record_neutral().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.allow_request().await.is_allowed());
    }

    #[tokio::test]
    async fn neutral_answer_keeps_the_failure_count() {
        let cb = BuyerBreaker::new("acme", tripping_config(3));

        cb.record_failure("timeout").await;
        cb.record_failure("timeout").await;
        cb.record_neutral().await;

        cb.record_failure("timeout").await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let cb = BuyerBreaker::new("acme", tripping_config(1));
        cb.record_failure("timeout").await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let snapshot = cb.snapshot().await;

        let registry = BreakerRegistry::new(BreakerConfig::default());
        registry.restore_all(std::slice::from_ref(&snapshot)).await;

        let restored = registry.for_buyer("acme");
        assert_eq!(restored.state().await, CircuitState::Open);
        assert_eq!(restored.snapshot().await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn registry_reuses_breaker_per_buyer() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.for_buyer("acme");
        let b = registry.for_buyer("acme");
        a.manual_trip("test").await;
        assert_eq!(b.state().await, CircuitState::Open);
    }
}
