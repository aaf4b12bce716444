//! Ping fan-out: solicit bids from every admitted buyer at once.
//!
//! One tokio task per prospect, joined under a global phase deadline.
//! Each task runs its own timeout/retry chain and appends its own
//! ledger rows, so an abort at the deadline loses nothing already
//! attempted. A buyer still pending when the deadline fires is written
//! off as a timeout and charged against its circuit breaker; its
//! response, if it ever lands, is discarded.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::append_row;
use crate::breaker::{BreakerRegistry, BuyerBreaker};
use crate::domain::{AttemptOutcome, Bid, EngineDefaults, Lead, RetryPolicy, Transaction};
use crate::ledger::AuctionStore;
use crate::services::EngineMetrics;
use crate::transport::{call_with_retry, AttemptLog, BuyerTransport, PingReply, WebhookRequest};

use super::eligibility::Prospect;

/// Ping every prospect concurrently and return the valid bids, arrival
/// sequence assigned in completion order.
pub async fn collect_bids(
    lead: &Lead,
    prospects: &[Prospect],
    transport: &Arc<dyn BuyerTransport>,
    store: &Arc<dyn AuctionStore>,
    breakers: &BreakerRegistry,
    metrics: &Arc<EngineMetrics>,
    defaults: &EngineDefaults,
    ping_deadline: Duration,
) -> Vec<Bid> {
    let mut set: JoinSet<(String, Option<Bid>)> = JoinSet::new();

    for prospect in prospects {
        let task = PingTask {
            lead_id: lead.id,
            service_type_id: lead.service_type_id.clone(),
            prospect: prospect.clone(),
            transport: Arc::clone(transport),
            store: Arc::clone(store),
            breaker: breakers.for_buyer(&prospect.buyer_id),
            metrics: Arc::clone(metrics),
            timeout: prospect.service.webhook.effective_ping_timeout(defaults),
            policy: prospect.service.webhook.effective_ping_retry(defaults).clone(),
        };
        set.spawn(task.run());
    }

    let deadline = Instant::now() + ping_deadline;
    let mut bids = Vec::new();
    let mut answered: BTreeSet<String> = BTreeSet::new();
    let mut arrival_seq: u64 = 0;

    while !set.is_empty() {
        match timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok((buyer_id, maybe_bid)))) => {
                answered.insert(buyer_id);
                if let Some(bid) = maybe_bid {
                    bids.push(bid.with_arrival_seq(arrival_seq));
                    arrival_seq += 1;
                }
            }
            Ok(Some(Err(join_err))) => {
                warn!(error = %join_err, "ping task failed to join");
            }
            Ok(None) => break,
            Err(_) => {
                debug!(pending = set.len(), "ping deadline reached, aborting stragglers");
                set.abort_all();
                // Results that slipped in between the deadline and the
                // abort are discarded, but their buyers already wrote
                // their own rows, so they must not be double-charged.
                while let Some(joined) = set.join_next().await {
                    if let Ok((buyer_id, _)) = joined {
                        answered.insert(buyer_id);
                    }
                }
                break;
            }
        }
    }

    for prospect in prospects.iter().filter(|p| !answered.contains(&p.buyer_id)) {
        metrics.inc_ping_timeouts();
        append_row(
            store,
            metrics,
            Transaction::ping(
                lead.id,
                &prospect.buyer_id,
                &lead.service_type_id,
                AttemptOutcome::Timeout,
            )
            .with_detail("auction ping deadline"),
        )
        .await;
        breakers
            .for_buyer(&prospect.buyer_id)
            .record_failure("auction ping deadline")
            .await;
    }

    bids
}

struct PingTask {
    lead_id: Uuid,
    service_type_id: String,
    prospect: Prospect,
    transport: Arc<dyn BuyerTransport>,
    store: Arc<dyn AuctionStore>,
    breaker: Arc<BuyerBreaker>,
    metrics: Arc<EngineMetrics>,
    timeout: Duration,
    policy: RetryPolicy,
}

impl PingTask {
    async fn run(self) -> (String, Option<Bid>) {
        let buyer_id = self.prospect.buyer_id.clone();
        let request = WebhookRequest {
            buyer_id: buyer_id.clone(),
            url: self.prospect.service.webhook.ping_url.clone(),
            auth: self.prospect.auth.clone(),
            body: self.prospect.ping_body.clone(),
            timeout: self.timeout,
        };

        let (result, log) = call_with_retry(
            &self.policy,
            self.timeout,
            || {
                self.metrics.inc_pings_sent();
                self.transport.ping(&request)
            },
            |entry| self.record_attempt(entry),
        )
        .await;

        let last_attempt = log.len() as u32;
        let last_latency = log.last().map(|a| a.latency_ms).unwrap_or(0);

        match result {
            Ok(PingReply::Accepted { amount }) => {
                match self
                    .prospect
                    .bounds_policy
                    .evaluate(&self.prospect.bounds, amount)
                {
                    Some(effective) => {
                        let mut row = Transaction::ping(
                            self.lead_id,
                            &buyer_id,
                            &self.service_type_id,
                            AttemptOutcome::Success,
                        )
                        .with_amount(effective)
                        .with_attempt(last_attempt)
                        .with_latency(last_latency);
                        if effective != amount {
                            row = row.with_detail(format!("clamped from {amount}"));
                        }
                        append_row(&self.store, &self.metrics, row).await;
                        self.breaker.record_success().await;
                        self.metrics.inc_bids_accepted();

                        let bid = Bid::accepted(buyer_id.clone(), effective)
                            .with_latency(last_latency)
                            .with_priority_rank(self.prospect.priority);
                        (buyer_id, Some(bid))
                    }
                    None => {
                        warn!(
                            buyer_id = %buyer_id,
                            %amount,
                            min = %self.prospect.bounds.min_bid,
                            max = %self.prospect.bounds.max_bid,
                            "bid outside configured bounds, excluded"
                        );
                        append_row(
                            &self.store,
                            &self.metrics,
                            Transaction::ping(
                                self.lead_id,
                                &buyer_id,
                                &self.service_type_id,
                                AttemptOutcome::Rejected,
                            )
                            .with_amount(amount)
                            .with_attempt(last_attempt)
                            .with_latency(last_latency)
                            .with_detail(format!(
                                "bid {amount} outside bounds [{}, {}]",
                                self.prospect.bounds.min_bid, self.prospect.bounds.max_bid
                            )),
                        )
                        .await;
                        self.breaker.record_neutral().await;
                        self.metrics.inc_bids_invalid();
                        (buyer_id, None)
                    }
                }
            }
            Ok(PingReply::Declined { reason }) => {
                let mut row = Transaction::ping(
                    self.lead_id,
                    &buyer_id,
                    &self.service_type_id,
                    AttemptOutcome::Rejected,
                )
                .with_attempt(last_attempt)
                .with_latency(last_latency);
                if let Some(reason) = reason {
                    row = row.with_detail(reason);
                }
                append_row(&self.store, &self.metrics, row).await;
                // a decline is not a success, but it resolves a probe
                self.breaker.record_neutral().await;
                self.metrics.inc_bids_declined();
                (buyer_id, None)
            }
            Err(err) => {
                // every attempt already has its own row
                self.breaker.record_failure(&err.to_string()).await;
                (buyer_id, None)
            }
        }
    }

    /// Ledger row for one failed attempt, written as the attempt
    /// resolves so a later deadline abort cannot erase it.
    async fn record_attempt(&self, entry: AttemptLog) {
        let Some(err) = &entry.error else { return };
        let outcome = if err.is_timeout() {
            self.metrics.inc_ping_timeouts();
            AttemptOutcome::Timeout
        } else {
            self.metrics.inc_ping_errors();
            AttemptOutcome::Error
        };
        append_row(
            &self.store,
            &self.metrics,
            Transaction::ping(
                self.lead_id,
                &self.prospect.buyer_id,
                &self.service_type_id,
                outcome,
            )
            .with_attempt(entry.attempt)
            .with_latency(entry.latency_ms)
            .with_detail(err.to_string()),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::domain::{
        BackoffStrategy, BidBounds, BoundsPolicy, BuyerServiceConfig, LeadField, TransactionKind,
        WebhookAuth, WebhookConfig,
    };
    use crate::error::TransportError;
    use crate::ledger::MemoryStore;
    use crate::template::Template;
    use crate::transport::PostReply;
    use async_trait::async_trait;
    use mockall::mock;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;

    mock! {
        pub Transport {}

        #[async_trait]
        impl BuyerTransport for Transport {
            async fn ping(
                &self,
                request: &WebhookRequest,
            ) -> std::result::Result<PingReply, TransportError>;
            async fn post(
                &self,
                request: &WebhookRequest,
            ) -> std::result::Result<PostReply, TransportError>;
        }
    }

    /// Accepts every ping after a per-buyer delay; for deadline tests
    /// where mock expectations cannot await.
    struct DelayedTransport {
        delays: std::collections::HashMap<String, Duration>,
        amount: Decimal,
    }

    #[async_trait]
    impl BuyerTransport for DelayedTransport {
        async fn ping(
            &self,
            request: &WebhookRequest,
        ) -> std::result::Result<PingReply, TransportError> {
            if let Some(delay) = self.delays.get(&request.buyer_id) {
                tokio::time::sleep(*delay).await;
            }
            Ok(PingReply::Accepted {
                amount: self.amount,
            })
        }

        async fn post(
            &self,
            _request: &WebhookRequest,
        ) -> std::result::Result<PostReply, TransportError> {
            Ok(PostReply::Accepted { confirmation: None })
        }
    }

    /// Fails the first ping fast, then hangs; for deadline-abort tests.
    struct FailThenHangTransport {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl BuyerTransport for FailThenHangTransport {
        async fn ping(
            &self,
            _request: &WebhookRequest,
        ) -> std::result::Result<PingReply, TransportError> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(TransportError::Connect("refused".into()))
            } else {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(PingReply::Accepted { amount: dec!(30) })
            }
        }

        async fn post(
            &self,
            _request: &WebhookRequest,
        ) -> std::result::Result<PostReply, TransportError> {
            Ok(PostReply::Accepted { confirmation: None })
        }
    }

    fn no_wait_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffStrategy::Fixed,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    fn prospect(buyer_id: &str, priority: u32, policy: BoundsPolicy) -> Prospect {
        Prospect {
            buyer_id: buyer_id.into(),
            auth: WebhookAuth::None,
            service: BuyerServiceConfig {
                service_type_id: "solar".into(),
                active: true,
                bounds: BidBounds::new(dec!(10), dec!(100)).unwrap(),
                bounds_policy: policy,
                priority,
                ping_template: Template::default().with_field(LeadField::Zip, "zip", true),
                post_template: Template::default(),
                webhook: WebhookConfig {
                    ping_url: "https://buyer.example/ping".into(),
                    post_url: "https://buyer.example/post".into(),
                    ping_timeout_ms: None,
                    post_timeout_ms: None,
                    ping_retry: Some(no_wait_retry(2)),
                    post_retry: None,
                },
                required_attestations: vec![],
            },
            priority,
            bounds: BidBounds::new(dec!(10), dec!(100)).unwrap(),
            bounds_policy: policy,
            ping_body: json!({"zip": "90210"}),
            daily_cap: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        breakers: BreakerRegistry,
        metrics: Arc<EngineMetrics>,
        defaults: EngineDefaults,
        lead: Lead,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(MemoryStore::new()),
            breakers: BreakerRegistry::new(BreakerConfig::default()),
            metrics: Arc::new(EngineMetrics::new()),
            defaults: EngineDefaults::default(),
            lead: Lead::new("solar", "90210"),
        }
    }

    async fn run_collect(
        fx: &Fixture,
        prospects: &[Prospect],
        transport: Arc<dyn BuyerTransport>,
    ) -> Vec<Bid> {
        let store: Arc<dyn AuctionStore> = fx.store.clone();
        collect_bids(
            &fx.lead,
            prospects,
            &transport,
            &store,
            &fx.breakers,
            &fx.metrics,
            &fx.defaults,
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn accepted_bid_becomes_a_success_row_and_a_bid() {
        let fx = fixture();
        let mut transport = MockTransport::new();
        transport
            .expect_ping()
            .returning(|_| Ok(PingReply::Accepted { amount: dec!(42) }));

        let bids = run_collect(&fx, &[prospect("acme", 7, BoundsPolicy::Reject)], Arc::new(transport)).await;

        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].amount, dec!(42));
        assert_eq!(bids[0].priority_rank, 7);

        let rows = fx.store.transactions();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, TransactionKind::Ping);
        assert_eq!(rows[0].outcome, AttemptOutcome::Success);
        assert_eq!(rows[0].amount, Some(dec!(42)));
    }

    #[tokio::test]
    async fn decline_is_recorded_without_charging_the_breaker() {
        let fx = fixture();
        let mut transport = MockTransport::new();
        transport.expect_ping().returning(|_| {
            Ok(PingReply::Declined {
                reason: Some("budget".into()),
            })
        });

        let bids = run_collect(&fx, &[prospect("acme", 1, BoundsPolicy::Reject)], Arc::new(transport)).await;

        assert!(bids.is_empty());
        let rows = fx.store.transactions();
        assert_eq!(rows[0].outcome, AttemptOutcome::Rejected);
        assert_eq!(rows[0].detail.as_deref(), Some("budget"));
        assert_eq!(
            fx.breakers.for_buyer("acme").snapshot().await.consecutive_failures,
            0
        );
    }

    #[tokio::test]
    async fn out_of_bounds_bid_is_excluded_under_reject_policy() {
        let fx = fixture();
        let mut transport = MockTransport::new();
        transport
            .expect_ping()
            .returning(|_| Ok(PingReply::Accepted { amount: dec!(500) }));

        let bids = run_collect(&fx, &[prospect("acme", 1, BoundsPolicy::Reject)], Arc::new(transport)).await;

        assert!(bids.is_empty());
        let rows = fx.store.transactions();
        assert_eq!(rows[0].outcome, AttemptOutcome::Rejected);
        assert!(rows[0].detail.as_ref().unwrap().contains("outside bounds"));
    }

    #[tokio::test]
    async fn high_bid_is_clamped_under_clamp_policy() {
        let fx = fixture();
        let mut transport = MockTransport::new();
        transport
            .expect_ping()
            .returning(|_| Ok(PingReply::Accepted { amount: dec!(500) }));

        let bids =
            run_collect(&fx, &[prospect("acme", 1, BoundsPolicy::ClampHigh)], Arc::new(transport))
                .await;

        assert_eq!(bids[0].amount, dec!(100));
        let rows = fx.store.transactions();
        assert_eq!(rows[0].outcome, AttemptOutcome::Success);
        assert_eq!(rows[0].detail.as_deref(), Some("clamped from 500"));
    }

    #[tokio::test]
    async fn exhausted_retries_write_a_row_per_attempt_and_charge_the_breaker() {
        let fx = fixture();
        let mut transport = MockTransport::new();
        transport.expect_ping().returning(|_| {
            Err(TransportError::Connect("refused".into()))
        });

        let bids = run_collect(&fx, &[prospect("acme", 1, BoundsPolicy::Reject)], Arc::new(transport)).await;

        assert!(bids.is_empty());
        let rows = fx.store.transactions();
        assert_eq!(rows.len(), 2); // retry policy allows 2 attempts
        assert!(rows.iter().all(|r| r.outcome == AttemptOutcome::Error));
        assert_eq!(rows[1].attempt, 2);
        assert_eq!(
            fx.breakers.for_buyer("acme").snapshot().await.consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn one_failing_buyer_never_blocks_the_others() {
        let fx = fixture();
        let mut transport = MockTransport::new();
        transport.expect_ping().returning(|request| {
            if request.buyer_id == "broken" {
                Err(TransportError::Status {
                    code: 500,
                    body: "boom".into(),
                })
            } else {
                Ok(PingReply::Accepted { amount: dec!(30) })
            }
        });

        let prospects = vec![
            prospect("broken", 1, BoundsPolicy::Reject),
            prospect("healthy", 2, BoundsPolicy::Reject),
        ];
        let bids = run_collect(&fx, &prospects, Arc::new(transport)).await;

        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].buyer_id, "healthy");
    }

    #[tokio::test]
    async fn deadline_straggler_is_timed_out_and_never_bids() {
        let fx = fixture();
        let transport = DelayedTransport {
            delays: [("slow".to_string(), Duration::from_secs(60))]
                .into_iter()
                .collect(),
            amount: dec!(30),
        };

        let mut slow = prospect("slow", 1, BoundsPolicy::Reject);
        // generous per-call timeout; only the phase deadline cuts it off
        slow.service.webhook.ping_timeout_ms = Some(120_000);
        let prospects = vec![slow, prospect("fast", 2, BoundsPolicy::Reject)];

        let store: Arc<dyn AuctionStore> = fx.store.clone();
        let transport: Arc<dyn BuyerTransport> = Arc::new(transport);
        let bids = collect_bids(
            &fx.lead,
            &prospects,
            &transport,
            &store,
            &fx.breakers,
            &fx.metrics,
            &fx.defaults,
            Duration::from_millis(200),
        )
        .await;

        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].buyer_id, "fast");

        let slow_rows: Vec<_> = fx
            .store
            .transactions()
            .into_iter()
            .filter(|r| r.buyer_id == "slow")
            .collect();
        assert_eq!(slow_rows.len(), 1);
        assert_eq!(slow_rows[0].outcome, AttemptOutcome::Timeout);
        assert_eq!(slow_rows[0].detail.as_deref(), Some("auction ping deadline"));
        assert_eq!(
            fx.breakers.for_buyer("slow").snapshot().await.consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn deadline_abort_keeps_rows_for_attempts_already_made() {
        let fx = fixture();
        let transport = FailThenHangTransport {
            calls: std::sync::atomic::AtomicU32::new(0),
        };

        let mut flaky = prospect("flaky", 1, BoundsPolicy::Reject);
        // generous per-call timeout; only the phase deadline cuts it off
        flaky.service.webhook.ping_timeout_ms = Some(120_000);

        let store: Arc<dyn AuctionStore> = fx.store.clone();
        let transport: Arc<dyn BuyerTransport> = Arc::new(transport);
        let bids = collect_bids(
            &fx.lead,
            &[flaky],
            &transport,
            &store,
            &fx.breakers,
            &fx.metrics,
            &fx.defaults,
            Duration::from_millis(300),
        )
        .await;

        assert!(bids.is_empty());
        let rows = fx.store.transactions();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].outcome, AttemptOutcome::Error);
        assert_eq!(rows[0].attempt, 1);
        assert!(rows[0].detail.as_ref().unwrap().contains("refused"));
        assert_eq!(rows[1].outcome, AttemptOutcome::Timeout);
        assert_eq!(rows[1].detail.as_deref(), Some("auction ping deadline"));
    }

    #[tokio::test]
    async fn halfopen_decline_closes_the_circuit_again() {
        let fx = fixture();
        let breakers = BreakerRegistry::new(BreakerConfig {
            cooldown_secs: 0,
            ..Default::default()
        });
        breakers.for_buyer("acme").manual_trip("down").await;
        // admission consumed the probe slot before the ping went out
        assert!(breakers.for_buyer("acme").allow_request().await.is_allowed());

        let mut transport = MockTransport::new();
        transport
            .expect_ping()
            .returning(|_| Ok(PingReply::Declined { reason: None }));

        let store: Arc<dyn AuctionStore> = fx.store.clone();
        let transport: Arc<dyn BuyerTransport> = Arc::new(transport);
        let bids = collect_bids(
            &fx.lead,
            &[prospect("acme", 1, BoundsPolicy::Reject)],
            &transport,
            &store,
            &breakers,
            &fx.metrics,
            &fx.defaults,
            Duration::from_secs(5),
        )
        .await;

        assert!(bids.is_empty());
        assert_eq!(
            breakers.for_buyer("acme").state().await,
            CircuitState::Closed
        );
        assert!(breakers.for_buyer("acme").allow_request().await.is_allowed());
    }

    #[tokio::test]
    async fn arrival_sequence_follows_completion_order() {
        let fx = fixture();
        let transport = DelayedTransport {
            delays: [("second".to_string(), Duration::from_millis(80))]
                .into_iter()
                .collect(),
            amount: Decimal::from(20),
        };

        let prospects = vec![
            prospect("second", 1, BoundsPolicy::Reject),
            prospect("first", 1, BoundsPolicy::Reject),
        ];
        let bids = run_collect(&fx, &prospects, Arc::new(transport)).await;

        assert_eq!(bids.len(), 2);
        let first = bids.iter().find(|b| b.buyer_id == "first").unwrap();
        let second = bids.iter().find(|b| b.buyer_id == "second").unwrap();
        assert!(first.arrival_seq < second.arrival_seq);
    }
}
