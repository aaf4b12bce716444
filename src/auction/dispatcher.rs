//! Post phase: deliver the lead to the winner, cascading on failure.
//!
//! Each round re-runs the winner selector over the bids still standing,
//! renders the post payload, and drives one timeout/retry chain against
//! the candidate's post endpoint. A failed candidate is dropped and the
//! next-best bid gets the lead, bounded by the overall auction deadline.
//! Exactly one terminal result comes out, never more than one sale.

use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use super::append_row;
use super::eligibility::Prospect;
use super::selector::select_winner;
use crate::breaker::BreakerRegistry;
use crate::caps::DailyCapTracker;
use crate::domain::{AttemptOutcome, Bid, EngineDefaults, Lead, Transaction};
use crate::ledger::{AuctionStore, RejectionCause};
use crate::services::EngineMetrics;
use crate::transport::{call_with_retry, AttemptLog, BuyerTransport, PostReply, WebhookRequest};

/// Terminal result of the delivery cascade.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    Sold {
        buyer_id: String,
        amount: Decimal,
        /// Candidates dropped before the sale
        failovers: u32,
    },
    Exhausted {
        cause: RejectionCause,
        failovers: u32,
    },
}

/// Run the cascade until a buyer takes the lead or nothing remains.
#[allow(clippy::too_many_arguments)]
pub async fn deliver(
    lead: &Lead,
    prospects: &[Prospect],
    bids: &[Bid],
    transport: &Arc<dyn BuyerTransport>,
    store: &Arc<dyn AuctionStore>,
    breakers: &BreakerRegistry,
    caps: &DailyCapTracker,
    metrics: &Arc<EngineMetrics>,
    defaults: &EngineDefaults,
    deadline: Instant,
) -> DeliveryResult {
    let mut remaining: Vec<Bid> = bids.to_vec();
    if select_winner(&remaining).is_none() {
        return DeliveryResult::Exhausted {
            cause: RejectionCause::NoValidBids,
            failovers: 0,
        };
    }

    let mut failovers: u32 = 0;

    loop {
        let Some(winner) = select_winner(&remaining).cloned() else {
            return DeliveryResult::Exhausted {
                cause: RejectionCause::AllBuyersExhausted,
                failovers,
            };
        };
        if Instant::now() >= deadline {
            return DeliveryResult::Exhausted {
                cause: RejectionCause::DeadlineExceeded,
                failovers,
            };
        }

        match attempt_delivery(
            lead, prospects, &winner, transport, store, breakers, metrics, defaults, deadline,
        )
        .await
        {
            AttemptResult::Delivered => {
                caps.record_delivery(&winner.buyer_id, &lead.service_type_id, &lead.zip);
                metrics.inc_posts_delivered();
                return DeliveryResult::Sold {
                    buyer_id: winner.buyer_id,
                    amount: winner.amount,
                    failovers,
                };
            }
            AttemptResult::Failed => {
                metrics.inc_post_failures();
                remaining.retain(|b| b.buyer_id != winner.buyer_id);
                failovers += 1;
                metrics.inc_failovers();
                info!(
                    lead_id = %lead.id,
                    buyer_id = %winner.buyer_id,
                    candidates_left = remaining.len(),
                    "delivery failed, cascading to next bidder"
                );
            }
            AttemptResult::DeadlineHit => {
                metrics.inc_post_failures();
                return DeliveryResult::Exhausted {
                    cause: RejectionCause::DeadlineExceeded,
                    failovers,
                };
            }
        }
    }
}

enum AttemptResult {
    Delivered,
    Failed,
    DeadlineHit,
}

#[allow(clippy::too_many_arguments)]
async fn attempt_delivery(
    lead: &Lead,
    prospects: &[Prospect],
    winner: &Bid,
    transport: &Arc<dyn BuyerTransport>,
    store: &Arc<dyn AuctionStore>,
    breakers: &BreakerRegistry,
    metrics: &Arc<EngineMetrics>,
    defaults: &EngineDefaults,
    deadline: Instant,
) -> AttemptResult {
    let Some(prospect) = prospects.iter().find(|p| p.buyer_id == winner.buyer_id) else {
        warn!(buyer_id = %winner.buyer_id, "winning bid without a prospect record");
        return AttemptResult::Failed;
    };

    // Compliance gate: a delivery payload never ships with attestation
    // fields silently absent.
    if let Some(kind) = prospect
        .service
        .required_attestations
        .iter()
        .find(|kind| !lead.has_attestation(kind))
    {
        append_row(
            store,
            metrics,
            Transaction::post(
                lead.id,
                &prospect.buyer_id,
                &lead.service_type_id,
                AttemptOutcome::Error,
            )
            .with_detail(format!("missing required attestation '{kind}'")),
        )
        .await;
        return AttemptResult::Failed;
    }

    let body = match prospect.service.post_template.render(lead) {
        Ok(body) => body,
        Err(e) => {
            warn!(buyer_id = %prospect.buyer_id, error = %e, "post payload failed to render");
            append_row(
                store,
                metrics,
                Transaction::post(
                    lead.id,
                    &prospect.buyer_id,
                    &lead.service_type_id,
                    AttemptOutcome::Error,
                )
                .with_detail(e.to_string()),
            )
            .await;
            return AttemptResult::Failed;
        }
    };

    let call_timeout = prospect.service.webhook.effective_post_timeout(defaults);
    let policy = prospect.service.webhook.effective_post_retry(defaults).clone();
    let request = WebhookRequest {
        buyer_id: prospect.buyer_id.clone(),
        url: prospect.service.webhook.post_url.clone(),
        auth: prospect.auth.clone(),
        body,
        timeout: call_timeout,
    };

    let breaker = breakers.for_buyer(&prospect.buyer_id);
    let chain = call_with_retry(
        &policy,
        call_timeout,
        || {
            metrics.inc_posts_sent();
            transport.post(&request)
        },
        |entry| record_attempt(lead, prospect, store, metrics, entry),
    );

    let (result, log) = match timeout_at(deadline, chain).await {
        Ok(pair) => pair,
        Err(_) => {
            append_row(
                store,
                metrics,
                Transaction::post(
                    lead.id,
                    &prospect.buyer_id,
                    &lead.service_type_id,
                    AttemptOutcome::Timeout,
                )
                .with_detail("auction deadline during delivery"),
            )
            .await;
            breaker.record_failure("auction deadline during delivery").await;
            return AttemptResult::DeadlineHit;
        }
    };

    let last_attempt = log.len() as u32;
    let last_latency = log.last().map(|a| a.latency_ms).unwrap_or(0);

    match result {
        Ok(PostReply::Accepted { confirmation }) => {
            let mut row = Transaction::post(
                lead.id,
                &prospect.buyer_id,
                &lead.service_type_id,
                AttemptOutcome::Success,
            )
            .with_amount(winner.amount)
            .with_attempt(last_attempt)
            .with_latency(last_latency);
            if let Some(confirmation) = confirmation {
                row = row.with_detail(format!("buyer confirmation: {confirmation}"));
            }
            append_row(store, metrics, row).await;
            breaker.record_success().await;
            AttemptResult::Delivered
        }
        Ok(PostReply::Rejected { reason }) => {
            let detail = reason.unwrap_or_else(|| "delivery rejected".to_string());
            append_row(
                store,
                metrics,
                Transaction::post(
                    lead.id,
                    &prospect.buyer_id,
                    &lead.service_type_id,
                    AttemptOutcome::Rejected,
                )
                .with_amount(winner.amount)
                .with_attempt(last_attempt)
                .with_latency(last_latency)
                .with_detail(detail.clone()),
            )
            .await;
            // the buyer bid for this lead and then refused it
            breaker.record_failure(&detail).await;
            AttemptResult::Failed
        }
        Err(err) => {
            breaker.record_failure(&err.to_string()).await;
            AttemptResult::Failed
        }
    }
}

/// Ledger row for one failed delivery attempt, written as the attempt
/// resolves so a deadline abort mid-chain cannot erase it.
async fn record_attempt(
    lead: &Lead,
    prospect: &Prospect,
    store: &Arc<dyn AuctionStore>,
    metrics: &Arc<EngineMetrics>,
    entry: AttemptLog,
) {
    let Some(err) = &entry.error else { return };
    let outcome = if err.is_timeout() {
        AttemptOutcome::Timeout
    } else {
        AttemptOutcome::Error
    };
    append_row(
        store,
        metrics,
        Transaction::post(lead.id, &prospect.buyer_id, &lead.service_type_id, outcome)
            .with_attempt(entry.attempt)
            .with_latency(entry.latency_ms)
            .with_detail(err.to_string()),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::domain::{
        BackoffStrategy, BidBounds, BoundsPolicy, BuyerServiceConfig, LeadField, RetryPolicy,
        TransactionKind, WebhookAuth, WebhookConfig,
    };
    use crate::error::TransportError;
    use crate::ledger::MemoryStore;
    use crate::template::Template;
    use crate::transport::PingReply;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Per-buyer scripted post behavior.
    #[derive(Clone)]
    enum PostScript {
        Accept,
        Reject(&'static str),
        Fail,
        /// First call errors fast, later calls hang
        FailThenHang,
    }

    struct ScriptedTransport {
        scripts: HashMap<String, PostScript>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(scripts: impl IntoIterator<Item = (&'static str, PostScript)>) -> Self {
            Self {
                scripts: scripts
                    .into_iter()
                    .map(|(id, s)| (id.to_string(), s))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn post_calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuyerTransport for ScriptedTransport {
        async fn ping(
            &self,
            _request: &WebhookRequest,
        ) -> std::result::Result<PingReply, TransportError> {
            Ok(PingReply::Declined { reason: None })
        }

        async fn post(
            &self,
            request: &WebhookRequest,
        ) -> std::result::Result<PostReply, TransportError> {
            self.calls.lock().unwrap().push(request.buyer_id.clone());
            match self.scripts.get(&request.buyer_id) {
                Some(PostScript::Accept) | None => Ok(PostReply::Accepted {
                    confirmation: Some("ok-1".into()),
                }),
                Some(PostScript::Reject(reason)) => Ok(PostReply::Rejected {
                    reason: Some(reason.to_string()),
                }),
                Some(PostScript::Fail) => Err(TransportError::Timeout { elapsed_ms: 1 }),
                Some(PostScript::FailThenHang) => {
                    let prior = {
                        let calls = self.calls.lock().unwrap();
                        calls
                            .iter()
                            .filter(|c| c.as_str() == request.buyer_id)
                            .count()
                    };
                    if prior <= 1 {
                        Err(TransportError::Connect("refused".into()))
                    } else {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(PostReply::Accepted { confirmation: None })
                    }
                }
            }
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

    fn prospect(buyer_id: &str, priority: u32) -> Prospect {
        Prospect {
            buyer_id: buyer_id.into(),
            auth: WebhookAuth::None,
            service: BuyerServiceConfig {
                service_type_id: "solar".into(),
                active: true,
                bounds: BidBounds::new(dec!(10), dec!(1000)).unwrap(),
                bounds_policy: BoundsPolicy::default(),
                priority,
                ping_template: Template::default(),
                post_template: Template::default().with_field(LeadField::Zip, "zip", true),
                webhook: WebhookConfig {
                    ping_url: "https://buyer.example/ping".into(),
                    post_url: "https://buyer.example/post".into(),
                    ping_timeout_ms: None,
                    post_timeout_ms: None,
                    ping_retry: None,
                    post_retry: Some(no_wait_retry(3)),
                },
                required_attestations: vec![],
            },
            priority,
            bounds: BidBounds::new(dec!(10), dec!(1000)).unwrap(),
            bounds_policy: BoundsPolicy::default(),
            ping_body: serde_json::json!({}),
            daily_cap: None,
        }
    }

    fn bid(buyer_id: &str, amount: Decimal, rank: u32, seq: u64) -> Bid {
        Bid::accepted(buyer_id, amount)
            .with_priority_rank(rank)
            .with_arrival_seq(seq)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        breakers: BreakerRegistry,
        caps: DailyCapTracker,
        metrics: Arc<EngineMetrics>,
        defaults: EngineDefaults,
        lead: Lead,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(MemoryStore::new()),
            breakers: BreakerRegistry::new(BreakerConfig::default()),
            caps: DailyCapTracker::new(),
            metrics: Arc::new(EngineMetrics::new()),
            defaults: EngineDefaults::default(),
            lead: Lead::new("solar", "90210"),
        }
    }

    async fn run_deliver(
        fx: &Fixture,
        prospects: &[Prospect],
        bids: &[Bid],
        transport: &Arc<ScriptedTransport>,
    ) -> DeliveryResult {
        let transport: Arc<dyn BuyerTransport> = transport.clone();
        let store: Arc<dyn AuctionStore> = fx.store.clone();
        deliver(
            &fx.lead,
            prospects,
            bids,
            &transport,
            &store,
            &fx.breakers,
            &fx.caps,
            &fx.metrics,
            &fx.defaults,
            Instant::now() + Duration::from_secs(30),
        )
        .await
    }

    #[tokio::test]
    async fn winner_delivery_succeeds_and_consumes_cap() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new([("acme", PostScript::Accept)]));

        let result = run_deliver(
            &fx,
            &[prospect("acme", 1)],
            &[bid("acme", dec!(75), 1, 0)],
            &transport,
        )
        .await;

        assert_eq!(
            result,
            DeliveryResult::Sold {
                buyer_id: "acme".into(),
                amount: dec!(75),
                failovers: 0,
            }
        );
        assert_eq!(fx.caps.delivered_today("acme", "solar", "90210"), 1);

        let rows = fx.store.transactions();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, TransactionKind::Post);
        assert_eq!(rows[0].outcome, AttemptOutcome::Success);
        assert_eq!(rows[0].amount, Some(dec!(75)));
        assert!(rows[0].detail.as_ref().unwrap().contains("ok-1"));
    }

    #[tokio::test]
    async fn failed_winner_cascades_to_runner_up() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new([
            ("top", PostScript::Fail),
            ("runner_up", PostScript::Accept),
        ]));

        let prospects = vec![prospect("top", 1), prospect("runner_up", 2)];
        let bids = vec![
            bid("top", dec!(300), 1, 0),
            bid("runner_up", dec!(225), 2, 1),
        ];
        let result = run_deliver(&fx, &prospects, &bids, &transport).await;

        assert_eq!(
            result,
            DeliveryResult::Sold {
                buyer_id: "runner_up".into(),
                amount: dec!(225),
                failovers: 1,
            }
        );

        // three timeouts against the top bidder, then one success
        assert_eq!(transport.post_calls(), vec!["top", "top", "top", "runner_up"]);
        let rows = fx.store.transactions();
        let top_rows: Vec<_> = rows.iter().filter(|r| r.buyer_id == "top").collect();
        assert_eq!(top_rows.len(), 3);
        assert!(top_rows.iter().all(|r| r.outcome == AttemptOutcome::Timeout));
        assert_eq!(
            fx.breakers.for_buyer("top").snapshot().await.consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn rejection_charges_the_breaker_and_cascades() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new([
            ("picky", PostScript::Reject("duplicate")),
            ("backup", PostScript::Accept),
        ]));

        let prospects = vec![prospect("picky", 1), prospect("backup", 2)];
        let bids = vec![bid("picky", dec!(90), 1, 0), bid("backup", dec!(60), 2, 1)];
        let result = run_deliver(&fx, &prospects, &bids, &transport).await;

        assert!(matches!(result, DeliveryResult::Sold { ref buyer_id, .. } if buyer_id == "backup"));

        let rejected: Vec<_> = fx
            .store
            .transactions()
            .into_iter()
            .filter(|r| r.outcome == AttemptOutcome::Rejected)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].detail.as_deref(), Some("duplicate"));
        assert_eq!(
            fx.breakers.for_buyer("picky").snapshot().await.consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn exhausting_every_candidate_is_terminal() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new([
            ("a", PostScript::Fail),
            ("b", PostScript::Reject("no thanks")),
        ]));

        let prospects = vec![prospect("a", 1), prospect("b", 2)];
        let bids = vec![bid("a", dec!(50), 1, 0), bid("b", dec!(40), 2, 1)];
        let result = run_deliver(&fx, &prospects, &bids, &transport).await;

        assert_eq!(
            result,
            DeliveryResult::Exhausted {
                cause: RejectionCause::AllBuyersExhausted,
                failovers: 2,
            }
        );
        assert_eq!(fx.caps.delivered_today("a", "solar", "90210"), 0);
    }

    #[tokio::test]
    async fn no_bids_is_its_own_cause() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new([]));

        let result = run_deliver(&fx, &[prospect("a", 1)], &[], &transport).await;
        assert_eq!(
            result,
            DeliveryResult::Exhausted {
                cause: RejectionCause::NoValidBids,
                failovers: 0,
            }
        );
        assert!(transport.post_calls().is_empty());
    }

    #[tokio::test]
    async fn missing_attestation_fails_delivery_without_a_network_call() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new([("strict", PostScript::Accept)]));

        let mut strict = prospect("strict", 1);
        strict.service.required_attestations = vec!["tcpa_consent_text".into()];

        let result = run_deliver(&fx, &[strict], &[bid("strict", dec!(80), 1, 0)], &transport).await;

        assert_eq!(
            result,
            DeliveryResult::Exhausted {
                cause: RejectionCause::AllBuyersExhausted,
                failovers: 1,
            }
        );
        assert!(transport.post_calls().is_empty());

        let rows = fx.store.transactions();
        assert_eq!(rows[0].outcome, AttemptOutcome::Error);
        assert!(rows[0]
            .detail
            .as_ref()
            .unwrap()
            .contains("tcpa_consent_text"));
    }

    #[tokio::test]
    async fn deadline_mid_chain_keeps_prior_attempt_rows() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new([("slow", PostScript::FailThenHang)]));

        let transport_dyn: Arc<dyn BuyerTransport> = transport.clone();
        let store: Arc<dyn AuctionStore> = fx.store.clone();
        let result = deliver(
            &fx.lead,
            &[prospect("slow", 1)],
            &[bid("slow", dec!(50), 1, 0)],
            &transport_dyn,
            &store,
            &fx.breakers,
            &fx.caps,
            &fx.metrics,
            &fx.defaults,
            Instant::now() + Duration::from_millis(300),
        )
        .await;

        assert_eq!(
            result,
            DeliveryResult::Exhausted {
                cause: RejectionCause::DeadlineExceeded,
                failovers: 0,
            }
        );

        // the completed first attempt survives the abort
        let rows = fx.store.transactions();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].outcome, AttemptOutcome::Error);
        assert!(rows[0].detail.as_ref().unwrap().contains("refused"));
        assert_eq!(rows[1].outcome, AttemptOutcome::Timeout);
        assert_eq!(
            rows[1].detail.as_deref(),
            Some("auction deadline during delivery")
        );
    }

    #[tokio::test]
    async fn expired_deadline_stops_the_cascade() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new([("a", PostScript::Accept)]));

        let transport_dyn: Arc<dyn BuyerTransport> = transport.clone();
        let store: Arc<dyn AuctionStore> = fx.store.clone();
        let result = deliver(
            &fx.lead,
            &[prospect("a", 1)],
            &[bid("a", dec!(50), 1, 0)],
            &transport_dyn,
            &store,
            &fx.breakers,
            &fx.caps,
            &fx.metrics,
            &fx.defaults,
            Instant::now() - Duration::from_millis(1),
        )
        .await;

        assert_eq!(
            result,
            DeliveryResult::Exhausted {
                cause: RejectionCause::DeadlineExceeded,
                failovers: 0,
            }
        );
        assert!(transport.post_calls().is_empty());
    }
}
