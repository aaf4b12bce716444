//! The auction engine: resolve, ping, select, deliver, record.
//!
//! One call to [`AuctionEngine::run`] takes a lead from intake to its
//! terminal state. Buyer-level failures stay buyer-level; the engine
//! itself only errors on wiring faults, never on a bad auction.

pub mod collector;
pub mod dispatcher;
pub mod eligibility;
pub mod selector;

pub use collector::collect_bids;
pub use dispatcher::{deliver, DeliveryResult};
pub use eligibility::{resolve_prospects, EligibilityResolution, Exclusion, ExclusionReason, Prospect};
pub use selector::{rank_bids, select_winner};

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::caps::DailyCapTracker;
use crate::domain::{AttemptOutcome, EngineDefaults, Lead, Transaction};
use crate::ledger::{AuctionStore, LeadMutation, RejectionCause};
use crate::registry::BuyerRegistry;
use crate::services::EngineMetrics;
use crate::transport::BuyerTransport;

/// Engine-wide timing knobs, all overridable per buyer where noted.
#[derive(Debug, Clone)]
pub struct AuctionTuning {
    /// Fallback timeouts and retry policies for buyer webhooks
    pub defaults: EngineDefaults,
    /// Hard bound on the whole ping phase
    pub ping_deadline: Duration,
    /// Hard bound on the whole auction, delivery cascade included
    pub auction_deadline: Duration,
}

impl Default for AuctionTuning {
    fn default() -> Self {
        Self {
            defaults: EngineDefaults::default(),
            ping_deadline: Duration::from_secs(5),
            auction_deadline: Duration::from_secs(30),
        }
    }
}

/// How an auction ended, from the lead submitter's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Sold { buyer_id: String, amount: Decimal },
    Rejected { cause: RejectionCause },
}

impl Disposition {
    pub fn is_sold(&self) -> bool {
        matches!(self, Disposition::Sold { .. })
    }

    /// Stable label for logs and metrics.
    pub fn label(&self) -> String {
        match self {
            Disposition::Sold { .. } => "SOLD".to_string(),
            Disposition::Rejected { cause } => format!("REJECTED:{cause}"),
        }
    }
}

/// Summary of one completed auction.
#[derive(Debug, Clone)]
pub struct AuctionOutcome {
    pub lead_id: Uuid,
    pub disposition: Disposition,
    /// Buyers admitted to the ping phase
    pub prospects: usize,
    /// Buyers filtered out during eligibility resolution
    pub exclusions: usize,
    /// Valid bids received
    pub bids: usize,
    /// Delivery candidates dropped before the terminal state
    pub failovers: u32,
    pub elapsed_ms: u64,
}

pub struct AuctionEngine {
    registry: Arc<BuyerRegistry>,
    breakers: Arc<BreakerRegistry>,
    caps: Arc<DailyCapTracker>,
    transport: Arc<dyn BuyerTransport>,
    store: Arc<dyn AuctionStore>,
    metrics: Arc<EngineMetrics>,
    tuning: AuctionTuning,
}

impl AuctionEngine {
    pub fn new(
        registry: Arc<BuyerRegistry>,
        breakers: Arc<BreakerRegistry>,
        caps: Arc<DailyCapTracker>,
        transport: Arc<dyn BuyerTransport>,
        store: Arc<dyn AuctionStore>,
        metrics: Arc<EngineMetrics>,
        tuning: AuctionTuning,
    ) -> Self {
        Self {
            registry,
            breakers,
            caps,
            transport,
            store,
            metrics,
            tuning,
        }
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Run one lead through the full auction and apply its terminal
    /// mutation. Always reaches a terminal state; per-buyer faults are
    /// ledger rows, not errors.
    pub async fn run(&self, lead: &Lead) -> AuctionOutcome {
        let started = Instant::now();
        let deadline = started + self.tuning.auction_deadline;
        self.metrics.inc_auctions();

        info!(
            lead_id = %lead.id,
            service = %lead.service_type_id,
            zip = %lead.zip,
            "auction started"
        );

        if let Err(e) = self.store.insert_lead(lead).await {
            error!(lead_id = %lead.id, error = %e, "lead insert dropped");
            self.metrics.inc_ledger_write_failures();
        }

        // One frozen snapshot for the whole auction.
        let snapshot = self.registry.snapshot();
        let resolution =
            resolve_prospects(lead, &snapshot, &self.breakers, &self.caps).await;
        self.record_exclusions(lead, &resolution.exclusions).await;

        if resolution.prospects.is_empty() {
            return self
                .finish(
                    lead,
                    Disposition::Rejected {
                        cause: RejectionCause::NoEligibleBuyers,
                    },
                    &resolution,
                    0,
                    0,
                    started,
                )
                .await;
        }

        let bids = collect_bids(
            lead,
            &resolution.prospects,
            &self.transport,
            &self.store,
            &self.breakers,
            &self.metrics,
            &self.tuning.defaults,
            self.tuning.ping_deadline,
        )
        .await;

        let delivery = deliver(
            lead,
            &resolution.prospects,
            &bids,
            &self.transport,
            &self.store,
            &self.breakers,
            &self.caps,
            &self.metrics,
            &self.tuning.defaults,
            deadline,
        )
        .await;

        let (disposition, failovers) = match delivery {
            DeliveryResult::Sold {
                buyer_id,
                amount,
                failovers,
            } => (Disposition::Sold { buyer_id, amount }, failovers),
            DeliveryResult::Exhausted { cause, failovers } => {
                (Disposition::Rejected { cause }, failovers)
            }
        };

        self.finish(lead, disposition, &resolution, bids.len(), failovers, started)
            .await
    }

    async fn record_exclusions(&self, lead: &Lead, exclusions: &[Exclusion]) {
        for exclusion in exclusions {
            self.metrics.inc_buyers_excluded();
            // Unsatisfiable configuration is flagged on the ledger, not
            // silently dropped like an ordinary eligibility miss.
            if let ExclusionReason::ConfigurationInvalid { detail } = &exclusion.reason {
                append_row(
                    &self.store,
                    &self.metrics,
                    Transaction::ping(
                        lead.id,
                        &exclusion.buyer_id,
                        &lead.service_type_id,
                        AttemptOutcome::Error,
                    )
                    .with_detail(format!("configuration invalid: {detail}")),
                )
                .await;
            }
        }
    }

    async fn finish(
        &self,
        lead: &Lead,
        disposition: Disposition,
        resolution: &EligibilityResolution,
        bids: usize,
        failovers: u32,
        started: Instant,
    ) -> AuctionOutcome {
        let mutation = match &disposition {
            Disposition::Sold { buyer_id, amount } => {
                LeadMutation::sold(lead.id, buyer_id.clone(), *amount)
            }
            Disposition::Rejected { cause } => LeadMutation::rejected(lead.id, *cause),
        };
        if let Err(e) = self.store.apply_lead_mutation(&mutation).await {
            error!(lead_id = %lead.id, error = %e, "lead mutation dropped");
            self.metrics.inc_ledger_write_failures();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let label = disposition.label();
        self.metrics
            .record_disposition(&label, disposition.is_sold())
            .await;

        info!(
            lead_id = %lead.id,
            disposition = %label,
            prospects = resolution.prospects.len(),
            exclusions = resolution.exclusions.len(),
            bids,
            failovers,
            elapsed_ms,
            "auction finished"
        );

        AuctionOutcome {
            lead_id: lead.id,
            disposition,
            prospects: resolution.prospects.len(),
            exclusions: resolution.exclusions.len(),
            bids,
            failovers,
            elapsed_ms,
        }
    }
}

/// Append a ledger row, dropping it with a logged error on store
/// failure. Audit writes never abort an auction.
pub(crate) async fn append_row(
    store: &Arc<dyn AuctionStore>,
    metrics: &EngineMetrics,
    tx: Transaction,
) {
    if let Err(e) = store.record_transaction(&tx).await {
        error!(
            lead_id = %tx.lead_id,
            buyer_id = %tx.buyer_id,
            kind = %tx.kind,
            error = %e,
            "ledger write dropped"
        );
        metrics.inc_ledger_write_failures();
    }
}
