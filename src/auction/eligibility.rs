//! Eligibility resolution: which buyers get pinged for a lead.
//!
//! Joins the lead's service type and ZIP against the registry snapshot,
//! then filters through the gates in a fixed order: row active, buyer
//! active, service terms active, attestations present, daily cap,
//! ping payload construction, and finally the circuit breaker. Every
//! filtered buyer is returned as an exclusion so the auction outcome
//! can say exactly who was skipped and why.

use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::breaker::{BreakerDecision, BreakerRegistry};
use crate::caps::DailyCapTracker;
use crate::domain::{BidBounds, BoundsPolicy, BuyerServiceConfig, Lead, WebhookAuth};
use crate::registry::RegistrySnapshot;

/// A buyer admitted to the auction, with its effective terms frozen.
#[derive(Debug, Clone)]
pub struct Prospect {
    pub buyer_id: String,
    pub auth: WebhookAuth,
    pub service: BuyerServiceConfig,
    /// Effective tie-break rank after any ZIP-row override
    pub priority: u32,
    /// Effective bounds after any ZIP-row override
    pub bounds: BidBounds,
    pub bounds_policy: BoundsPolicy,
    /// Rendered ping payload, built once at admission
    pub ping_body: Value,
    pub daily_cap: Option<u32>,
}

/// Why a buyer with a matching entitlement row was not pinged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    /// Row references a buyer the registry no longer knows
    UnknownBuyer,
    InactiveBuyer,
    /// Buyer has no terms for this service type
    NoServiceTerms,
    InactiveService,
    InactiveEligibility,
    MissingAttestation { kind: String },
    DailyCapReached { delivered: u32, cap: u32 },
    CircuitOpen { retry_in_secs: u64 },
    /// Ping payload could not be built from this lead
    ConfigurationInvalid { detail: String },
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::UnknownBuyer => write!(f, "unknown buyer"),
            ExclusionReason::InactiveBuyer => write!(f, "buyer inactive"),
            ExclusionReason::NoServiceTerms => write!(f, "no terms for service"),
            ExclusionReason::InactiveService => write!(f, "service terms inactive"),
            ExclusionReason::InactiveEligibility => write!(f, "eligibility row inactive"),
            ExclusionReason::MissingAttestation { kind } => {
                write!(f, "missing attestation '{}'", kind)
            }
            ExclusionReason::DailyCapReached { delivered, cap } => {
                write!(f, "daily cap reached ({}/{})", delivered, cap)
            }
            ExclusionReason::CircuitOpen { retry_in_secs } => {
                write!(f, "circuit open ({}s until probe)", retry_in_secs)
            }
            ExclusionReason::ConfigurationInvalid { detail } => {
                write!(f, "invalid configuration: {}", detail)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Exclusion {
    pub buyer_id: String,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, Default)]
pub struct EligibilityResolution {
    /// Admitted buyers, ordered by effective priority then buyer id
    pub prospects: Vec<Prospect>,
    pub exclusions: Vec<Exclusion>,
}

/// Resolve the candidate set for one lead against a frozen snapshot.
///
/// Breaker admission is consumed here: a HalfOpen buyer that passes
/// this gate holds one probe slot for the duration of the auction.
/// The breaker is the last gate checked, so an admitted buyer's probe
/// always reaches the wire.
pub async fn resolve_prospects(
    lead: &Lead,
    snapshot: &RegistrySnapshot,
    breakers: &BreakerRegistry,
    caps: &DailyCapTracker,
) -> EligibilityResolution {
    let mut resolution = EligibilityResolution::default();

    for row in snapshot.rows_for(&lead.service_type_id, &lead.zip) {
        let buyer_id = row.buyer_id.clone();
        let exclude = |reason: ExclusionReason| {
            debug!(buyer_id = %buyer_id, %reason, "buyer excluded");
            Exclusion {
                buyer_id: buyer_id.clone(),
                reason,
            }
        };

        if !row.active {
            resolution.exclusions.push(exclude(ExclusionReason::InactiveEligibility));
            continue;
        }

        let Some(buyer) = snapshot.buyer(&row.buyer_id) else {
            warn!(buyer_id = %row.buyer_id, "eligibility row references unknown buyer");
            resolution.exclusions.push(exclude(ExclusionReason::UnknownBuyer));
            continue;
        };
        if !buyer.active {
            resolution.exclusions.push(exclude(ExclusionReason::InactiveBuyer));
            continue;
        }

        let Some(service) = buyer.service_for(&lead.service_type_id) else {
            warn!(
                buyer_id = %row.buyer_id,
                service = %lead.service_type_id,
                "eligibility row without matching service terms"
            );
            resolution.exclusions.push(exclude(ExclusionReason::NoServiceTerms));
            continue;
        };
        if !service.active {
            resolution.exclusions.push(exclude(ExclusionReason::InactiveService));
            continue;
        }

        if let Some(kind) = service
            .required_attestations
            .iter()
            .find(|kind| !lead.has_attestation(kind))
        {
            resolution.exclusions.push(exclude(ExclusionReason::MissingAttestation {
                kind: kind.clone(),
            }));
            continue;
        }

        if !caps.has_capacity(&row.buyer_id, &row.service_type_id, &row.zip, row.daily_cap) {
            let delivered =
                caps.delivered_today(&row.buyer_id, &row.service_type_id, &row.zip);
            resolution.exclusions.push(exclude(ExclusionReason::DailyCapReached {
                delivered,
                cap: row.daily_cap.unwrap_or(0),
            }));
            continue;
        }

        let ping_body = match service.ping_template.render(lead) {
            Ok(body) => body,
            Err(e) => {
                warn!(buyer_id = %row.buyer_id, error = %e, "ping payload failed to render");
                resolution.exclusions.push(exclude(ExclusionReason::ConfigurationInvalid {
                    detail: e.to_string(),
                }));
                continue;
            }
        };

        let breaker = breakers.for_buyer(&row.buyer_id);
        if let BreakerDecision::Block { retry_in_secs } = breaker.allow_request().await {
            resolution
                .exclusions
                .push(exclude(ExclusionReason::CircuitOpen { retry_in_secs }));
            continue;
        }

        resolution.prospects.push(Prospect {
            buyer_id: row.buyer_id.clone(),
            auth: buyer.auth.clone(),
            service: service.clone(),
            priority: row.effective_priority(service),
            bounds: row.effective_bounds(service),
            bounds_policy: service.bounds_policy,
            ping_body,
            daily_cap: row.daily_cap,
        });
    }

    resolution
        .prospects
        .sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.buyer_id.cmp(&b.buyer_id)));

    resolution
}
