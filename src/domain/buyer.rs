use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::template::Template;

/// How requests to a buyer's webhooks are authenticated.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WebhookAuth {
    #[default]
    None,
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// A static header, e.g. `X-Api-Key`
    Header { name: String, value: String },
    /// Hex SHA-256 HMAC of the request body in `X-Signature`
    HmacSha256 { secret: String },
}

impl WebhookAuth {
    /// Auth mode name for logs; never exposes the secret material.
    pub fn mode(&self) -> &'static str {
        match self {
            WebhookAuth::None => "none",
            WebhookAuth::Bearer { .. } => "bearer",
            WebhookAuth::Header { .. } => "header",
            WebhookAuth::HmacSha256 { .. } => "hmac_sha256",
        }
    }
}

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// Retry policy for a single webhook call chain.
///
/// `max_attempts` counts the initial call, so `1` means no retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay after the failure of attempt `attempt` (0-based):
    /// `min(base * 2^attempt, max)` for exponential, `base` for fixed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Exponential => {
                // cap the shift; delays saturate at max_delay_ms anyway
                let factor = 1u64 << attempt.min(20);
                self.base_delay_ms
                    .saturating_mul(factor)
                    .min(self.max_delay_ms)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        Ok(())
    }
}

/// Inclusive bid bounds. Invariant: `min_bid <= max_bid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidBounds {
    pub min_bid: Decimal,
    pub max_bid: Decimal,
}

impl BidBounds {
    pub fn new(min_bid: Decimal, max_bid: Decimal) -> Result<Self, String> {
        let bounds = Self { min_bid, max_bid };
        bounds.validate()?;
        Ok(bounds)
    }

    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min_bid && amount <= self.max_bid
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_bid > self.max_bid {
            return Err(format!(
                "min_bid ({}) exceeds max_bid ({})",
                self.min_bid, self.max_bid
            ));
        }
        if self.min_bid < Decimal::ZERO {
            return Err("min_bid must not be negative".to_string());
        }
        Ok(())
    }
}

/// What to do with an accepted bid whose amount falls outside the
/// effective bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoundsPolicy {
    /// Out-of-bounds bids are invalid and excluded from winner selection
    #[default]
    Reject,
    /// Amounts above max_bid are clamped down to max_bid; amounts below
    /// min_bid are still rejected (a buyer's offer is never raised)
    ClampHigh,
}

impl BoundsPolicy {
    /// `Some(amount)` with the amount to use, or `None` when the bid is
    /// invalid under this policy.
    pub fn evaluate(&self, bounds: &BidBounds, amount: Decimal) -> Option<Decimal> {
        if bounds.contains(amount) {
            return Some(amount);
        }
        match self {
            BoundsPolicy::Reject => None,
            BoundsPolicy::ClampHigh => {
                if amount > bounds.max_bid {
                    Some(bounds.max_bid)
                } else {
                    None
                }
            }
        }
    }
}

/// Ping/post endpoints and per-call timeout/retry overrides. Omitted
/// values fall back to the engine-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub ping_url: String,
    pub post_url: String,
    #[serde(default)]
    pub ping_timeout_ms: Option<u64>,
    #[serde(default)]
    pub post_timeout_ms: Option<u64>,
    #[serde(default)]
    pub ping_retry: Option<RetryPolicy>,
    #[serde(default)]
    pub post_retry: Option<RetryPolicy>,
}

impl WebhookConfig {
    pub fn effective_ping_timeout(&self, defaults: &EngineDefaults) -> Duration {
        Duration::from_millis(self.ping_timeout_ms.unwrap_or(defaults.ping_timeout_ms))
    }

    pub fn effective_post_timeout(&self, defaults: &EngineDefaults) -> Duration {
        Duration::from_millis(self.post_timeout_ms.unwrap_or(defaults.post_timeout_ms))
    }

    pub fn effective_ping_retry<'a>(&'a self, defaults: &'a EngineDefaults) -> &'a RetryPolicy {
        self.ping_retry.as_ref().unwrap_or(&defaults.ping_retry)
    }

    pub fn effective_post_retry<'a>(&'a self, defaults: &'a EngineDefaults) -> &'a RetryPolicy {
        self.post_retry.as_ref().unwrap_or(&defaults.post_retry)
    }
}

/// Engine-wide fallbacks for per-buyer webhook settings.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    pub ping_timeout_ms: u64,
    pub post_timeout_ms: u64,
    pub ping_retry: RetryPolicy,
    pub post_retry: RetryPolicy,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            ping_timeout_ms: 2_000,
            post_timeout_ms: 10_000,
            ping_retry: RetryPolicy::default(),
            post_retry: RetryPolicy::default(),
        }
    }
}

/// A buyer's terms for one service category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerServiceConfig {
    pub service_type_id: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub bounds: BidBounds,
    #[serde(default)]
    pub bounds_policy: BoundsPolicy,
    /// Tie-break rank; lower value wins
    pub priority: u32,
    pub ping_template: Template,
    pub post_template: Template,
    pub webhook: WebhookConfig,
    /// Attestation kinds that must be present on a lead before delivery
    #[serde(default)]
    pub required_attestations: Vec<String>,
}

fn default_active() -> bool {
    true
}

/// Per buyer/service/ZIP entitlement row. Exact ZIP match only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipEligibility {
    pub buyer_id: String,
    pub service_type_id: String,
    pub zip: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub priority_override: Option<u32>,
    #[serde(default)]
    pub bounds_override: Option<BidBounds>,
    /// Max leads delivered per UTC day; None = uncapped
    #[serde(default)]
    pub daily_cap: Option<u32>,
}

impl ZipEligibility {
    pub fn effective_priority(&self, service: &BuyerServiceConfig) -> u32 {
        self.priority_override.unwrap_or(service.priority)
    }

    pub fn effective_bounds(&self, service: &BuyerServiceConfig) -> BidBounds {
        self.bounds_override.unwrap_or(service.bounds)
    }
}

/// A buyer's full configuration: identity, auth policy, and per-service
/// terms. Registered into the `BuyerRegistry` by the administrative
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerConfig {
    pub buyer_id: String,
    pub display_name: String,
    #[serde(default)]
    pub auth: WebhookAuth,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub services: Vec<BuyerServiceConfig>,
}

impl BuyerConfig {
    /// First configured terms for a service type, in list order.
    pub fn service_for(&self, service_type_id: &str) -> Option<&BuyerServiceConfig> {
        self.services
            .iter()
            .find(|s| s.service_type_id == service_type_id)
    }

    /// Validate invariants that serde cannot enforce. Collects every
    /// problem rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.buyer_id.trim().is_empty() {
            errors.push("buyer_id must not be empty".to_string());
        }

        for service in &self.services {
            let ctx = format!("{}/{}", self.buyer_id, service.service_type_id);

            if service.service_type_id.trim().is_empty() {
                errors.push(format!("{ctx}: service_type_id must not be empty"));
            }
            if let Err(e) = service.bounds.validate() {
                errors.push(format!("{ctx}: {e}"));
            }
            for url in [&service.webhook.ping_url, &service.webhook.post_url] {
                if let Err(e) = url::Url::parse(url) {
                    errors.push(format!("{ctx}: invalid webhook URL '{url}': {e}"));
                }
            }
            if let Some(retry) = &service.webhook.ping_retry {
                if let Err(e) = retry.validate() {
                    errors.push(format!("{ctx}: ping retry: {e}"));
                }
            }
            if let Some(retry) = &service.webhook.post_retry {
                if let Err(e) = retry.validate() {
                    errors.push(format!("{ctx}: post retry: {e}"));
                }
            }
            if let Err(e) = service.ping_template.validate() {
                errors.push(format!("{ctx}: ping template: {e}"));
            }
            if let Err(e) = service.post_template.validate() {
                errors.push(format!("{ctx}: post template: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exponential(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            jitter: false,
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = exponential(100, 1_000);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = RetryPolicy {
            backoff: BackoffStrategy::Fixed,
            ..exponential(250, 10_000)
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(7), Duration::from_millis(250));
    }

    #[test]
    fn bounds_reject_invalid() {
        assert!(BidBounds::new(dec!(10), dec!(5)).is_err());
        assert!(BidBounds::new(dec!(-1), dec!(5)).is_err());
        assert!(BidBounds::new(dec!(5), dec!(5)).is_ok());
    }

    #[test]
    fn bounds_policy_reject() {
        let bounds = BidBounds::new(dec!(10), dec!(100)).unwrap();
        assert_eq!(
            BoundsPolicy::Reject.evaluate(&bounds, dec!(50)),
            Some(dec!(50))
        );
        assert_eq!(BoundsPolicy::Reject.evaluate(&bounds, dec!(150)), None);
        assert_eq!(BoundsPolicy::Reject.evaluate(&bounds, dec!(5)), None);
    }

    #[test]
    fn bounds_policy_clamp_high_never_raises() {
        let bounds = BidBounds::new(dec!(10), dec!(100)).unwrap();
        assert_eq!(
            BoundsPolicy::ClampHigh.evaluate(&bounds, dec!(150)),
            Some(dec!(100))
        );
        // below-minimum offers are never raised to min_bid
        assert_eq!(BoundsPolicy::ClampHigh.evaluate(&bounds, dec!(5)), None);
    }

    #[test]
    fn zip_row_overrides_take_precedence() {
        let service = BuyerServiceConfig {
            service_type_id: "solar".into(),
            active: true,
            bounds: BidBounds::new(dec!(10), dec!(100)).unwrap(),
            bounds_policy: BoundsPolicy::default(),
            priority: 50,
            ping_template: Template::default(),
            post_template: Template::default(),
            webhook: WebhookConfig {
                ping_url: "https://buyer.example/ping".into(),
                post_url: "https://buyer.example/post".into(),
                ping_timeout_ms: None,
                post_timeout_ms: None,
                ping_retry: None,
                post_retry: None,
            },
            required_attestations: vec![],
        };

        let row = ZipEligibility {
            buyer_id: "acme".into(),
            service_type_id: "solar".into(),
            zip: "90210".into(),
            active: true,
            priority_override: Some(10),
            bounds_override: Some(BidBounds::new(dec!(50), dec!(500)).unwrap()),
            daily_cap: Some(25),
        };

        assert_eq!(row.effective_priority(&service), 10);
        assert_eq!(row.effective_bounds(&service).max_bid, dec!(500));

        let plain = ZipEligibility {
            priority_override: None,
            bounds_override: None,
            ..row
        };
        assert_eq!(plain.effective_priority(&service), 50);
        assert_eq!(plain.effective_bounds(&service).max_bid, dec!(100));
    }

    #[test]
    fn webhook_timeouts_fall_back_to_defaults() {
        let defaults = EngineDefaults::default();
        let webhook = WebhookConfig {
            ping_url: "https://buyer.example/ping".into(),
            post_url: "https://buyer.example/post".into(),
            ping_timeout_ms: Some(750),
            post_timeout_ms: None,
            ping_retry: None,
            post_retry: None,
        };

        assert_eq!(
            webhook.effective_ping_timeout(&defaults),
            Duration::from_millis(750)
        );
        assert_eq!(
            webhook.effective_post_timeout(&defaults),
            Duration::from_millis(defaults.post_timeout_ms)
        );
    }
}
