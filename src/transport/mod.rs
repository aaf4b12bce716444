//! Buyer webhook transport.
//!
//! The auction engine talks to buyers only through [`BuyerTransport`],
//! so tests script replies without sockets and `simulate` runs against
//! the dry-run transport with no live buyer traffic.

pub mod http;
pub mod retry;

pub use http::HttpTransport;
pub use retry::{call_with_retry, AttemptLog};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use crate::domain::WebhookAuth;
use crate::error::TransportError;

/// One outbound call, fully resolved: endpoint, auth, rendered body,
/// and the per-attempt timeout in force for it.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub buyer_id: String,
    pub url: String,
    pub auth: WebhookAuth,
    pub body: Value,
    pub timeout: Duration,
}

/// Parsed answer to a ping.
#[derive(Debug, Clone, PartialEq)]
pub enum PingReply {
    Accepted { amount: Decimal },
    Declined { reason: Option<String> },
}

/// Parsed answer to a post.
#[derive(Debug, Clone, PartialEq)]
pub enum PostReply {
    Accepted { confirmation: Option<String> },
    Rejected { reason: Option<String> },
}

/// Transport seam between the auction engine and buyer endpoints.
#[async_trait]
pub trait BuyerTransport: Send + Sync {
    async fn ping(&self, request: &WebhookRequest) -> Result<PingReply, TransportError>;
    async fn post(&self, request: &WebhookRequest) -> Result<PostReply, TransportError>;
}

/// Transport that accepts everything locally. Bid amounts are a fixed
/// base plus a deterministic per-buyer offset, so repeated simulations
/// pick the same winner while still exercising selection.
pub struct DryRunTransport {
    base_bid: Decimal,
}

impl DryRunTransport {
    pub fn new(base_bid: Decimal) -> Self {
        Self { base_bid }
    }

    fn offset_for(buyer_id: &str) -> Decimal {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        buyer_id.hash(&mut hasher);
        // cents in [0, 5.00)
        Decimal::from(hasher.finish() % 500) / Decimal::from(100)
    }
}

#[async_trait]
impl BuyerTransport for DryRunTransport {
    async fn ping(&self, request: &WebhookRequest) -> Result<PingReply, TransportError> {
        let amount = self.base_bid + Self::offset_for(&request.buyer_id);
        info!(buyer_id = %request.buyer_id, %amount, "[DRY RUN] ping accepted");
        Ok(PingReply::Accepted { amount })
    }

    async fn post(&self, request: &WebhookRequest) -> Result<PostReply, TransportError> {
        info!(buyer_id = %request.buyer_id, url = %request.url, "[DRY RUN] post accepted");
        Ok(PostReply::Accepted {
            confirmation: Some(format!("dry-run-{}", request.buyer_id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn request(buyer_id: &str) -> WebhookRequest {
        WebhookRequest {
            buyer_id: buyer_id.into(),
            url: "https://buyer.example/ping".into(),
            auth: WebhookAuth::None,
            body: json!({}),
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn dry_run_bids_are_deterministic_per_buyer() {
        let transport = DryRunTransport::new(dec!(10));

        let first = transport.ping(&request("acme")).await.unwrap();
        let second = transport.ping(&request("acme")).await.unwrap();
        assert_eq!(first, second);

        let PingReply::Accepted { amount } = first else {
            panic!("dry run must accept");
        };
        assert!(amount >= dec!(10) && amount < dec!(15));
    }
}
