//! Live HTTP transport over reqwest.
//!
//! Buyer integrations are loose about response shapes, so parsing is
//! tolerant: amounts arrive as numbers or strings under several key
//! names, accept/decline flags as booleans or words. Anything the
//! parser cannot classify is a `Parse` fault, never a silent decline.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use super::{BuyerTransport, PingReply, PostReply, WebhookRequest};
use crate::domain::WebhookAuth;
use crate::error::{EngineError, Result, TransportError};

type HmacSha256 = Hmac<Sha256>;

const AMOUNT_KEYS: &[&str] = &["bid", "amount", "bid_amount", "price"];
const REASON_KEYS: &[&str] = &["reason", "message", "error"];
const CONFIRMATION_KEYS: &[&str] = &["confirmation", "confirmation_id", "id", "lead_id"];

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent("pingpost-dispatch/0.1")
            .build()
            .map_err(|e| EngineError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    async fn send(&self, request: &WebhookRequest) -> std::result::Result<String, TransportError> {
        let body_text = request.body.to_string();

        let mut req = self
            .http
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body_text.clone());
        req = apply_auth(req, &request.auth, &body_text)?;

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    elapsed_ms: request.timeout.as_millis() as u64,
                }
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
                body: truncate(&text, 512),
            });
        }

        debug!(buyer_id = %request.buyer_id, status = status.as_u16(), "webhook replied");
        Ok(text)
    }
}

#[async_trait]
impl BuyerTransport for HttpTransport {
    async fn ping(&self, request: &WebhookRequest) -> std::result::Result<PingReply, TransportError> {
        let text = self.send(request).await?;
        parse_ping_reply(&text)
    }

    async fn post(&self, request: &WebhookRequest) -> std::result::Result<PostReply, TransportError> {
        let text = self.send(request).await?;
        parse_post_reply(&text)
    }
}

fn apply_auth(
    req: RequestBuilder,
    auth: &WebhookAuth,
    body_text: &str,
) -> std::result::Result<RequestBuilder, TransportError> {
    match auth {
        WebhookAuth::None => Ok(req),
        WebhookAuth::Bearer { token } => Ok(req.bearer_auth(token)),
        WebhookAuth::Header { name, value } => {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Auth(format!("invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Auth(format!("invalid header value: {}", e)))?;
            Ok(req.header(name, value))
        }
        WebhookAuth::HmacSha256 { secret } => {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|e| TransportError::Auth(format!("invalid HMAC secret: {}", e)))?;
            mac.update(body_text.as_bytes());
            let signature = hex::encode(mac.finalize().into_bytes());
            Ok(req.header("X-Signature", signature))
        }
    }
}

/// Classify a 2xx ping body. Explicit declines win over amounts; a zero
/// or missing amount with no explicit accept is a decline (no bid).
pub(crate) fn parse_ping_reply(text: &str) -> std::result::Result<PingReply, TransportError> {
    if text.trim().is_empty() {
        return Err(TransportError::Parse("empty ping response".to_string()));
    }
    let root: Value = serde_json::from_str(text)
        .map_err(|e| TransportError::Parse(format!("invalid JSON: {}", e)))?;

    if let Some(false) = pick_bool(&root, &["accepted", "bid_placed"]) {
        return Ok(PingReply::Declined {
            reason: pick_str(&root, REASON_KEYS).map(str::to_string),
        });
    }
    if let Some(status) = pick_str(&root, &["status", "result", "decision"]) {
        if matches!(
            status.to_ascii_lowercase().as_str(),
            "declined" | "rejected" | "pass" | "no_bid" | "nobid"
        ) {
            return Ok(PingReply::Declined {
                reason: pick_str(&root, REASON_KEYS).map(str::to_string),
            });
        }
    }

    match pick(&root, AMOUNT_KEYS).and_then(parse_decimalish) {
        Some(amount) if amount > Decimal::ZERO => Ok(PingReply::Accepted { amount }),
        Some(_) => Ok(PingReply::Declined { reason: None }),
        None => {
            // accept flag without a usable amount is a malformed bid
            if pick_bool(&root, &["accepted", "bid_placed"]) == Some(true) {
                return Err(TransportError::Parse(
                    "accepted ping without a bid amount".to_string(),
                ));
            }
            Ok(PingReply::Declined {
                reason: pick_str(&root, REASON_KEYS).map(str::to_string),
            })
        }
    }
}

/// Classify a 2xx post body. An empty body is an acceptance; buyers
/// that reject a committed delivery say so explicitly.
pub(crate) fn parse_post_reply(text: &str) -> std::result::Result<PostReply, TransportError> {
    if text.trim().is_empty() {
        return Ok(PostReply::Accepted { confirmation: None });
    }
    let root: Value = serde_json::from_str(text)
        .map_err(|e| TransportError::Parse(format!("invalid JSON: {}", e)))?;

    if let Some(false) = pick_bool(&root, &["accepted", "success"]) {
        return Ok(PostReply::Rejected {
            reason: pick_str(&root, REASON_KEYS).map(str::to_string),
        });
    }
    if let Some(status) = pick_str(&root, &["status", "result"]) {
        if matches!(
            status.to_ascii_lowercase().as_str(),
            "rejected" | "declined" | "duplicate" | "error" | "failed"
        ) {
            return Ok(PostReply::Rejected {
                reason: pick_str(&root, REASON_KEYS).map(str::to_string),
            });
        }
    }

    Ok(PostReply::Accepted {
        confirmation: pick_str(&root, CONFIRMATION_KEYS).map(str::to_string),
    })
}

fn pick<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| root.get(*key))
}

fn pick_str<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a str> {
    pick(root, keys).and_then(|v| v.as_str())
}

fn pick_bool(root: &Value, keys: &[&str]) -> Option<bool> {
    pick(root, keys).and_then(|v| {
        if let Some(b) = v.as_bool() {
            Some(b)
        } else {
            v.as_str()
                .map(|s| matches!(s, "true" | "TRUE" | "1" | "yes" | "YES"))
        }
    })
}

fn parse_decimalish(value: &Value) -> Option<Decimal> {
    match value {
        Value::Null => None,
        Value::String(s) => Decimal::from_str_exact(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str_exact(&n.to_string()).ok(),
        _ => None,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}
