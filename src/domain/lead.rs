use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::TemplateError;

/// Lead lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LeadStatus {
    /// Created by intake, not yet scheduled
    Pending,
    /// Auction in progress
    InAuction,
    /// Delivered to a buyer
    Sold,
    /// Terminal: no buyer took the lead
    Rejected,
}

impl LeadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Sold | LeadStatus::Rejected)
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadStatus::Pending => write!(f, "PENDING"),
            LeadStatus::InAuction => write!(f, "IN_AUCTION"),
            LeadStatus::Sold => write!(f, "SOLD"),
            LeadStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// A consumer service request to be auctioned to exactly one buyer.
///
/// Materialized by intake before the engine runs. The engine never mutates
/// a lead directly; it emits a single `LeadMutation` intent at auction
/// conclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub service_type_id: String,
    /// Five-digit ZIP, exact-match eligibility key
    pub zip: String,
    /// Free-form intake answers (question key -> value)
    #[serde(default)]
    pub answers: BTreeMap<String, serde_json::Value>,
    /// Compliance attestations (kind -> evidence), e.g. tcpa_consent_text,
    /// trusted_form_cert
    #[serde(default)]
    pub attestations: BTreeMap<String, String>,
    /// Intake quality score, 0-100
    #[serde(default)]
    pub quality_score: u8,
    pub status: LeadStatus,
    #[serde(default)]
    pub winning_buyer_id: Option<String>,
    #[serde(default)]
    pub winning_bid: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(service_type_id: &str, zip: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_type_id: service_type_id.to_string(),
            zip: zip.to_string(),
            answers: BTreeMap::new(),
            attestations: BTreeMap::new(),
            quality_score: 0,
            status: LeadStatus::Pending,
            winning_buyer_id: None,
            winning_bid: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_answer(mut self, key: &str, value: serde_json::Value) -> Self {
        self.answers.insert(key.to_string(), value);
        self
    }

    pub fn with_attestation(mut self, kind: &str, evidence: &str) -> Self {
        self.attestations.insert(kind.to_string(), evidence.to_string());
        self
    }

    pub fn with_quality_score(mut self, score: u8) -> Self {
        self.quality_score = score;
        self
    }

    pub fn has_attestation(&self, kind: &str) -> bool {
        self.attestations.contains_key(kind)
    }
}

/// Typed accessor over lead attributes, parsed from a dotted source path.
///
/// Recognized paths: `lead_id`, `service_type`, `zip`, `quality_score`,
/// `created_at`, `answers.<key>`, `attestations.<kind>`. Anything else is
/// an `InvalidPath` configuration fault, never a silently absent field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadField {
    LeadId,
    ServiceType,
    Zip,
    QualityScore,
    CreatedAt,
    Answer(String),
    Attestation(String),
}

impl LeadField {
    pub fn parse(path: &str) -> Result<Self, TemplateError> {
        match path {
            "lead_id" => Ok(LeadField::LeadId),
            "service_type" => Ok(LeadField::ServiceType),
            "zip" => Ok(LeadField::Zip),
            "quality_score" => Ok(LeadField::QualityScore),
            "created_at" => Ok(LeadField::CreatedAt),
            _ => {
                if let Some(key) = path.strip_prefix("answers.") {
                    if key.is_empty() {
                        return Err(TemplateError::InvalidPath(path.to_string()));
                    }
                    return Ok(LeadField::Answer(key.to_string()));
                }
                if let Some(kind) = path.strip_prefix("attestations.") {
                    if kind.is_empty() {
                        return Err(TemplateError::InvalidPath(path.to_string()));
                    }
                    return Ok(LeadField::Attestation(kind.to_string()));
                }
                Err(TemplateError::InvalidPath(path.to_string()))
            }
        }
    }

    /// Resolve against a lead. `None` means the attribute is absent (only
    /// possible for answers and attestations).
    pub fn resolve(&self, lead: &Lead) -> Option<serde_json::Value> {
        match self {
            LeadField::LeadId => Some(serde_json::Value::String(lead.id.to_string())),
            LeadField::ServiceType => {
                Some(serde_json::Value::String(lead.service_type_id.clone()))
            }
            LeadField::Zip => Some(serde_json::Value::String(lead.zip.clone())),
            LeadField::QualityScore => Some(serde_json::Value::from(lead.quality_score)),
            LeadField::CreatedAt => {
                Some(serde_json::Value::String(lead.created_at.to_rfc3339()))
            }
            LeadField::Answer(key) => lead.answers.get(key).cloned(),
            LeadField::Attestation(kind) => lead
                .attestations
                .get(kind)
                .map(|v| serde_json::Value::String(v.clone())),
        }
    }

    pub fn as_path(&self) -> String {
        match self {
            LeadField::LeadId => "lead_id".to_string(),
            LeadField::ServiceType => "service_type".to_string(),
            LeadField::Zip => "zip".to_string(),
            LeadField::QualityScore => "quality_score".to_string(),
            LeadField::CreatedAt => "created_at".to_string(),
            LeadField::Answer(key) => format!("answers.{key}"),
            LeadField::Attestation(kind) => format!("attestations.{kind}"),
        }
    }
}

impl Serialize for LeadField {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_path())
    }
}

impl<'de> Deserialize<'de> for LeadField {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        LeadField::parse(&path).map_err(serde::de::Error::custom)
    }
}
