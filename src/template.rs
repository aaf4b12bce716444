//! Declarative lead-to-payload mapping for buyer webhooks.
//!
//! Each buyer service carries two templates (ping and post) that select
//! which lead attributes are sent and under which JSON keys. Sources are
//! typed `LeadField` accessors, so an unknown path is rejected when the
//! buyer directory loads instead of producing an empty payload at
//! auction time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::domain::{Lead, LeadField};
use crate::error::TemplateError;

/// One mapping rule: a lead attribute and the dotted JSON path it is
/// written to in the outgoing body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: LeadField,
    /// Dotted path in the outgoing body, e.g. `contact.phone`
    pub target: String,
    /// Required mappings abort payload construction when the lead lacks
    /// the attribute; optional ones are simply omitted
    #[serde(default)]
    pub required: bool,
}

/// Payload template for one webhook. Statics are written first, then
/// mapped fields, so a mapped field wins over a static at the same path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
    /// Literal values the buyer expects on every request, keyed by
    /// dotted target path (campaign ids, source codes)
    #[serde(default)]
    pub statics: BTreeMap<String, Value>,
}

impl Template {
    pub fn with_field(mut self, source: LeadField, target: &str, required: bool) -> Self {
        self.fields.push(FieldMapping {
            source,
            target: target.to_string(),
            required,
        });
        self
    }

    pub fn with_static(mut self, target: &str, value: Value) -> Self {
        self.statics.insert(target.to_string(), value);
        self
    }

    /// Build the outgoing JSON body for `lead`.
    ///
    /// A required mapping whose source is absent fails the whole render;
    /// the caller treats that as a buyer-scoped configuration fault and
    /// excludes the buyer without contacting it.
    pub fn render(&self, lead: &Lead) -> Result<Value, TemplateError> {
        let mut body = Map::new();

        for (target, value) in &self.statics {
            insert_at_path(&mut body, target, value.clone())?;
        }

        for mapping in &self.fields {
            match mapping.source.resolve(lead) {
                Some(value) => insert_at_path(&mut body, &mapping.target, value)?,
                None if mapping.required => {
                    return Err(TemplateError::MissingRequired {
                        field: mapping.source.as_path(),
                        target: mapping.target.clone(),
                    });
                }
                None => {}
            }
        }

        Ok(Value::Object(body))
    }

    /// Structural checks that do not need a lead: non-empty targets and
    /// no two rules writing the same path.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for mapping in &self.fields {
            if mapping.target.trim().is_empty()
                || mapping.target.split('.').any(|seg| seg.is_empty())
            {
                return Err(format!(
                    "empty target path for source '{}'",
                    mapping.source.as_path()
                ));
            }
            if !seen.insert(mapping.target.as_str()) {
                return Err(format!("duplicate target path '{}'", mapping.target));
            }
        }
        for target in self.statics.keys() {
            if target.trim().is_empty() || target.split('.').any(|seg| seg.is_empty()) {
                return Err(format!("empty static target path '{target}'"));
            }
        }
        Ok(())
    }
}

/// Write `value` at a dotted path, creating intermediate objects.
fn insert_at_path(
    root: &mut Map<String, Value>,
    target: &str,
    value: Value,
) -> Result<(), TemplateError> {
    if target.is_empty() {
        return Err(TemplateError::TargetConflict {
            target: target.to_string(),
        });
    }

    let mut segments = target.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return Ok(());
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = slot
            .as_object_mut()
            .ok_or_else(|| TemplateError::TargetConflict {
                target: target.to_string(),
            })?;
    }
    Ok(())
}
