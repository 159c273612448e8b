// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Metadata post-filters
//!
//! Filters run on candidates after the ANN search; the index itself has no
//! predicate support. A filter is a conjunction of conditions.
//!
//! JSON form:
//! - `{"field": value}` - equality shorthand
//! - `{"field": {"$eq": v, "$ne": v, "$in": [..], "$gte": n, "$lte": n}}`
//! - `{"created_at": {"$gte": "2024-01-01T00:00:00Z", "$lte": ...}}`
//! - `{"$contains": "text"}` - case-insensitive match over OCR/caption/text

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::{RetrievalError, RetrievalResult};
use crate::rag::types::Candidate;
use crate::vector::types::{Metadata, MetadataValue};

/// Metadata fields searched by [`Condition::TextContains`]
pub const TEXT_FIELDS: [&str; 3] = ["ocr_text", "caption", "text"];

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, MetadataValue),
    /// Also true when the field is absent
    Ne(String, MetadataValue),
    In(String, Vec<MetadataValue>),
    /// Inclusive numeric bounds; non-numeric or missing fields fail
    Range {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    CreatedBetween {
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
    TextContains(String),
}

impl Condition {
    fn matches(&self, metadata: &Metadata, created_at: &DateTime<Utc>) -> bool {
        match self {
            Condition::Eq(field, expected) => metadata
                .get(field)
                .map_or(false, |v| v.loosely_equals(expected)),
            Condition::Ne(field, expected) => metadata
                .get(field)
                .map_or(true, |v| !v.loosely_equals(expected)),
            Condition::In(field, options) => metadata
                .get(field)
                .map_or(false, |v| options.iter().any(|o| v.loosely_equals(o))),
            Condition::Range { field, min, max } => {
                match metadata.get(field).and_then(MetadataValue::as_f64) {
                    Some(value) => {
                        min.map_or(true, |lo| value >= lo) && max.map_or(true, |hi| value <= hi)
                    }
                    None => false,
                }
            }
            Condition::CreatedBetween { from, to } => {
                from.map_or(true, |lo| *created_at >= lo) && to.map_or(true, |hi| *created_at <= hi)
            }
            Condition::TextContains(needle) => {
                let needle = needle.to_lowercase();
                TEXT_FIELDS.iter().any(|field| {
                    metadata
                        .get(*field)
                        .and_then(MetadataValue::as_str)
                        .map_or(false, |text| text.to_lowercase().contains(&needle))
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    conditions: Vec<Condition>,
}

impl MetadataFilter {
    /// Filter that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn equals(self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.with(Condition::Eq(field.into(), value.into()))
    }

    pub fn not_equals(self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.with(Condition::Ne(field.into(), value.into()))
    }

    pub fn one_of(self, field: impl Into<String>, values: Vec<MetadataValue>) -> Self {
        self.with(Condition::In(field.into(), values))
    }

    pub fn range(self, field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        self.with(Condition::Range {
            field: field.into(),
            min,
            max,
        })
    }

    pub fn created_between(self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.with(Condition::CreatedBetween { from, to })
    }

    pub fn text_contains(self, needle: impl Into<String>) -> Self {
        self.with(Condition::TextContains(needle.into()))
    }

    pub fn matches(&self, candidate: &Candidate) -> bool {
        self.matches_metadata(&candidate.metadata, &candidate.created_at)
    }

    pub fn matches_metadata(&self, metadata: &Metadata, created_at: &DateTime<Utc>) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.matches(metadata, created_at))
    }

    /// Parse the JSON filter syntax. Unknown operators are rejected.
    pub fn from_json(filter: &Value) -> RetrievalResult<Self> {
        let object = match filter {
            Value::Null => return Ok(Self::new()),
            Value::Object(object) => object,
            other => return Err(invalid(format!("filter must be an object, got {}", other))),
        };

        let mut result = Self::new();
        for (field, condition) in object {
            if field == "$contains" {
                let needle = condition
                    .as_str()
                    .ok_or_else(|| invalid("$contains expects a string".to_string()))?;
                result = result.text_contains(needle);
                continue;
            }

            let operators = match condition {
                Value::Object(operators) => operators,
                scalar => {
                    result = result.equals(field.as_str(), scalar_value(field, scalar)?);
                    continue;
                }
            };

            if field == "created_at" {
                result = result.with(parse_created(operators)?);
                continue;
            }

            let mut min = None;
            let mut max = None;
            for (op, expected) in operators {
                match op.as_str() {
                    "$eq" => result = result.equals(field.as_str(), scalar_value(field, expected)?),
                    "$ne" => result = result.not_equals(field.as_str(), scalar_value(field, expected)?),
                    "$in" => {
                        let values = expected
                            .as_array()
                            .ok_or_else(|| invalid(format!("$in on '{}' expects an array", field)))?
                            .iter()
                            .map(|v| scalar_value(field, v))
                            .collect::<RetrievalResult<Vec<_>>>()?;
                        result = result.one_of(field.as_str(), values);
                    }
                    "$gte" => min = Some(number(field, op, expected)?),
                    "$lte" => max = Some(number(field, op, expected)?),
                    other => {
                        return Err(invalid(format!(
                            "unsupported filter operator '{}' on '{}'",
                            other, field
                        )))
                    }
                }
            }
            if min.is_some() || max.is_some() {
                result = result.range(field.as_str(), min, max);
            }
        }
        Ok(result)
    }
}

fn invalid(message: String) -> RetrievalError {
    RetrievalError::InvalidConfig(message)
}

fn scalar_value(field: &str, value: &Value) -> RetrievalResult<MetadataValue> {
    MetadataValue::from_json(value)
        .ok_or_else(|| invalid(format!("filter value for '{}' must be a scalar", field)))
}

fn number(field: &str, op: &str, value: &Value) -> RetrievalResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| invalid(format!("{} on '{}' expects a number", op, field)))
}

fn parse_created(operators: &serde_json::Map<String, Value>) -> RetrievalResult<Condition> {
    let mut from = None;
    let mut to = None;
    for (op, value) in operators {
        let timestamp = value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| invalid(format!("{} on created_at expects an RFC 3339 time", op)))?;
        match op.as_str() {
            "$gte" => from = Some(timestamp),
            "$lte" => to = Some(timestamp),
            other => {
                return Err(invalid(format!(
                    "unsupported operator '{}' on created_at",
                    other
                )))
            }
        }
    }
    Ok(Condition::CreatedBetween { from, to })
}
