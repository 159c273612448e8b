// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Canonical data model for stored embeddings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{RetrievalError, RetrievalResult};

/// Opaque identifier shared by all embeddings of one item
pub type VectorId = String;

/// Scalar metadata attached to a record
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Maximum serialized metadata size per record (10KB)
pub const MAX_METADATA_SIZE: usize = 10 * 1024;

/// Embedding space a vector belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    ImageVisual,
    ImageText,
    DocumentText,
}

impl Modality {
    pub const ALL: [Modality; 3] = [
        Modality::ImageVisual,
        Modality::ImageText,
        Modality::DocumentText,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::ImageVisual => "image_visual",
            Modality::ImageText => "image_text",
            Modality::DocumentText => "document_text",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image_visual" => Ok(Modality::ImageVisual),
            "image_text" => Ok(Modality::ImageText),
            "document_text" => Ok(Modality::DocumentText),
            other => Err(RetrievalError::InvalidConfig(format!(
                "unknown modality '{}'",
                other
            ))),
        }
    }
}

/// Scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(v) => Some(*v as f64),
            MetadataValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON scalar; arrays, objects and null have no scalar form
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(MetadataValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(MetadataValue::Int)
                .or_else(|| n.as_f64().map(MetadataValue::Float)),
            serde_json::Value::String(s) => Some(MetadataValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Equality that treats `Int(3)` and `Float(3.0)` as the same number
    pub fn loosely_equals(&self, other: &MetadataValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// One stored embedding. Never mutated in place; updates are delete-then-insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: VectorId,
    pub modality: Modality,
    pub vector: Vec<f32>,
    pub collection: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn new(
        id: impl Into<VectorId>,
        modality: Modality,
        collection: impl Into<String>,
        vector: Vec<f32>,
    ) -> Self {
        Self {
            id: id.into(),
            modality,
            vector,
            collection: collection.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Key of the index this record belongs to
    pub fn index_key(&self) -> IndexKey {
        IndexKey::new(self.modality, self.collection.clone())
    }

    /// Reject metadata larger than [`MAX_METADATA_SIZE`]
    pub fn validate_metadata(&self) -> RetrievalResult<()> {
        let size = serde_json::to_string(&self.metadata)?.len();
        if size > MAX_METADATA_SIZE {
            return Err(RetrievalError::MetadataTooLarge {
                size,
                limit: MAX_METADATA_SIZE,
            });
        }
        Ok(())
    }
}

/// Identifies one ANN index: `(modality, collection)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub modality: Modality,
    pub collection: String,
}

impl IndexKey {
    pub fn new(modality: Modality, collection: impl Into<String>) -> Self {
        Self {
            modality,
            collection: collection.into(),
        }
    }

    /// File-system safe name used for persisted snapshots.
    /// A digest suffix keeps distinct collections apart after sanitising.
    pub fn file_stem(&self) -> String {
        let collection: String = self
            .collection
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let digest = hex::encode(Sha256::digest(self.collection.as_bytes()));
        format!("{}__{}_{}", self.modality, collection, &digest[..8])
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.modality, self.collection)
    }
}
