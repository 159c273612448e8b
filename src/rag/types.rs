// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Per-request retrieval types: nothing here is persisted

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::vector::types::{EmbeddingRecord, IndexKey, Metadata, Modality, VectorId};

/// One hit from a single index search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: VectorId,
    pub modality: Modality,
    pub collection: String,
    /// Cosine similarity to the query
    pub score: f32,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn from_record(record: EmbeddingRecord, score: f32) -> Self {
        Self {
            id: record.id,
            modality: record.modality,
            collection: record.collection,
            score,
            metadata: record.metadata,
            created_at: record.created_at,
        }
    }
}

/// Candidates from one index, best first
#[derive(Debug, Clone, PartialEq)]
pub struct RankedList {
    pub key: IndexKey,
    pub candidates: Vec<Candidate>,
}

impl RankedList {
    pub fn new(key: IndexKey, candidates: Vec<Candidate>) -> Self {
        Self { key, candidates }
    }

    pub fn empty(key: IndexKey) -> Self {
        Self::new(key, Vec::new())
    }
}

/// One entry of the fused ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub id: VectorId,
    /// Modality that contributed most to `fused_score`
    pub modality: Modality,
    pub collection: String,
    pub fused_score: f32,
    /// Raw similarity per contributing modality
    pub contributing_scores: BTreeMap<Modality, f32>,
    /// Metadata merged across contributing records
    pub metadata: Metadata,
}

/// A citable unit handed to generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: VectorId,
    pub modality: Modality,
    pub text_snippet: Option<String>,
    pub reference_uri: String,
    /// 1-based, matches presentation order
    pub citation_rank: usize,
    pub fused_score: f32,
}

/// Budgeted, citation-numbered context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    /// Characters used by all snippets
    pub total_chars: usize,
    pub budget_chars: usize,
    /// Results dropped because their snippet could not reach the floor
    pub omitted: usize,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Prompt-ready text, one `[n] snippet (uri)` line per item
    pub fn render(&self) -> String {
        self.items
            .iter()
            .map(|item| match &item.text_snippet {
                Some(snippet) => format!(
                    "[{}] {} ({})",
                    item.citation_rank, snippet, item.reference_uri
                ),
                None => format!("[{}] ({})", item.citation_rank, item.reference_uri),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
