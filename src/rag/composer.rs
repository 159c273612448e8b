// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Context composer
//!
//! Turns a fused ranking into a citation-numbered bundle whose snippets
//! fit a character budget:
//! - results for the same source document/image collapse into one item
//!   (highest fused score kept, snippets merged)
//! - top-ranked snippets are kept whole while they fit
//! - the remaining budget is shared by the rest in proportion to their
//!   length; items whose share would fall below the floor are omitted
//!   from the bottom up, never trimmed to nothing

use tracing::debug;

use crate::config::ComposerConfig;
use crate::rag::filter::TEXT_FIELDS;
use crate::rag::types::{ContextBundle, ContextItem, FusedResult};
use crate::vector::types::{Metadata, MetadataValue, Modality, VectorId};

const ELLIPSIS: char = '…';
const SNIPPET_SEPARATOR: &str = " | ";

/// Deduplicated result before budgeting
struct Draft {
    id: VectorId,
    modality: Modality,
    fused_score: f32,
    reference_uri: String,
    snippets: Vec<String>,
}

impl Draft {
    fn text(&self) -> Option<String> {
        if self.snippets.is_empty() {
            None
        } else {
            Some(self.snippets.join(SNIPPET_SEPARATOR))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextComposer {
    config: ComposerConfig,
}

impl ContextComposer {
    pub fn new(config: ComposerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Compose `results` (best first) under `text_budget` characters, or the
    /// configured budget when `None`
    pub fn compose(&self, results: &[FusedResult], text_budget: Option<usize>) -> ContextBundle {
        let budget = text_budget.unwrap_or(self.config.text_budget_chars);
        let drafts = self.deduplicate(results);
        let texts: Vec<Option<String>> = drafts.iter().map(Draft::text).collect();
        let lengths: Vec<usize> = texts
            .iter()
            .map(|t| t.as_ref().map_or(0, |s| s.chars().count()))
            .collect();
        let allowances = allocate(&lengths, budget, self.config.min_snippet_chars);

        let mut bundle = ContextBundle {
            budget_chars: budget,
            ..Default::default()
        };
        for ((draft, text), allowance) in drafts.into_iter().zip(texts).zip(allowances) {
            let text_snippet = match (text, allowance) {
                (None, _) => None,
                (Some(_), None) => {
                    debug!("Omitting {}: snippet would fall below the floor", draft.id);
                    bundle.omitted += 1;
                    continue;
                }
                (Some(text), Some(limit)) => Some(truncate_chars(&text, limit)),
            };
            bundle.total_chars += text_snippet.as_ref().map_or(0, |s| s.chars().count());
            bundle.items.push(ContextItem {
                citation_rank: bundle.items.len() + 1,
                id: draft.id,
                modality: draft.modality,
                text_snippet,
                reference_uri: draft.reference_uri,
                fused_score: draft.fused_score,
            });
        }
        bundle
    }

    fn deduplicate(&self, results: &[FusedResult]) -> Vec<Draft> {
        let mut drafts: Vec<Draft> = Vec::new();
        let mut keys: Vec<String> = Vec::new();

        for result in results {
            let key = dedup_key(result);
            let snippet = snippet(&result.metadata);
            match keys.iter().position(|k| *k == key) {
                Some(slot) => {
                    let draft = &mut drafts[slot];
                    if result.fused_score > draft.fused_score {
                        draft.id = result.id.clone();
                        draft.modality = result.modality;
                        draft.fused_score = result.fused_score;
                        draft.reference_uri = self.reference_uri(result);
                    }
                    if let Some(snippet) = snippet {
                        if !draft.snippets.contains(&snippet) {
                            draft.snippets.push(snippet);
                        }
                    }
                }
                None => {
                    keys.push(key);
                    drafts.push(Draft {
                        id: result.id.clone(),
                        modality: result.modality,
                        fused_score: result.fused_score,
                        reference_uri: self.reference_uri(result),
                        snippets: snippet.into_iter().collect(),
                    });
                }
            }
        }
        drafts
    }

    fn reference_uri(&self, result: &FusedResult) -> String {
        match result.metadata.get("reference_uri").and_then(MetadataValue::as_str) {
            Some(uri) => uri.to_string(),
            None => format!(
                "{}/{}",
                self.config.reference_uri_prefix.trim_end_matches('/'),
                result.id
            ),
        }
    }
}

fn dedup_key(result: &FusedResult) -> String {
    ["source_id", "document_id"]
        .iter()
        .find_map(|field| result.metadata.get(*field))
        .map(scalar_to_string)
        .unwrap_or_else(|| result.id.clone())
}

fn scalar_to_string(value: &MetadataValue) -> String {
    match value {
        MetadataValue::Text(s) => s.clone(),
        MetadataValue::Int(v) => v.to_string(),
        MetadataValue::Float(v) => v.to_string(),
        MetadataValue::Bool(v) => v.to_string(),
    }
}

/// First non-blank text field
fn snippet(metadata: &Metadata) -> Option<String> {
    TEXT_FIELDS
        .iter()
        .filter_map(|field| metadata.get(*field).and_then(MetadataValue::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

/// Character allowance per snippet; `None` means omit.
/// Zero-length entries always get `Some(0)`.
fn allocate(lengths: &[usize], budget: usize, floor: usize) -> Vec<Option<usize>> {
    let mut allowances: Vec<Option<usize>> = lengths.iter().map(|_| None).collect();
    let mut remaining = budget;

    // Whole snippets, in rank order, while they fit
    let mut first_cut = lengths.len();
    for (i, &len) in lengths.iter().enumerate() {
        if len <= remaining {
            allowances[i] = Some(len);
            remaining -= len;
        } else {
            first_cut = i;
            break;
        }
    }

    let mut tail: Vec<usize> = (first_cut..lengths.len()).collect();
    for &i in &tail {
        if lengths[i] == 0 {
            allowances[i] = Some(0);
        }
    }
    tail.retain(|&i| lengths[i] > 0);

    // Proportional shares; drop the lowest-ranked until every share clears the floor
    while !tail.is_empty() {
        let total: usize = tail.iter().map(|&i| lengths[i]).sum();
        let shares: Vec<usize> = tail
            .iter()
            .map(|&i| ((remaining as u128 * lengths[i] as u128) / total as u128) as usize)
            .map(|share| share.min(remaining))
            .collect();
        let clears = tail
            .iter()
            .zip(&shares)
            .all(|(&i, &share)| share >= floor.min(lengths[i]).max(1));
        if clears {
            for (&i, share) in tail.iter().zip(shares) {
                allowances[i] = Some(share.min(lengths[i]));
            }
            break;
        }
        tail.pop();
    }

    allowances
}

/// Cut to at most `limit` characters, marking the cut with an ellipsis
fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    if limit == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(limit - 1).collect();
    out.push(ELLIPSIS);
    out
}
