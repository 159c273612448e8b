// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Rank fusion across modality indexes
//!
//! Every strategy keys candidates by id, so one image indexed under both
//! `image_visual` and `image_text` yields a single fused entry.
//!
//! Ordering is total and deterministic:
//! 1. fused score, descending
//! 2. raw similarity in the highest-weighted modality, descending
//! 3. id, ascending

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use crate::config::ModalityWeights;
use crate::rag::types::{FusedResult, RankedList};
use crate::vector::types::{Metadata, Modality, VectorId};

/// Default damping constant for reciprocal-rank fusion
pub const RRF_C: f32 = 60.0;

/// Combines per-index rankings into one ranking
pub trait FusionStrategy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Fuse `lists` (each ordered best first) into a ranking ordered by
    /// descending fused score
    fn fuse(&self, lists: &[RankedList], weights: &ModalityWeights) -> Vec<FusedResult>;
}

/// `Σ weight[modality] / (rank + c)` with 1-based ranks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedReciprocalRank {
    pub c: f32,
}

impl Default for WeightedReciprocalRank {
    fn default() -> Self {
        Self { c: RRF_C }
    }
}

impl WeightedReciprocalRank {
    pub fn new(c: f32) -> Self {
        Self { c }
    }
}

impl FusionStrategy for WeightedReciprocalRank {
    fn name(&self) -> &'static str {
        "weighted_rrf"
    }

    fn fuse(&self, lists: &[RankedList], weights: &ModalityWeights) -> Vec<FusedResult> {
        let c = self.c;
        fuse_with(lists, weights, |rank, _score, weight| {
            weight / (rank as f32 + c)
        })
    }
}

/// `Σ weight[modality] * similarity`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightedScoreSum;

impl FusionStrategy for WeightedScoreSum {
    fn name(&self) -> &'static str {
        "weighted_score_sum"
    }

    fn fuse(&self, lists: &[RankedList], weights: &ModalityWeights) -> Vec<FusedResult> {
        fuse_with(lists, weights, |_rank, score, weight| weight * score)
    }
}

struct Accumulator {
    fused_score: f32,
    contributing_scores: BTreeMap<Modality, f32>,
    /// Per-modality share of `fused_score`
    contributions: BTreeMap<Modality, f32>,
    collections: BTreeMap<Modality, String>,
    metadata: BTreeMap<Modality, Metadata>,
}

/// Shared accumulation; `contribution(rank, score, weight)` gets 1-based ranks
fn fuse_with<F>(lists: &[RankedList], weights: &ModalityWeights, contribution: F) -> Vec<FusedResult>
where
    F: Fn(usize, f32, f32) -> f32,
{
    let mut acc: HashMap<&VectorId, Accumulator> = HashMap::new();

    for list in lists {
        let modality = list.key.modality;
        let weight = weights.weight(modality);
        for (position, candidate) in list.candidates.iter().enumerate() {
            let share = contribution(position + 1, candidate.score, weight);
            let entry = acc.entry(&candidate.id).or_insert_with(|| Accumulator {
                fused_score: 0.0,
                contributing_scores: BTreeMap::new(),
                contributions: BTreeMap::new(),
                collections: BTreeMap::new(),
                metadata: BTreeMap::new(),
            });
            entry.fused_score += share;
            *entry.contributions.entry(modality).or_insert(0.0) += share;

            let best = entry
                .contributing_scores
                .entry(modality)
                .or_insert(f32::NEG_INFINITY);
            if candidate.score > *best {
                *best = candidate.score;
                entry
                    .collections
                    .insert(modality, candidate.collection.clone());
                entry.metadata.insert(modality, candidate.metadata.clone());
            }
        }
    }

    let dominant = weights.dominant();
    let mut fused: Vec<FusedResult> = acc
        .into_iter()
        .map(|(id, entry)| finish(id.clone(), entry))
        .collect();
    fused.sort_by(|a, b| compare(a, b, dominant));
    fused
}

fn finish(id: VectorId, entry: Accumulator) -> FusedResult {
    // Largest contribution wins; BTreeMap order settles ties
    let mut modality = Modality::ALL[0];
    let mut top = f32::NEG_INFINITY;
    for (&m, &share) in &entry.contributions {
        if share > top {
            top = share;
            modality = m;
        }
    }

    // Primary modality's values take precedence
    let mut metadata = Metadata::new();
    for (_, values) in entry.metadata.iter().filter(|(m, _)| **m != modality) {
        metadata.extend(values.clone());
    }
    if let Some(primary) = entry.metadata.get(&modality) {
        metadata.extend(primary.clone());
    }

    FusedResult {
        id,
        modality,
        collection: entry.collections.get(&modality).cloned().unwrap_or_default(),
        fused_score: entry.fused_score,
        contributing_scores: entry.contributing_scores,
        metadata,
    }
}

fn compare(a: &FusedResult, b: &FusedResult, dominant: Modality) -> Ordering {
    let raw = |r: &FusedResult| {
        r.contributing_scores
            .get(&dominant)
            .copied()
            .unwrap_or(f32::NEG_INFINITY)
    };
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| raw(b).total_cmp(&raw(a)))
        .then_with(|| a.id.cmp(&b.id))
}
