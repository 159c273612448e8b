// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Retrieval side: hybrid search across modality indexes, rank fusion,
// and composition of citable context for generation

pub mod composer;
pub mod filter;
pub mod fusion;
pub mod retriever;
pub mod types;

pub use composer::ContextComposer;
pub use filter::{Condition, MetadataFilter};
pub use fusion::{FusionStrategy, WeightedReciprocalRank, WeightedScoreSum, RRF_C};
pub use retriever::{HybridQuery, HybridRetriever};
pub use types::{Candidate, ContextBundle, ContextItem, FusedResult, RankedList};
