// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! HNSW Index for Fast Vector Search
//!
//! Hierarchical Navigable Small World graph for approximate nearest
//! neighbor search over L2-normalised embeddings (cosine similarity as
//! dot product).
//!
//! ## Features
//!
//! - **Tunable recall**: `ef` trades latency for recall at query time
//! - **Diversity pruning**: neighbor lists favour spread over raw proximity
//! - **Tombstones**: deletes hide nodes immediately, edges go at rebuild
//! - **Lock-light concurrency**: readers never block each other
//! - **Snapshots**: graph structure persists without duplicating live vectors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fabstir_retrieval_engine::vector::hnsw::{HnswIndex, HnswParams};
//!
//! let index = HnswIndex::new(768, HnswParams::new(16, 200), None);
//! index.insert("doc-1", &embedding)?;
//! let hits = index.search(&query, 10, 64)?;
//! ```

mod graph;
mod index;
mod serialize;

pub use graph::{HnswGraph, HnswParams, InsertPlan, Neighbor, MAX_LEVEL};
pub use index::{HnswIndex, IndexStats};
pub use serialize::live_fingerprint;
