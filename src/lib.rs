// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod rag;
pub mod vector;
pub mod version;

// Re-export main types
pub use config::EngineConfig;
pub use engine::{EngineStats, IndexSummary, RetrievalEngine};
pub use errors::{RetrievalError, RetrievalResult};
pub use rag::{ContextBundle, ContextItem, FusedResult, HybridQuery, MetadataFilter};
pub use vector::{EmbeddingRecord, IndexKey, Metadata, MetadataValue, Modality};
