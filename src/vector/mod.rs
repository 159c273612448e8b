// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod embeddings;
pub mod hnsw;
pub mod index_manager;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use hnsw::{HnswIndex, HnswParams, IndexStats, Neighbor};
pub use index_manager::{IndexHandle, IndexManager, RestoreReport};
pub use store::{FileVectorStore, MemoryVectorStore, VectorStore};
pub use types::{EmbeddingRecord, IndexKey, Metadata, MetadataValue, Modality, VectorId};
