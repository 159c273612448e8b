// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Retrieval engine facade
//!
//! Bundles the canonical store, the index manager, the hybrid retriever
//! and the context composer behind the two surfaces callers need:
//! ingestion (`submit_embedding`, `delete`) and querying (`retrieve`,
//! `compose`).

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::errors::RetrievalResult;
use crate::rag::{
    ContextBundle, ContextComposer, FusedResult, FusionStrategy, HybridQuery, HybridRetriever,
};
use crate::vector::hnsw::IndexStats;
use crate::vector::index_manager::{IndexManager, RestoreReport};
use crate::vector::store::{FileVectorStore, MemoryVectorStore, VectorStore};
use crate::vector::types::{EmbeddingRecord, IndexKey, Metadata, Modality};

const RECORDS_DIR: &str = "records";

/// Engine-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub records: usize,
    pub indexes: Vec<IndexSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub modality: Modality,
    pub collection: String,
    pub live: usize,
    pub tombstoned: usize,
    pub generation: u64,
    pub max_level: usize,
    pub edges: usize,
}

impl IndexSummary {
    fn new(key: IndexKey, stats: IndexStats) -> Self {
        Self {
            modality: key.modality,
            collection: key.collection,
            live: stats.live,
            tombstoned: stats.tombstoned,
            generation: stats.generation,
            max_level: stats.max_level,
            edges: stats.edges,
        }
    }
}

pub struct RetrievalEngine {
    config: Arc<EngineConfig>,
    manager: Arc<IndexManager>,
    retriever: HybridRetriever,
    composer: ContextComposer,
    /// Set when records live in a log that `persist` can compact
    file_store: Option<Arc<FileVectorStore>>,
}

impl RetrievalEngine {
    /// Open the engine described by `config`: file-backed when a data
    /// directory is configured, in-memory otherwise. Indexes are restored
    /// from snapshots where valid and rebuilt from records elsewhere.
    pub async fn open(config: EngineConfig) -> RetrievalResult<Self> {
        config.validate()?;
        match config.index.data_dir.clone() {
            Some(dir) => {
                let store = Arc::new(FileVectorStore::open(dir.join(RECORDS_DIR)).await?);
                let engine = Self::assemble(config, store.clone(), Some(store));
                engine.restore().await?;
                Ok(engine)
            }
            None => Self::with_store(config, Arc::new(MemoryVectorStore::new())).await,
        }
    }

    /// Engine over a caller-supplied store
    pub async fn with_store(
        config: EngineConfig,
        store: Arc<dyn VectorStore>,
    ) -> RetrievalResult<Self> {
        config.validate()?;
        let engine = Self::assemble(config, store, None);
        engine.restore().await?;
        Ok(engine)
    }

    fn assemble(
        config: EngineConfig,
        store: Arc<dyn VectorStore>,
        file_store: Option<Arc<FileVectorStore>>,
    ) -> Self {
        let config = Arc::new(config);
        let manager = Arc::new(IndexManager::new(Arc::clone(&config), store));
        let retriever = HybridRetriever::new(Arc::clone(&manager), &config);
        let composer = ContextComposer::new(config.composer.clone());
        Self {
            config,
            manager,
            retriever,
            composer,
            file_store,
        }
    }

    async fn restore(&self) -> RetrievalResult<RestoreReport> {
        self.manager.restore().await
    }

    /// Replace the fusion strategy
    pub fn with_fusion(mut self, fusion: Arc<dyn FusionStrategy>) -> Self {
        self.retriever = HybridRetriever::with_fusion(Arc::clone(&self.manager), &self.config, fusion);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    pub async fn submit_embedding(
        &self,
        id: impl Into<String>,
        modality: Modality,
        collection: impl Into<String>,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> RetrievalResult<()> {
        let mut record = EmbeddingRecord::new(id, modality, collection, vector);
        record.metadata = metadata;
        self.manager.put(record).await
    }

    /// Store and index a fully formed record
    pub async fn put(&self, record: EmbeddingRecord) -> RetrievalResult<()> {
        self.manager.put(record).await
    }

    /// Delete every embedding stored under `id`
    pub async fn delete(&self, id: &str) -> RetrievalResult<usize> {
        self.manager.delete(id, None).await
    }

    /// Delete only the `modality` embedding of `id`
    pub async fn delete_modality(&self, id: &str, modality: Modality) -> RetrievalResult<usize> {
        self.manager.delete(id, Some(modality)).await
    }

    pub async fn retrieve(&self, query: &HybridQuery) -> RetrievalResult<Vec<FusedResult>> {
        self.retriever.retrieve(query).await
    }

    pub fn compose(&self, results: &[FusedResult], text_budget: Option<usize>) -> ContextBundle {
        self.composer.compose(results, text_budget)
    }

    pub async fn stats(&self) -> RetrievalResult<EngineStats> {
        Ok(EngineStats {
            records: self.manager.store().len().await?,
            indexes: self
                .manager
                .stats()
                .into_iter()
                .map(|(key, stats)| IndexSummary::new(key, stats))
                .collect(),
        })
    }

    /// Rebuild one index; returns its new generation
    pub fn rebuild(&self, modality: Modality, collection: &str) -> RetrievalResult<u64> {
        self.manager.rebuild(modality, collection)
    }

    pub fn rebuild_all(&self) -> RetrievalResult<usize> {
        self.manager.rebuild_all()
    }

    /// Snapshot every index and compact the record log.
    /// Returns the number of snapshots written.
    pub async fn persist(&self) -> RetrievalResult<usize> {
        if let Some(store) = &self.file_store {
            store.compact().await?;
        }
        let manager = Arc::clone(&self.manager);
        let written = tokio::task::spawn_blocking(move || manager.persist_all())
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))??;
        info!("💾 Engine state persisted ({} index snapshots)", written);
        Ok(written)
    }
}
