// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Hybrid retriever
//!
//! One query fans out to every index in scope. Sub-searches run
//! concurrently on the blocking pool, each under its own deadline; a
//! sub-search that times out or fails non-fatally contributes nothing
//! instead of failing the query. Survivors of the metadata post-filter
//! are fused into a single ranking.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{EngineConfig, HnswConfig, RetrievalConfig};
use crate::errors::{RetrievalError, RetrievalResult};
use crate::rag::filter::MetadataFilter;
use crate::rag::fusion::{FusionStrategy, WeightedReciprocalRank};
use crate::rag::types::{Candidate, FusedResult, RankedList};
use crate::vector::index_manager::{IndexHandle, IndexManager};
use crate::vector::types::Modality;

/// A retrieval request
#[derive(Debug, Clone, Default)]
pub struct HybridQuery {
    /// Routed to every in-scope index whose dimension matches
    pub vector: Option<Vec<f32>>,
    /// Overrides `vector` for one modality
    pub modality_vectors: BTreeMap<Modality, Vec<f32>>,
    /// Modalities to search; all when `None`
    pub modalities: Option<Vec<Modality>>,
    /// Collections to search; all when empty
    pub collections: Vec<String>,
    pub filter: MetadataFilter,
    /// Final result count; the configured default when `None`
    pub k: Option<usize>,
    /// Search-time candidate list size; the configured default when `None`
    pub ef: Option<usize>,
}

impl HybridQuery {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector: Some(vector),
            ..Default::default()
        }
    }

    pub fn for_modality(mut self, modality: Modality, vector: Vec<f32>) -> Self {
        self.modality_vectors.insert(modality, vector);
        self
    }

    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.push(collection.into());
        self
    }

    pub fn with_modalities(mut self, modalities: Vec<Modality>) -> Self {
        self.modalities = Some(modalities);
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_ef(mut self, ef: usize) -> Self {
        self.ef = Some(ef);
        self
    }

    fn in_scope(&self, handle: &IndexHandle) -> bool {
        let key = handle.key();
        let modality_ok = self
            .modalities
            .as_ref()
            .map_or(true, |scope| scope.contains(&key.modality));
        let collection_ok =
            self.collections.is_empty() || self.collections.iter().any(|c| *c == key.collection);
        modality_ok && collection_ok
    }
}

pub struct HybridRetriever {
    manager: Arc<IndexManager>,
    fusion: Arc<dyn FusionStrategy>,
    settings: RetrievalConfig,
    hnsw: HnswConfig,
}

impl HybridRetriever {
    pub fn new(manager: Arc<IndexManager>, config: &EngineConfig) -> Self {
        let fusion = Arc::new(WeightedReciprocalRank::new(config.retrieval.rrf_c));
        Self::with_fusion(manager, config, fusion)
    }

    pub fn with_fusion(
        manager: Arc<IndexManager>,
        config: &EngineConfig,
        fusion: Arc<dyn FusionStrategy>,
    ) -> Self {
        Self {
            manager,
            fusion,
            settings: config.retrieval.clone(),
            hnsw: config.hnsw.clone(),
        }
    }

    pub fn fusion(&self) -> &dyn FusionStrategy {
        self.fusion.as_ref()
    }

    /// Search every in-scope index and fuse the results.
    ///
    /// No index in scope is not an error: the result is simply empty.
    pub async fn retrieve(&self, query: &HybridQuery) -> RetrievalResult<Vec<FusedResult>> {
        let start = Instant::now();
        let k = query.k.unwrap_or(self.settings.default_k);
        if k == 0 {
            return Ok(Vec::new());
        }
        if query.vector.is_none() && query.modality_vectors.is_empty() {
            return Err(RetrievalError::InvalidVector(
                "query carries no vector".to_string(),
            ));
        }

        let mut targets = Vec::new();
        for handle in self.manager.handles() {
            if !query.in_scope(&handle) {
                continue;
            }
            let modality = handle.key().modality;
            let dimension = handle.index().dimension();
            if let Some(vector) = query.modality_vectors.get(&modality) {
                if vector.len() != dimension {
                    return Err(RetrievalError::DimensionMismatch {
                        expected: dimension,
                        actual: vector.len(),
                    });
                }
                targets.push((handle, vector.clone()));
            } else if let Some(vector) = &query.vector {
                if vector.len() == dimension {
                    targets.push((handle, vector.clone()));
                } else {
                    debug!(
                        "Skipping {}: query is {}D, index is {}D",
                        handle.key(),
                        vector.len(),
                        dimension
                    );
                }
            }
        }

        if targets.is_empty() {
            debug!("No indexes in scope; returning empty result");
            return Ok(Vec::new());
        }

        let timeout = Duration::from_millis(self.settings.sub_search_timeout_ms);
        let searches = targets.into_iter().map(|(handle, vector)| {
            let key = handle.key().clone();
            async move {
                match tokio::time::timeout(timeout, self.search_index(handle, vector, k, query))
                    .await
                {
                    Ok(Ok(list)) => Ok(list),
                    Ok(Err(e)) if e.is_fatal() => Err(e),
                    Ok(Err(e)) => {
                        warn!("⚠️  Sub-search on {} failed, skipping: {}", key, e);
                        Ok(RankedList::empty(key))
                    }
                    Err(_) => {
                        let e = RetrievalError::Timeout {
                            modality: key.modality,
                            collection: key.collection.clone(),
                            timeout_ms: self.settings.sub_search_timeout_ms,
                        };
                        warn!("⏱️  {}; contributing no candidates", e);
                        Ok(RankedList::empty(key))
                    }
                }
            }
        });

        let lists = join_all(searches)
            .await
            .into_iter()
            .collect::<RetrievalResult<Vec<_>>>()?;

        let mut fused = self.fusion.fuse(&lists, &self.settings.weights);
        fused.truncate(k);

        debug!(
            "Retrieved {} results from {} indexes via {} in {:?}",
            fused.len(),
            lists.len(),
            self.fusion.name(),
            start.elapsed()
        );
        Ok(fused)
    }

    /// Search one index, hydrate hits from the store and post-filter them
    async fn search_index(
        &self,
        handle: Arc<IndexHandle>,
        vector: Vec<f32>,
        k: usize,
        query: &HybridQuery,
    ) -> RetrievalResult<RankedList> {
        let factor = self.settings.oversample_factor.max(1);
        let mut candidates = self
            .search_once(&handle, &vector, k.saturating_mul(factor), query)
            .await?;

        if let Some(retry) = self.settings.underfill_retry_factor {
            if candidates.len() < k && retry > factor {
                debug!(
                    "{} under-filled after filtering ({} < {}); retrying with factor {}",
                    handle.key(),
                    candidates.len(),
                    k,
                    retry
                );
                candidates = self
                    .search_once(&handle, &vector, k.saturating_mul(retry), query)
                    .await?;
            }
        }

        Ok(RankedList::new(handle.key().clone(), candidates))
    }

    async fn search_once(
        &self,
        handle: &Arc<IndexHandle>,
        vector: &[f32],
        limit: usize,
        query: &HybridQuery,
    ) -> RetrievalResult<Vec<Candidate>> {
        let ef = query.ef.unwrap_or(self.hnsw.ef_search).max(limit);
        let task_handle = Arc::clone(handle);
        let task_vector = vector.to_vec();
        let neighbors = tokio::task::spawn_blocking(move || {
            task_handle.index().search(&task_vector, limit, ef)
        })
        .await
        .map_err(|e| RetrievalError::CorruptIndexState(format!("search task failed: {}", e)))??;

        let modality = handle.key().modality;
        let store = self.manager.store();
        let mut candidates = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            // Deleted between search and hydration
            let record = match store.get(&neighbor.id, modality).await? {
                Some(record) => record,
                None => continue,
            };
            let candidate = Candidate::from_record(record, neighbor.score);
            if query.filter.matches(&candidate) {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }
}
