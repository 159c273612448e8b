// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Index manager: one HNSW index per `(modality, collection)`
//!
//! Writes go to the canonical store first and are then applied to the
//! owning index. Deletes tombstone the index node; once a handle's
//! tombstone share crosses the configured ratio a background rebuild is
//! scheduled (at most one per handle at a time).
//!
//! Puts and deletes of the same id are serialised by a striped lock held
//! across both the store step and the index step, so the store and the
//! indexes agree once both calls return.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::errors::{RetrievalError, RetrievalResult};
use crate::vector::embeddings;
use crate::vector::hnsw::{HnswIndex, HnswParams, IndexStats};
use crate::vector::store::VectorStore;
use crate::vector::types::{EmbeddingRecord, IndexKey, Modality, VectorId};

const SNAPSHOT_DIR: &str = "indexes";
const ID_LOCK_STRIPES: usize = 64;

/// An index plus its bookkeeping
#[derive(Debug)]
pub struct IndexHandle {
    key: IndexKey,
    index: HnswIndex,
    rebuild_in_flight: AtomicBool,
}

impl IndexHandle {
    fn new(key: IndexKey, index: HnswIndex) -> Self {
        Self {
            key,
            index,
            rebuild_in_flight: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &IndexKey {
        &self.key
    }

    pub fn index(&self) -> &HnswIndex {
        &self.index
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuild_in_flight.load(Ordering::Acquire)
    }
}

/// Outcome of [`IndexManager::restore`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    /// Handles loaded from a snapshot
    pub loaded: usize,
    /// Handles rebuilt from the store (no snapshot, or snapshot rejected)
    pub rebuilt: usize,
    pub records: usize,
}

pub struct IndexManager {
    config: Arc<EngineConfig>,
    store: Arc<dyn VectorStore>,
    handles: RwLock<HashMap<IndexKey, Arc<IndexHandle>>>,
    /// Per-id write locks, striped by hash
    id_locks: Vec<Mutex<()>>,
}

impl IndexManager {
    pub fn new(config: Arc<EngineConfig>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            config,
            store,
            handles: RwLock::new(HashMap::new()),
            id_locks: (0..ID_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock_id(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.id_locks.len() as u64) as usize;
        self.id_locks[stripe].lock().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    fn params(&self) -> HnswParams {
        HnswParams::from(&self.config.hnsw)
    }

    fn create_index(&self, modality: Modality) -> HnswIndex {
        HnswIndex::new(
            self.config.modalities.dimension(modality),
            self.params(),
            self.config.hnsw.seed,
        )
    }

    /// Existing handle for `key`, creating an empty index on first use
    pub fn get_or_create(&self, key: &IndexKey) -> Arc<IndexHandle> {
        if let Some(handle) = self.handles.read().get(key) {
            return Arc::clone(handle);
        }
        let mut handles = self.handles.write();
        Arc::clone(handles.entry(key.clone()).or_insert_with(|| {
            info!("📇 Created index {}", key);
            Arc::new(IndexHandle::new(key.clone(), self.create_index(key.modality)))
        }))
    }

    /// Handle for an index that has seen at least one insert
    pub fn get_index(
        &self,
        modality: Modality,
        collection: &str,
    ) -> RetrievalResult<Arc<IndexHandle>> {
        self.handles
            .read()
            .get(&IndexKey::new(modality, collection))
            .cloned()
            .ok_or_else(|| RetrievalError::UnknownCollection {
                modality,
                collection: collection.to_string(),
            })
    }

    /// Every handle, ordered by key
    pub fn handles(&self) -> Vec<Arc<IndexHandle>> {
        let mut handles: Vec<_> = self.handles.read().values().cloned().collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key));
        handles
    }

    /// Validate, normalise and store a record, then index it.
    ///
    /// Re-putting an existing `(id, modality)` replaces the old embedding;
    /// if the collection changed the old index node is tombstoned.
    pub async fn put(&self, mut record: EmbeddingRecord) -> RetrievalResult<()> {
        let dimension = self.config.modalities.dimension(record.modality);
        record.vector = embeddings::prepare(&record.vector, dimension)?;
        record.validate_metadata()?;

        let key = record.index_key();
        let id = record.id.clone();
        let vector = record.vector.clone();

        let _guard = self.lock_id(&id).await;
        let previous = self.store.put(record).await?;
        if let Some(previous) = previous {
            let old_key = previous.index_key();
            if old_key != key {
                self.remove_from_index(&old_key, &id);
            }
        }

        let handle = self.get_or_create(&key);
        handle.index.insert(id.clone(), &vector)?;
        debug!("Indexed {} in {}", id, key);
        self.maybe_compact(&handle);
        Ok(())
    }

    /// Delete `id` from the store and its indexes. `None` removes every modality.
    /// Returns the number of embeddings removed.
    pub async fn delete(&self, id: &str, modality: Option<Modality>) -> RetrievalResult<usize> {
        let _guard = self.lock_id(id).await;
        let removed = self.store.delete(id, modality).await?;
        if removed.is_empty() {
            return Err(RetrievalError::NotFound(id.to_string()));
        }
        for record in &removed {
            self.remove_from_index(&record.index_key(), &record.id);
        }
        info!("🗑️  Deleted {} ({} embeddings)", id, removed.len());
        Ok(removed.len())
    }

    fn remove_from_index(&self, key: &IndexKey, id: &VectorId) {
        let handle = match self.handles.read().get(key) {
            Some(handle) => Arc::clone(handle),
            None => {
                warn!("No index {} while removing {}", key, id);
                return;
            }
        };
        if let Err(e) = handle.index.remove(id) {
            warn!("Index {} out of step with store for {}: {}", key, id, e);
        }
        self.maybe_compact(&handle);
    }

    /// Schedule a background rebuild when the handle is tombstone-heavy.
    /// Returns whether a rebuild was started.
    pub fn maybe_compact(&self, handle: &Arc<IndexHandle>) -> bool {
        let settings = &self.config.index;
        if !settings.auto_rebuild {
            return false;
        }
        if handle.index.node_count() < settings.min_nodes_for_rebuild
            || handle.index.tombstone_ratio() <= settings.tombstone_rebuild_ratio
        {
            return false;
        }
        if handle
            .rebuild_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let task = Arc::clone(handle);
        let job = move || {
            if let Err(e) = task.index.rebuild() {
                error!("Background rebuild of {} failed: {}", task.key, e);
            }
            task.rebuild_in_flight.store(false, Ordering::Release);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(job);
            }
            Err(_) => job(),
        }
        true
    }

    /// Rebuild one index now. Returns the new generation.
    pub fn rebuild(&self, modality: Modality, collection: &str) -> RetrievalResult<u64> {
        let handle = self.get_index(modality, collection)?;
        handle.index.rebuild()
    }

    /// Rebuild every index. Returns the number rebuilt.
    pub fn rebuild_all(&self) -> RetrievalResult<usize> {
        let handles = self.handles();
        for handle in &handles {
            handle.index.rebuild()?;
        }
        Ok(handles.len())
    }

    pub fn stats(&self) -> Vec<(IndexKey, IndexStats)> {
        self.handles()
            .into_iter()
            .map(|handle| (handle.key.clone(), handle.index.stats()))
            .collect()
    }

    fn snapshot_dir(&self) -> Option<PathBuf> {
        self.config
            .index
            .data_dir
            .as_ref()
            .map(|dir| dir.join(SNAPSHOT_DIR))
    }

    /// Write a snapshot of every index under `data_dir/indexes`.
    /// No-op without a data directory. Returns the number written.
    pub fn persist_all(&self) -> RetrievalResult<usize> {
        let dir = match self.snapshot_dir() {
            Some(dir) => dir,
            None => return Ok(0),
        };
        std::fs::create_dir_all(&dir)?;

        let handles = self.handles();
        for handle in &handles {
            let path = dir.join(format!("{}.hnsw", handle.key.file_stem()));
            handle.index.save(&path)?;
        }
        info!("💾 Persisted {} indexes to {}", handles.len(), dir.display());
        Ok(handles.len())
    }

    /// Recreate every index from the store, preferring a valid snapshot.
    /// A rejected snapshot is logged and the index rebuilt from records.
    pub async fn restore(&self) -> RetrievalResult<RestoreReport> {
        let mut report = RestoreReport::default();
        let snapshot_dir = self.snapshot_dir();

        for key in self.store.keys().await? {
            let records = self.store.scan(&key).await?;
            report.records += records.len();
            let dimension = self.config.modalities.dimension(key.modality);

            let loaded = match &snapshot_dir {
                Some(dir) => {
                    let live: HashMap<VectorId, Vec<f32>> = records
                        .iter()
                        .map(|r| (r.id.clone(), r.vector.clone()))
                        .collect();
                    let path = dir.join(format!("{}.hnsw", key.file_stem()));
                    match HnswIndex::load(&path, dimension, &live, self.config.hnsw.seed) {
                        Ok(index) => index,
                        Err(e) => {
                            warn!("⚠️  Snapshot for {} rejected ({}); rebuilding", key, e);
                            None
                        }
                    }
                }
                None => None,
            };

            let index = match loaded {
                Some(index) => {
                    report.loaded += 1;
                    index
                }
                None => {
                    report.rebuilt += 1;
                    let entries = records.into_iter().map(|r| (r.id, r.vector)).collect();
                    HnswIndex::build(dimension, self.params(), entries, 0, self.config.hnsw.seed)?
                }
            };

            self.handles
                .write()
                .insert(key.clone(), Arc::new(IndexHandle::new(key, index)));
        }

        info!(
            "🔁 Restored indexes: {} from snapshot, {} rebuilt, {} records",
            report.loaded, report.rebuilt, report.records
        );
        Ok(report)
    }
}
