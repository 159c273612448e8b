// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Concurrent HNSW index
//!
//! - Searches take a snapshot of the active graph pointer and a shared
//!   read lock; they never block each other.
//! - Inserts are planned under the read lock and published under a short
//!   write lock, so a reader sees either no trace of a node or all of it.
//! - Rebuild snapshots the live nodes and constructs a new graph off to the
//!   side without holding the writer mutex. Writes that land meanwhile go to
//!   the old graph and are queued; the queue is replayed onto the new graph
//!   right before the active pointer is swapped.
//! - Only the snapshot, the replay and the swap are serialised with writers.

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::graph::{HnswGraph, HnswParams, Neighbor};
use crate::errors::{RetrievalError, RetrievalResult};
use crate::vector::embeddings;
use crate::vector::types::VectorId;

/// Point-in-time counters for one index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub live: usize,
    pub tombstoned: usize,
    pub generation: u64,
    pub max_level: usize,
    pub nodes_per_layer: Vec<usize>,
    pub edges: usize,
}

/// A write that landed while a rebuild was constructing its graph
#[derive(Debug, Clone)]
enum PendingOp {
    Insert(VectorId, Vec<f32>),
    Remove(VectorId),
}

struct WriterState {
    rng: StdRng,
    /// `Some` while a rebuild is in flight
    pending: Option<Vec<PendingOp>>,
}

/// Live nodes captured at the start of a rebuild
struct RebuildSnapshot {
    entries: Vec<(VectorId, Vec<f32>)>,
    generation: u64,
    dropped: usize,
    seed: u64,
}

/// HNSW index safe for concurrent search, insert and rebuild
pub struct HnswIndex {
    dimension: usize,
    params: HnswParams,
    active: ArcSwap<RwLock<HnswGraph>>,
    /// Serialises inserts and removals; owns the level RNG
    writer: Mutex<WriterState>,
    /// Serialises rebuilds with each other only
    rebuilding: Mutex<()>,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("params", &self.params)
            .field("live", &self.len())
            .finish()
    }
}

impl HnswIndex {
    pub fn new(dimension: usize, params: HnswParams, seed: Option<u64>) -> Self {
        Self::from_graph(HnswGraph::new(dimension, params), seed)
    }

    fn from_graph(graph: HnswGraph, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            dimension: graph.dimension(),
            params: graph.params(),
            active: ArcSwap::from_pointee(RwLock::new(graph)),
            writer: Mutex::new(WriterState { rng, pending: None }),
            rebuilding: Mutex::new(()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Live node count
    pub fn len(&self) -> usize {
        self.active.load().read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live plus tombstoned nodes
    pub fn node_count(&self) -> usize {
        self.active.load().read().node_count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.active.load().read().contains(id)
    }

    pub fn generation(&self) -> u64 {
        self.active.load().read().generation()
    }

    pub fn tombstone_ratio(&self) -> f64 {
        self.active.load().read().tombstone_ratio()
    }

    /// True while a rebuild is constructing its replacement graph
    pub fn is_rebuilding(&self) -> bool {
        self.writer.lock().pending.is_some()
    }

    /// Full counters including per-layer edge totals; walks every node
    pub fn stats(&self) -> IndexStats {
        let active = self.active.load_full();
        let graph = active.read();
        let (nodes_per_layer, edges) = graph.layer_stats();
        IndexStats {
            live: graph.len(),
            tombstoned: graph.tombstone_count(),
            generation: graph.generation(),
            max_level: graph.max_level,
            nodes_per_layer,
            edges,
        }
    }

    /// Add a node. Re-inserting a live id replaces its vector.
    pub fn insert(&self, id: impl Into<VectorId>, vector: &[f32]) -> RetrievalResult<()> {
        let vector = embeddings::ensure_unit(vector, self.dimension)?;
        let id = id.into();

        let mut writer = self.writer.lock();
        if let Some(pending) = writer.pending.as_mut() {
            pending.push(PendingOp::Insert(id.clone(), vector.clone()));
        }

        let active = self.active.load_full();
        let plan = {
            let graph = active.read();
            let level = graph.random_level(&mut writer.rng);
            graph.plan_insert(id, vector, level)
        };
        active.write().apply(plan);
        Ok(())
    }

    /// k most similar live nodes. Empty index yields an empty list.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> RetrievalResult<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let active = self.active.load_full();
        let graph = active.read();
        if graph.is_empty() {
            return Ok(Vec::new());
        }
        let query = embeddings::ensure_unit(query, self.dimension)?;
        Ok(graph.search(&query, k, ef))
    }

    /// Tombstone a node; fails with `NotFound` for unknown or already removed ids
    pub fn remove(&self, id: &str) -> RetrievalResult<()> {
        let mut writer = self.writer.lock();
        let active = self.active.load_full();
        active.write().remove(id)?;
        if let Some(pending) = writer.pending.as_mut() {
            pending.push(PendingOp::Remove(id.to_string()));
        }
        Ok(())
    }

    /// Rebuild from live nodes only and swap it in. Returns the new generation.
    ///
    /// Inserts, removals and searches proceed while the new graph is built.
    pub fn rebuild(&self) -> RetrievalResult<u64> {
        let _rebuilding = self.rebuilding.lock();
        let snapshot = self.begin_rebuild();
        let (generation, live, dropped) =
            (snapshot.generation, snapshot.entries.len(), snapshot.dropped);

        let mut rng = StdRng::seed_from_u64(snapshot.seed);
        let rebuilt = HnswGraph::build(
            self.dimension,
            self.params,
            snapshot.entries,
            generation,
            &mut rng,
        );
        let replayed = self.finish_rebuild(rebuilt);

        info!(
            "♻️  Rebuilt HNSW index: generation {} ({} live, {} tombstones dropped, {} writes replayed)",
            generation, live, dropped, replayed
        );
        Ok(generation)
    }

    /// Capture live nodes and start queueing writes
    fn begin_rebuild(&self) -> RebuildSnapshot {
        let mut writer = self.writer.lock();
        let active = self.active.load_full();
        let graph = active.read();
        writer.pending = Some(Vec::new());
        RebuildSnapshot {
            entries: graph.live_entries(),
            generation: graph.generation() + 1,
            dropped: graph.tombstone_count(),
            seed: writer.rng.gen(),
        }
    }

    /// Replay queued writes onto `rebuilt` and publish it. Returns the replay count.
    fn finish_rebuild(&self, mut rebuilt: HnswGraph) -> usize {
        let mut writer = self.writer.lock();
        let pending = writer.pending.take().unwrap_or_default();
        let replayed = pending.len();

        for op in pending {
            match op {
                PendingOp::Insert(id, vector) => {
                    let level = rebuilt.random_level(&mut writer.rng);
                    let plan = rebuilt.plan_insert(id, vector, level);
                    rebuilt.apply(plan);
                }
                PendingOp::Remove(id) => {
                    // Already absent from the snapshot
                    let _ = rebuilt.remove(&id);
                }
            }
        }

        self.active.store(Arc::new(RwLock::new(rebuilt)));
        replayed
    }

    /// Build an index in one pass from `(id, vector)` pairs
    pub fn build(
        dimension: usize,
        params: HnswParams,
        entries: Vec<(VectorId, Vec<f32>)>,
        generation: u64,
        seed: Option<u64>,
    ) -> RetrievalResult<Self> {
        let mut prepared = Vec::with_capacity(entries.len());
        for (id, vector) in entries {
            prepared.push((id, embeddings::ensure_unit(&vector, dimension)?));
        }
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let graph = HnswGraph::build(dimension, params, prepared, generation, &mut rng);
        Ok(Self::from_graph(graph, seed))
    }
    /// Persist the current graph to `path` (written to a temp file, then renamed)
    pub fn save(&self, path: &Path) -> RetrievalResult<()> {
        let active = self.active.load_full();
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            active.read().write_snapshot(&mut writer)?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        debug!("Saved HNSW snapshot to {}", path.display());
        Ok(())
    }

    /// Load a snapshot. `Ok(None)` when no snapshot exists at `path`.
    pub fn load(
        path: &Path,
        dimension: usize,
        live_vectors: &HashMap<VectorId, Vec<f32>>,
        seed: Option<u64>,
    ) -> RetrievalResult<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let graph = HnswGraph::read_snapshot(&mut reader, dimension, live_vectors)?;
        Ok(Some(Self::from_graph(graph, seed)))
    }
}
