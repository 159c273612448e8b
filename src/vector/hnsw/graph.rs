// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Single-writer HNSW graph
//!
//! Nodes live in an arena addressed by dense `u32` slots. Adjacency is
//! stored layer-major: `layers[l][slot]` is the neighbor list of `slot`
//! on layer `l` (empty when the node does not reach that layer).
//!
//! Insertion is split into [`HnswGraph::plan_insert`] (read-only, does all
//! distance work) and [`HnswGraph::apply`] (cheap assignment). The
//! concurrent wrapper runs the plan under a read lock and applies it under
//! a short write lock, so readers never see a half-linked node.

use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::config::HnswConfig;
use crate::errors::{RetrievalError, RetrievalResult};
use crate::vector::embeddings::dot;
use crate::vector::types::VectorId;

/// Hard cap on node level; geometric draws beyond this are clamped
pub const MAX_LEVEL: usize = 16;

/// Construction parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HnswParams {
    /// Max neighbors per node on layers >= 1
    pub m: usize,
    /// Max neighbors per node on layer 0
    pub m0: usize,
    /// Candidate list size during construction
    pub ef_construction: usize,
    /// Level multiplier, `1 / ln(M)`
    pub ml: f64,
}

impl HnswParams {
    pub fn new(m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            m0: m * 2,
            ef_construction: ef_construction.max(1),
            ml: 1.0 / (m as f64).ln(),
        }
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }
}

impl From<&HnswConfig> for HnswParams {
    fn from(config: &HnswConfig) -> Self {
        HnswParams::new(config.m, config.ef_construction)
    }
}

/// A search hit: external id plus cosine similarity
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: VectorId,
    pub score: f32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Scored {
    pub slot: u32,
    pub distance: f32,
}

/// Min-heap ordering: nearest pops first
struct Nearer(Scored);

impl PartialEq for Nearer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Nearer {}

impl Ord for Nearer {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .distance
            .total_cmp(&self.0.distance)
            .then_with(|| other.0.slot.cmp(&self.0.slot))
    }
}

impl PartialOrd for Nearer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap ordering: farthest pops first
struct Farther(Scored);

impl PartialEq for Farther {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Farther {}

impl Ord for Farther {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .distance
            .total_cmp(&other.0.distance)
            .then_with(|| self.0.slot.cmp(&other.0.slot))
    }
}

impl PartialOrd for Farther {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Everything needed to publish one node, computed without mutating the graph
#[derive(Debug)]
pub struct InsertPlan {
    id: VectorId,
    vector: Vec<f32>,
    slot: u32,
    level: usize,
    /// Outgoing links of the new node, indexed by layer
    links: Vec<Vec<u32>>,
    /// Replacement neighbor lists for existing nodes: (layer, slot, list)
    rewired: Vec<(usize, u32, Vec<u32>)>,
}

/// Arena-backed multi-layer proximity graph over normalised vectors
#[derive(Debug, Clone)]
pub struct HnswGraph {
    pub(crate) params: HnswParams,
    pub(crate) dimension: usize,
    pub(crate) ids: Vec<VectorId>,
    /// Flat vector storage, `dimension` floats per slot
    pub(crate) vectors: Vec<f32>,
    pub(crate) levels: Vec<u8>,
    pub(crate) layers: Vec<Vec<Vec<u32>>>,
    pub(crate) tombstones: Vec<bool>,
    pub(crate) live: HashMap<VectorId, u32>,
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_level: usize,
    pub(crate) generation: u64,
}

impl HnswGraph {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        Self {
            params,
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
            levels: Vec::new(),
            layers: vec![Vec::new()],
            tombstones: Vec::new(),
            live: HashMap::new(),
            entry_point: None,
            max_level: 0,
            generation: 0,
        }
    }

    /// Build a fresh graph from `(id, normalised vector)` pairs
    pub fn build<R: Rng>(
        dimension: usize,
        params: HnswParams,
        entries: Vec<(VectorId, Vec<f32>)>,
        generation: u64,
        rng: &mut R,
    ) -> Self {
        let mut graph = Self::new(dimension, params);
        graph.generation = generation;
        for (id, vector) in entries {
            let level = graph.random_level(rng);
            let plan = graph.plan_insert(id, vector, level);
            graph.apply(plan);
        }
        graph
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of live (non-tombstoned) nodes
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of physical nodes, tombstoned included
    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.node_count() - self.live.len()
    }

    pub fn tombstone_ratio(&self) -> f64 {
        if self.ids.is_empty() {
            0.0
        } else {
            self.tombstone_count() as f64 / self.node_count() as f64
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.live.contains_key(id)
    }

    pub fn live_ids(&self) -> impl Iterator<Item = &VectorId> {
        self.live.keys()
    }

    #[inline]
    pub(crate) fn vector(&self, slot: u32) -> &[f32] {
        let start = slot as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    pub(crate) fn neighbors(&self, layer: usize, slot: u32) -> &[u32] {
        self.layers
            .get(layer)
            .and_then(|l| l.get(slot as usize))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Vector of `slot`, or the not-yet-published vector when `slot` is pending
    #[inline]
    fn vector_or_pending<'a>(&'a self, slot: u32, pending: Option<(u32, &'a [f32])>) -> &'a [f32] {
        match pending {
            Some((pending_slot, v)) if pending_slot == slot => v,
            _ => self.vector(slot),
        }
    }

    #[inline]
    fn distance(&self, query: &[f32], slot: u32) -> f32 {
        1.0 - dot(query, self.vector(slot))
    }

    /// Geometric level draw with parameter `1/ln(M)`
    pub fn random_level<R: Rng>(&self, rng: &mut R) -> usize {
        let r: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        ((-r.ln() * self.params.ml).floor() as usize).min(MAX_LEVEL)
    }

    /// Greedy single-best-neighbor descent on one layer
    fn greedy_closest(&self, query: &[f32], entry: u32, layer: usize) -> u32 {
        let mut current = entry;
        let mut current_distance = self.distance(query, current);
        loop {
            let mut improved = false;
            for &neighbor in self.neighbors(layer, current) {
                let d = self.distance(query, neighbor);
                if d < current_distance {
                    current = neighbor;
                    current_distance = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first search bounded by `ef`, returned nearest first.
    ///
    /// With `live_only`, tombstoned nodes are still traversed but never
    /// admitted to the result set.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        live_only: bool,
    ) -> Vec<Scored> {
        let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 4);
        let mut candidates: BinaryHeap<Nearer> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Farther> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.insert(ep) {
                let scored = Scored {
                    slot: ep,
                    distance: self.distance(query, ep),
                };
                candidates.push(Nearer(scored));
                if !live_only || !self.tombstones[ep as usize] {
                    results.push(Farther(scored));
                }
            }
        }

        while let Some(Nearer(current)) = candidates.pop() {
            let bound = results
                .peek()
                .map(|f| f.0.distance)
                .unwrap_or(f32::INFINITY);
            if current.distance > bound && results.len() >= ef {
                break;
            }

            for &neighbor in self.neighbors(layer, current.slot) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.distance(query, neighbor);
                let bound = results
                    .peek()
                    .map(|f| f.0.distance)
                    .unwrap_or(f32::INFINITY);
                if results.len() < ef || d < bound {
                    let scored = Scored {
                        slot: neighbor,
                        distance: d,
                    };
                    candidates.push(Nearer(scored));
                    if !live_only || !self.tombstones[neighbor as usize] {
                        results.push(Farther(scored));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|f| f.0).collect();
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.slot.cmp(&b.slot)));
        out
    }

    /// Diversity heuristic: keep a candidate only if no already-kept
    /// neighbor is closer to it than it is to the base point. Remaining
    /// slots are back-filled with the nearest pruned candidates.
    fn select_neighbors<'a>(
        &'a self,
        candidates: &[Scored],
        m: usize,
        pending: Option<(u32, &'a [f32])>,
    ) -> Vec<u32> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.slot.cmp(&b.slot)));

        let mut kept: Vec<u32> = Vec::with_capacity(m);
        let mut pruned: Vec<u32> = Vec::new();

        for candidate in &sorted {
            if kept.len() >= m {
                break;
            }
            let candidate_vec = self.vector_or_pending(candidate.slot, pending);
            let dominated = kept.iter().any(|&k| {
                let d = 1.0 - dot(candidate_vec, self.vector_or_pending(k, pending));
                d < candidate.distance
            });
            if dominated {
                pruned.push(candidate.slot);
            } else {
                kept.push(candidate.slot);
            }
        }

        for slot in pruned {
            if kept.len() >= m {
                break;
            }
            kept.push(slot);
        }

        kept
    }

    /// Compute the links for a new node at `level` without mutating the graph
    pub fn plan_insert(&self, id: VectorId, vector: Vec<f32>, level: usize) -> InsertPlan {
        let slot = self.ids.len() as u32;
        let mut links = vec![Vec::new(); level + 1];
        let mut rewired = Vec::new();

        let Some(entry) = self.entry_point else {
            return InsertPlan {
                id,
                vector,
                slot,
                level,
                links,
                rewired,
            };
        };

        let mut current = entry;
        for layer in (level + 1..=self.max_level).rev() {
            current = self.greedy_closest(&vector, current, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let max_links = self.params.max_links(layer);
            let found = self.search_layer(
                &vector,
                &[current],
                self.params.ef_construction,
                layer,
                false,
            );
            let selected = self.select_neighbors(&found, max_links, None);

            for &neighbor in &selected {
                let existing = self.neighbors(layer, neighbor);
                let mut updated: Vec<u32> = existing.to_vec();
                updated.push(slot);
                if updated.len() > max_links {
                    let base = self.vector(neighbor);
                    let scored: Vec<Scored> = updated
                        .iter()
                        .map(|&s| {
                            let v = if s == slot { vector.as_slice() } else { self.vector(s) };
                            Scored {
                                slot: s,
                                distance: 1.0 - dot(base, v),
                            }
                        })
                        .collect();
                    updated = self.select_neighbors(&scored, max_links, Some((slot, vector.as_slice())));
                }
                rewired.push((layer, neighbor, updated));
            }

            links[layer] = selected;
            if let Some(nearest) = found.first() {
                current = nearest.slot;
            }
        }

        InsertPlan {
            id,
            vector,
            slot,
            level,
            links,
            rewired,
        }
    }

    /// Publish a planned node. Plans must be applied in the order they were
    /// computed against an unchanged graph.
    pub fn apply(&mut self, plan: InsertPlan) {
        debug_assert_eq!(plan.slot as usize, self.ids.len());

        if let Some(old) = self.live.remove(&plan.id) {
            self.tombstones[old as usize] = true;
        }

        let slot = plan.slot;
        self.ids.push(plan.id.clone());
        self.vectors.extend_from_slice(&plan.vector);
        self.levels.push(plan.level as u8);
        self.tombstones.push(false);

        while self.layers.len() <= plan.level {
            self.layers.push(Vec::new());
        }
        for (layer, links) in plan.links.into_iter().enumerate() {
            let adjacency = &mut self.layers[layer];
            if adjacency.len() <= slot as usize {
                adjacency.resize(slot as usize + 1, Vec::new());
            }
            adjacency[slot as usize] = links;
        }
        for (layer, neighbor, list) in plan.rewired {
            self.layers[layer][neighbor as usize] = list;
        }

        self.live.insert(plan.id, slot);

        if self.entry_point.is_none() || plan.level > self.max_level {
            self.entry_point = Some(slot);
            self.max_level = plan.level;
        }
    }

    /// Tombstone a live node; its edges stay until the next rebuild
    pub fn remove(&mut self, id: &str) -> RetrievalResult<()> {
        match self.live.remove(id) {
            Some(slot) => {
                self.tombstones[slot as usize] = true;
                Ok(())
            }
            None => Err(RetrievalError::NotFound(id.to_string())),
        }
    }

    /// k nearest live nodes to a normalised query, most similar first
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<Neighbor> {
        if self.live.is_empty() || k == 0 {
            return Vec::new();
        }
        let ef = ef.max(k);

        // Graphs no larger than the construction beam are scanned exactly
        if self.node_count() <= ef.max(self.params.ef_construction) {
            return self.exact_search(query, k);
        }

        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        let mut current = entry;
        for layer in (1..=self.max_level).rev() {
            current = self.greedy_closest(query, current, layer);
        }

        self.search_layer(query, &[current], ef, 0, true)
            .into_iter()
            .take(k)
            .map(|s| Neighbor {
                id: self.ids[s.slot as usize].clone(),
                score: 1.0 - s.distance,
            })
            .collect()
    }

    /// Brute-force scan over live nodes
    pub fn exact_search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut scored: Vec<Scored> = self
            .live
            .values()
            .map(|&slot| Scored {
                slot,
                distance: self.distance(query, slot),
            })
            .collect();
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.slot.cmp(&b.slot)));
        scored
            .into_iter()
            .take(k)
            .map(|s| Neighbor {
                id: self.ids[s.slot as usize].clone(),
                score: 1.0 - s.distance,
            })
            .collect()
    }

    /// Live `(id, vector)` pairs in insertion order, used by rebuild
    pub fn live_entries(&self) -> Vec<(VectorId, Vec<f32>)> {
        let mut slots: Vec<u32> = self.live.values().copied().collect();
        slots.sort_unstable();
        slots
            .into_iter()
            .map(|slot| (self.ids[slot as usize].clone(), self.vector(slot).to_vec()))
            .collect()
    }

    /// Number of nodes per layer and total directed edges
    pub fn layer_stats(&self) -> (Vec<usize>, usize) {
        let mut per_layer = vec![0usize; self.max_level + 1];
        for &level in &self.levels {
            for count in per_layer.iter_mut().take(level as usize + 1) {
                *count += 1;
            }
        }
        let edges = self
            .layers
            .iter()
            .flat_map(|l| l.iter())
            .map(|n| n.len())
            .sum();
        (per_layer, edges)
    }
}
