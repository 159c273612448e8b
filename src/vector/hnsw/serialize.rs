// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Persisted graph snapshots
//!
//! File layout:
//! - Magic: `FRHNSW` + 2-byte format version
//! - SHA-256 of the body (32 bytes)
//! - Body: bincode-encoded [`GraphSnapshot`]
//!
//! Live vectors are not duplicated: they are re-attached from the canonical
//! store on load. Tombstoned nodes keep their vectors in the snapshot since
//! their canonical records are gone but the graph still routes through them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};

use super::graph::{HnswGraph, HnswParams, MAX_LEVEL};
use crate::errors::{RetrievalError, RetrievalResult};
use crate::vector::types::VectorId;

const MAGIC: &[u8; 6] = b"FRHNSW";
const FORMAT_VERSION: u16 = crate::version::SNAPSHOT_FORMAT;

#[derive(Debug, Serialize, Deserialize)]
struct GraphSnapshot {
    dimension: usize,
    m: usize,
    ef_construction: usize,
    generation: u64,
    entry_point: Option<u32>,
    max_level: usize,
    ids: Vec<VectorId>,
    levels: Vec<u8>,
    tombstones: Vec<bool>,
    layers: Vec<Vec<Vec<u32>>>,
    /// Vectors of tombstoned slots only
    retired_vectors: Vec<(u32, Vec<f32>)>,
    /// Digest over the live `(id, vector)` set at save time
    live_fingerprint: String,
}

/// Order-independent digest of a live `(id, vector)` set
pub fn live_fingerprint<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a VectorId, &'a [f32])>,
{
    let mut sorted: Vec<(&VectorId, &[f32])> = entries.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    for (id, vector) in sorted {
        hasher.update((id.len() as u64).to_le_bytes());
        hasher.update(id.as_bytes());
        for x in vector {
            hasher.update(x.to_le_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

impl HnswGraph {
    /// Write the graph structure to `writer`
    pub fn write_snapshot<W: Write>(&self, writer: &mut W) -> RetrievalResult<()> {
        let retired_vectors = self
            .tombstones
            .iter()
            .enumerate()
            .filter(|(_, &dead)| dead)
            .map(|(slot, _)| (slot as u32, self.vector(slot as u32).to_vec()))
            .collect();

        let fingerprint = live_fingerprint(
            self.live
                .iter()
                .map(|(id, &slot)| (id, self.vector(slot))),
        );

        let snapshot = GraphSnapshot {
            dimension: self.dimension,
            m: self.params.m,
            ef_construction: self.params.ef_construction,
            generation: self.generation,
            entry_point: self.entry_point,
            max_level: self.max_level,
            ids: self.ids.clone(),
            levels: self.levels.clone(),
            tombstones: self.tombstones.clone(),
            layers: self.layers.clone(),
            retired_vectors,
            live_fingerprint: fingerprint,
        };

        let body = bincode::serialize(&snapshot)?;
        let digest = Sha256::digest(&body);

        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&digest)?;
        writer.write_all(&body)?;
        writer.flush()?;
        Ok(())
    }

    /// Rebuild the in-memory graph from a snapshot plus canonical live vectors.
    ///
    /// `live_vectors` must hold the normalised vector of every record that
    /// belongs to this index. Any disagreement between snapshot and store is
    /// reported as [`RetrievalError::CorruptIndexState`].
    pub fn read_snapshot<R: Read>(
        reader: &mut R,
        expected_dimension: usize,
        live_vectors: &HashMap<VectorId, Vec<f32>>,
    ) -> RetrievalResult<Self> {
        let corrupt = |msg: String| RetrievalError::CorruptIndexState(msg);

        let mut header = [0u8; 8];
        reader
            .read_exact(&mut header)
            .map_err(|e| corrupt(format!("truncated header: {}", e)))?;
        if &header[..6] != MAGIC {
            return Err(corrupt("invalid snapshot magic".to_string()));
        }
        let version = u16::from_le_bytes([header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported snapshot version {} (expected {})",
                version, FORMAT_VERSION
            )));
        }

        let mut digest = [0u8; 32];
        reader
            .read_exact(&mut digest)
            .map_err(|e| corrupt(format!("truncated digest: {}", e)))?;
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        if Sha256::digest(&body).as_slice() != digest {
            return Err(corrupt("snapshot checksum mismatch".to_string()));
        }

        let snapshot: GraphSnapshot = bincode::deserialize(&body)?;
        Self::from_snapshot(snapshot, expected_dimension, live_vectors)
    }

    fn from_snapshot(
        snapshot: GraphSnapshot,
        expected_dimension: usize,
        live_vectors: &HashMap<VectorId, Vec<f32>>,
    ) -> RetrievalResult<Self> {
        let corrupt = |msg: String| RetrievalError::CorruptIndexState(msg);
        let n = snapshot.ids.len();

        if snapshot.dimension != expected_dimension {
            return Err(corrupt(format!(
                "snapshot dimension {} does not match configured {}",
                snapshot.dimension, expected_dimension
            )));
        }
        if snapshot.levels.len() != n || snapshot.tombstones.len() != n {
            return Err(corrupt("per-node arrays disagree in length".to_string()));
        }
        if snapshot.max_level > MAX_LEVEL || snapshot.layers.len() != snapshot.max_level + 1 {
            return Err(corrupt("layer count disagrees with max level".to_string()));
        }
        if snapshot.entry_point.map_or(n > 0, |ep| ep as usize >= n) {
            return Err(corrupt("entry point out of range".to_string()));
        }
        for adjacency in &snapshot.layers {
            if adjacency.len() > n || adjacency.iter().flatten().any(|&s| s as usize >= n) {
                return Err(corrupt("neighbor index out of range".to_string()));
            }
        }

        let mut retired: HashMap<u32, Vec<f32>> = snapshot.retired_vectors.into_iter().collect();
        let mut vectors = Vec::with_capacity(n * expected_dimension);
        let mut live = HashMap::new();

        for (slot, id) in snapshot.ids.iter().enumerate() {
            let vector = if snapshot.tombstones[slot] {
                retired.remove(&(slot as u32)).ok_or_else(|| {
                    corrupt(format!("missing vector for tombstoned slot {}", slot))
                })?
            } else {
                if live.insert(id.clone(), slot as u32).is_some() {
                    return Err(corrupt(format!("id '{}' is live twice", id)));
                }
                live_vectors
                    .get(id)
                    .cloned()
                    .ok_or_else(|| corrupt(format!("no canonical record for '{}'", id)))?
            };
            if vector.len() != expected_dimension {
                return Err(corrupt(format!("vector for slot {} has wrong length", slot)));
            }
            vectors.extend_from_slice(&vector);
        }

        if live.len() != live_vectors.len() {
            return Err(corrupt(format!(
                "snapshot has {} live nodes, store has {} records",
                live.len(),
                live_vectors.len()
            )));
        }

        let fingerprint = live_fingerprint(live_vectors.iter().map(|(id, v)| (id, v.as_slice())));
        if fingerprint != snapshot.live_fingerprint {
            return Err(corrupt("live vectors changed since snapshot".to_string()));
        }

        Ok(HnswGraph {
            params: HnswParams::new(snapshot.m, snapshot.ef_construction),
            dimension: snapshot.dimension,
            ids: snapshot.ids,
            vectors,
            levels: snapshot.levels,
            layers: snapshot.layers,
            tombstones: snapshot.tombstones,
            live,
            entry_point: snapshot.entry_point,
            max_level: snapshot.max_level,
            generation: snapshot.generation,
        })
    }
}
