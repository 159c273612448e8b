// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Tests for the HNSW index: exactness on small graphs, recall on larger
// ones, tombstones, rebuild and snapshot persistence

use fabstir_retrieval_engine::vector::embeddings::{dot, normalize};
use fabstir_retrieval_engine::vector::hnsw::{HnswIndex, HnswParams};
use fabstir_retrieval_engine::vector::VectorId;
use fabstir_retrieval_engine::RetrievalError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(test)]
mod hnsw_index_tests {
    use super::*;

    /// Helper: seeded random unit vectors
    fn random_vectors(count: usize, dimensions: usize, seed: u64) -> Vec<(VectorId, Vec<f32>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|i| {
                let raw: Vec<f32> = (0..dimensions).map(|_| rng.gen_range(-1.0..1.0)).collect();
                (format!("vec-{}", i), normalize(&raw).unwrap())
            })
            .collect()
    }

    /// Helper: exact top-k ids by brute force
    fn brute_force(entries: &[(VectorId, Vec<f32>)], query: &[f32], k: usize) -> Vec<VectorId> {
        let mut scored: Vec<(f32, &VectorId)> =
            entries.iter().map(|(id, v)| (dot(v, query), id)).collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().take(k).map(|(_, id)| id.clone()).collect()
    }

    /// Test 1: Nearest two of three known documents
    #[test]
    fn test_three_documents_closest_to_b() {
        let index = HnswIndex::new(4, HnswParams::new(8, 64), Some(1));
        index.insert("A", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.insert("B", &[0.6, 0.8, 0.0, 0.0]).unwrap();
        index.insert("C", &[0.0, 1.0, 0.0, 0.0]).unwrap();

        // cos(q,B) ~ 0.999, cos(q,C) ~ 0.83, cos(q,A) ~ 0.55
        let results = index.search(&[0.55, 0.83, 0.0, 0.0], 2, 16).unwrap();
        let ids: Vec<&str> = results.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "C"]);
        assert!(results[0].score > results[1].score);
    }

    /// Test 2: Every insert is immediately its own nearest neighbour
    #[test]
    fn test_search_after_insert_finds_self() {
        let index = HnswIndex::new(16, HnswParams::new(8, 100), Some(3));
        let entries = random_vectors(100, 16, 3);

        for (id, vector) in &entries {
            index.insert(id.clone(), vector).unwrap();
            let top = index.search(vector, 1, 100).unwrap();
            assert_eq!(&top[0].id, id, "freshly inserted {} should rank first", id);
        }
    }

    /// Test 3: Small indexes (node count <= ef) return exact results
    #[test]
    fn test_small_index_is_exact() {
        let entries = random_vectors(150, 12, 21);
        let index =
            HnswIndex::build(12, HnswParams::new(6, 200), entries.clone(), 0, Some(21)).unwrap();

        for (_, query) in random_vectors(20, 12, 99) {
            let expected = brute_force(&entries, &query, 10);
            let actual: Vec<VectorId> = index
                .search(&query, 10, 200)
                .unwrap()
                .into_iter()
                .map(|n| n.id)
                .collect();
            assert_eq!(actual, expected);
        }
    }

    /// Test 4: Recall@10 on a larger index
    #[test]
    fn test_recall_at_10() {
        let entries = random_vectors(3000, 32, 7);
        let start = Instant::now();
        let index =
            HnswIndex::build(32, HnswParams::new(16, 200), entries.clone(), 0, Some(7)).unwrap();
        println!("3K vectors build time: {:?}", start.elapsed());

        let queries = random_vectors(50, 32, 1234);
        let mut hits = 0;
        for (_, query) in &queries {
            let expected = brute_force(&entries, query, 10);
            let actual: Vec<VectorId> = index
                .search(query, 10, 128)
                .unwrap()
                .into_iter()
                .map(|n| n.id)
                .collect();
            hits += actual.iter().filter(|id| expected.contains(id)).count();
        }
        let recall = hits as f64 / (queries.len() * 10) as f64;
        println!("Recall@10 (ef=128): {:.3}", recall);
        assert!(recall >= 0.9, "Recall should be >= 0.9 (actual: {:.3})", recall);
    }

    /// Test 5: Removed ids never come back from search
    #[test]
    fn test_removed_ids_excluded() {
        let entries = random_vectors(300, 16, 11);
        let index =
            HnswIndex::build(16, HnswParams::new(8, 100), entries.clone(), 0, Some(11)).unwrap();

        for (id, _) in entries.iter().step_by(3) {
            index.remove(id).unwrap();
        }
        for (id, vector) in entries.iter().step_by(3) {
            let results = index.search(vector, 20, 64).unwrap();
            assert!(
                results.iter().all(|n| &n.id != id),
                "tombstoned {} must not be returned",
                id
            );
        }
        assert_eq!(index.len(), 200);
        assert_eq!(index.stats().tombstoned, 100);
    }

    /// Test 6: Rebuild keeps the live id set searchable
    #[test]
    fn test_rebuild_preserves_membership() {
        let entries = random_vectors(400, 16, 5);
        let index =
            HnswIndex::build(16, HnswParams::new(8, 100), entries.clone(), 0, Some(5)).unwrap();
        for (id, _) in entries.iter().take(100) {
            index.remove(id).unwrap();
        }

        let generation = index.rebuild().unwrap();
        assert_eq!(generation, 1);
        assert_eq!(index.stats().tombstoned, 0);

        let mut found = 0;
        for (id, vector) in entries.iter().skip(100) {
            if index.search(vector, 1, 64).unwrap()[0].id == *id {
                found += 1;
            }
        }
        assert!(found >= 294, "live ids should stay findable after rebuild ({}/300)", found);
    }

    /// Test 7: Dimension mismatch on insert and search
    #[test]
    fn test_dimension_mismatch() {
        let index = HnswIndex::new(8, HnswParams::new(8, 32), None);
        assert!(matches!(
            index.insert("x", &[1.0; 4]),
            Err(RetrievalError::DimensionMismatch { expected: 8, actual: 4 })
        ));
        assert!(matches!(
            index.search(&[1.0; 9], 1, 10),
            Err(RetrievalError::DimensionMismatch { expected: 8, actual: 9 })
        ));
    }

    /// Test 8: Snapshot save and load
    #[test]
    fn test_snapshot_round_trip_preserves_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.hnsw");
        let entries = random_vectors(200, 8, 17);
        let index =
            HnswIndex::build(8, HnswParams::new(8, 64), entries.clone(), 4, Some(17)).unwrap();
        index.remove("vec-0").unwrap();
        index.save(&path).unwrap();

        let live: HashMap<VectorId, Vec<f32>> = entries.into_iter().skip(1).collect();
        let loaded = HnswIndex::load(&path, 8, &live, Some(17)).unwrap().unwrap();
        assert_eq!(loaded.len(), 199);
        assert_eq!(loaded.generation(), 4);

        let query = &live["vec-42"];
        assert_eq!(
            loaded.search(query, 5, 64).unwrap(),
            index.search(query, 5, 64).unwrap()
        );
    }

    /// Test 9: Missing and damaged snapshots
    #[test]
    fn test_snapshot_missing_or_damaged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.hnsw");
        let live = HashMap::new();
        assert!(HnswIndex::load(&path, 8, &live, None).unwrap().is_none());

        std::fs::write(&path, b"FRHNSW\x01\x00garbage").unwrap();
        assert!(matches!(
            HnswIndex::load(&path, 8, &live, None),
            Err(RetrievalError::CorruptIndexState(_))
        ));
    }

    /// Helper: block until a rebuild on `index` is constructing its graph
    fn wait_for_rebuild(index: &HnswIndex, rebuild: &thread::JoinHandle<u64>) {
        let deadline = Instant::now() + Duration::from_secs(30);
        while !index.is_rebuilding() {
            assert!(!rebuild.is_finished(), "rebuild finished before it was observed");
            assert!(Instant::now() < deadline, "rebuild never started");
            thread::yield_now();
        }
    }

    /// Test 10: Exact results when ef < node count <= ef_construction
    #[test]
    fn test_exact_below_construction_beam() {
        let entries = random_vectors(150, 16, 31);
        let index =
            HnswIndex::build(16, HnswParams::new(2, 200), entries.clone(), 0, Some(31)).unwrap();

        for (id, vector) in &entries {
            let top = index.search(vector, 1, 1).unwrap();
            assert_eq!(&top[0].id, id, "{} should be its own nearest neighbour", id);

            let expected = brute_force(&entries, vector, 2);
            let actual: Vec<VectorId> = index
                .search(vector, 2, 64)
                .unwrap()
                .into_iter()
                .map(|n| n.id)
                .collect();
            assert_eq!(actual, expected);
        }
    }

    /// Test 11: Inserts and removals complete while a rebuild is in flight
    #[test]
    fn test_writes_do_not_wait_for_rebuild() {
        let entries = random_vectors(4000, 32, 41);
        let index = Arc::new(
            HnswIndex::build(32, HnswParams::new(12, 100), entries.clone(), 0, Some(41)).unwrap(),
        );
        for (id, _) in entries.iter().take(50) {
            index.remove(id).unwrap();
        }

        let rebuild = {
            let index = Arc::clone(&index);
            thread::spawn(move || index.rebuild().unwrap())
        };
        wait_for_rebuild(&index, &rebuild);

        let fresh = random_vectors(20, 32, 4242);
        for (id, vector) in &fresh {
            index.insert(format!("fresh-{}", id), vector).unwrap();
        }
        for (id, _) in entries.iter().skip(50).take(10) {
            index.remove(id).unwrap();
        }
        assert!(index.is_rebuilding(), "writes should not have waited for the rebuild");
        assert!(index.contains("fresh-vec-0"));

        assert_eq!(rebuild.join().unwrap(), 1);
        assert!(!index.is_rebuilding());
        assert_eq!(index.generation(), 1);
        assert_eq!(index.len(), 4000 - 60 + 20);
        let mut found = 0;
        for (id, vector) in &fresh {
            let id = format!("fresh-{}", id);
            assert!(index.contains(&id), "{} was inserted during the rebuild", id);
            if index.search(vector, 1, 128).unwrap()[0].id == id {
                found += 1;
            }
        }
        assert!(found >= 19, "replayed inserts should be searchable ({}/20)", found);
        for (id, _) in entries.iter().take(60) {
            assert!(!index.contains(id), "{} was removed before the swap", id);
        }
    }

    /// Test 12: Searches keep answering while a rebuild is in flight
    #[test]
    fn test_search_during_rebuild() {
        let entries = random_vectors(4000, 32, 43);
        let index = Arc::new(
            HnswIndex::build(32, HnswParams::new(12, 100), entries.clone(), 0, Some(43)).unwrap(),
        );

        let rebuild = {
            let index = Arc::clone(&index);
            thread::spawn(move || index.rebuild().unwrap())
        };
        wait_for_rebuild(&index, &rebuild);

        let readers: Vec<_> = (0..4)
            .map(|r| {
                let index = Arc::clone(&index);
                let queries: Vec<Vec<f32>> =
                    entries.iter().skip(r * 10).take(10).map(|(_, v)| v.clone()).collect();
                thread::spawn(move || {
                    for query in &queries {
                        let results = index.search(query, 5, 64).unwrap();
                        assert_eq!(results.len(), 5);
                        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
                    }
                })
            })
            .collect();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(rebuild.join().unwrap(), 1);
        assert_eq!(index.len(), 4000);
    }
}
