// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Tests for hybrid retrieval: fan-out, filtering, degradation and fatal store errors

use async_trait::async_trait;
use fabstir_retrieval_engine::config::EngineConfig;
use fabstir_retrieval_engine::rag::{HybridQuery, MetadataFilter};
use fabstir_retrieval_engine::vector::{
    EmbeddingRecord, IndexKey, MemoryVectorStore, Metadata, MetadataValue, Modality, VectorStore,
};
use fabstir_retrieval_engine::{RetrievalEngine, RetrievalError, RetrievalResult};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod retriever_tests {
    use super::*;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.modalities.image_visual = 4;
        config.modalities.image_text = 4;
        config.modalities.document_text = 4;
        config.hnsw.m = 8;
        config.hnsw.ef_construction = 64;
        config.hnsw.seed = Some(7);
        config
    }

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), MetadataValue::from(*v)))
            .collect()
    }

    /// Store whose reads for one modality stall
    struct SlowStore {
        inner: MemoryVectorStore,
        slow: Modality,
        delay: Duration,
    }

    #[async_trait]
    impl VectorStore for SlowStore {
        async fn put(&self, record: EmbeddingRecord) -> RetrievalResult<Option<EmbeddingRecord>> {
            self.inner.put(record).await
        }

        async fn delete(
            &self,
            id: &str,
            modality: Option<Modality>,
        ) -> RetrievalResult<Vec<EmbeddingRecord>> {
            self.inner.delete(id, modality).await
        }

        async fn get(
            &self,
            id: &str,
            modality: Modality,
        ) -> RetrievalResult<Option<EmbeddingRecord>> {
            if modality == self.slow {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.get(id, modality).await
        }

        async fn scan(&self, key: &IndexKey) -> RetrievalResult<Vec<EmbeddingRecord>> {
            self.inner.scan(key).await
        }

        async fn keys(&self) -> RetrievalResult<Vec<IndexKey>> {
            self.inner.keys().await
        }

        async fn len(&self) -> RetrievalResult<usize> {
            self.inner.len().await
        }
    }

    /// Test 1: One image embedded twice fuses into a single result
    #[tokio::test]
    async fn test_image_with_two_modalities_fuses_once() {
        let engine = RetrievalEngine::open(test_config()).await.unwrap();
        engine
            .submit_embedding(
                "img-1",
                Modality::ImageVisual,
                "photos",
                vec![1.0, 0.0, 0.0, 0.0],
                meta(&[("caption", "a red bicycle")]),
            )
            .await
            .unwrap();
        engine
            .submit_embedding(
                "img-1",
                Modality::ImageText,
                "photos",
                vec![0.0, 1.0, 0.0, 0.0],
                meta(&[("ocr_text", "SALE")]),
            )
            .await
            .unwrap();
        engine
            .submit_embedding(
                "img-2",
                Modality::ImageVisual,
                "photos",
                vec![0.0, 0.0, 1.0, 0.0],
                Metadata::new(),
            )
            .await
            .unwrap();

        let query = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0])
            .for_modality(Modality::ImageText, vec![0.0, 1.0, 0.0, 0.0])
            .with_k(5);
        let results = engine.retrieve(&query).await.unwrap();

        assert_eq!(results.len(), 2);
        let top = &results[0];
        assert_eq!(top.id, "img-1");
        assert_eq!(top.contributing_scores.len(), 2);
        assert!((top.fused_score - 2.0 / 61.0).abs() < 1e-6);
        assert!(top.metadata.contains_key("caption"));
        assert!(top.metadata.contains_key("ocr_text"));
        assert_eq!(results[1].id, "img-2");
    }

    /// Test 2: Nothing in scope is an empty result, not an error
    #[tokio::test]
    async fn test_empty_and_unknown_scope() {
        let engine = RetrievalEngine::open(test_config()).await.unwrap();
        let query = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0]);
        assert!(engine.retrieve(&query).await.unwrap().is_empty());

        engine
            .submit_embedding("d", Modality::DocumentText, "docs", vec![1.0, 0.0, 0.0, 0.0], Metadata::new())
            .await
            .unwrap();
        let scoped = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0]).in_collection("nope");
        assert!(engine.retrieve(&scoped).await.unwrap().is_empty());

        let zero_k = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0]).with_k(0);
        assert!(engine.retrieve(&zero_k).await.unwrap().is_empty());
    }

    /// Test 3: Queries without any vector are rejected
    #[tokio::test]
    async fn test_query_without_vector() {
        let engine = RetrievalEngine::open(test_config()).await.unwrap();
        let result = engine.retrieve(&HybridQuery::default()).await;
        assert!(matches!(result, Err(RetrievalError::InvalidVector(_))));
    }

    /// Test 4: Metadata filter applies to every index
    #[tokio::test]
    async fn test_filter_restricts_results() {
        let engine = RetrievalEngine::open(test_config()).await.unwrap();
        for i in 0..10 {
            let owner = if i % 2 == 0 { "alice" } else { "bob" };
            engine
                .submit_embedding(
                    format!("doc-{}", i),
                    Modality::DocumentText,
                    "docs",
                    vec![1.0, i as f32 * 0.1, 0.0, 0.0],
                    meta(&[("owner", owner)]),
                )
                .await
                .unwrap();
        }

        let query = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0])
            .with_filter(MetadataFilter::new().equals("owner", "alice"))
            .with_k(10);
        let results = engine.retrieve(&query).await.unwrap();
        assert_eq!(results.len(), 5);
        assert!(results
            .iter()
            .all(|r| r.metadata.get("owner") == Some(&MetadataValue::from("alice"))));
    }

    /// Test 5: Deleted ids disappear from retrieval immediately
    #[tokio::test]
    async fn test_delete_excludes_id() {
        let engine = RetrievalEngine::open(test_config()).await.unwrap();
        for i in 0..5 {
            engine
                .submit_embedding(
                    format!("doc-{}", i),
                    Modality::DocumentText,
                    "docs",
                    vec![1.0, i as f32 * 0.2, 0.0, 0.0],
                    Metadata::new(),
                )
                .await
                .unwrap();
        }
        let query = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0]).with_k(5);
        assert_eq!(engine.retrieve(&query).await.unwrap()[0].id, "doc-0");

        assert_eq!(engine.delete("doc-0").await.unwrap(), 1);
        let results = engine.retrieve(&query).await.unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.id != "doc-0"));

        assert!(matches!(
            engine.delete("doc-0").await,
            Err(RetrievalError::NotFound(_))
        ));
    }

    /// Test 6: A stalled sub-search degrades to the others' results
    #[tokio::test]
    async fn test_timeout_degrades_to_partial_result() {
        let mut config = test_config();
        config.retrieval.sub_search_timeout_ms = 50;
        let store = Arc::new(SlowStore {
            inner: MemoryVectorStore::new(),
            slow: Modality::ImageText,
            delay: Duration::from_millis(500),
        });
        let engine = RetrievalEngine::with_store(config, store).await.unwrap();

        engine
            .submit_embedding("img-1", Modality::ImageVisual, "photos", vec![1.0, 0.0, 0.0, 0.0], Metadata::new())
            .await
            .unwrap();
        engine
            .submit_embedding("img-1", Modality::ImageText, "photos", vec![0.0, 1.0, 0.0, 0.0], Metadata::new())
            .await
            .unwrap();

        let query = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0])
            .for_modality(Modality::ImageText, vec![0.0, 1.0, 0.0, 0.0]);
        let results = engine.retrieve(&query).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "img-1");
        assert_eq!(results[0].modality, Modality::ImageVisual);
        assert_eq!(results[0].contributing_scores.len(), 1);
    }

    /// Test 7: Store outage fails the whole query
    #[tokio::test]
    async fn test_store_unavailable_is_fatal() {
        let store = Arc::new(MemoryVectorStore::new());
        let engine = RetrievalEngine::with_store(test_config(), store.clone())
            .await
            .unwrap();
        engine
            .submit_embedding("d", Modality::DocumentText, "docs", vec![1.0, 0.0, 0.0, 0.0], Metadata::new())
            .await
            .unwrap();

        store.set_unavailable(true);
        let result = engine
            .retrieve(&HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0]))
            .await;
        assert!(matches!(result, Err(RetrievalError::StoreUnavailable(_))));
    }

    /// Test 8: Default vector skips indexes of another dimension
    #[tokio::test]
    async fn test_dimension_routing() {
        let mut config = test_config();
        config.modalities.document_text = 6;
        let engine = RetrievalEngine::open(config).await.unwrap();
        engine
            .submit_embedding("img", Modality::ImageVisual, "c", vec![1.0, 0.0, 0.0, 0.0], Metadata::new())
            .await
            .unwrap();
        engine
            .submit_embedding("doc", Modality::DocumentText, "c", vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0], Metadata::new())
            .await
            .unwrap();

        let results = engine
            .retrieve(&HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["img"]);

        let wrong = HybridQuery::default().for_modality(Modality::DocumentText, vec![1.0; 5]);
        assert!(matches!(
            engine.retrieve(&wrong).await,
            Err(RetrievalError::DimensionMismatch { expected: 6, actual: 5 })
        ));
    }

    /// Test 9: Under-filled filtered searches retry with a wider net
    #[tokio::test]
    async fn test_underfill_retry() {
        async fn seeded(retry: Option<usize>) -> RetrievalEngine {
            let mut config = test_config();
            config.retrieval.oversample_factor = 1;
            config.retrieval.underfill_retry_factor = retry;
            let engine = RetrievalEngine::open(config).await.unwrap();
            for i in 0..25 {
                engine
                    .submit_embedding(
                        format!("common-{}", i),
                        Modality::DocumentText,
                        "docs",
                        vec![1.0, i as f32 * 0.01, 0.0, 0.0],
                        meta(&[("group", "common")]),
                    )
                    .await
                    .unwrap();
            }
            for i in 0..5 {
                engine
                    .submit_embedding(
                        format!("rare-{}", i),
                        Modality::DocumentText,
                        "docs",
                        vec![0.0, 0.0, 1.0, i as f32 * 0.1],
                        meta(&[("group", "rare")]),
                    )
                    .await
                    .unwrap();
            }
            engine
        }

        let query = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0])
            .with_filter(MetadataFilter::new().equals("group", "rare"))
            .with_k(5);

        let without = seeded(None).await;
        assert!(without.retrieve(&query).await.unwrap().is_empty());

        let with = seeded(Some(10)).await;
        let results = with.retrieve(&query).await.unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.id.starts_with("rare-")));
    }

    /// Test 10: Repeated queries give identical rankings
    #[tokio::test]
    async fn test_retrieval_is_deterministic() {
        let engine = RetrievalEngine::open(test_config()).await.unwrap();
        for i in 0..30 {
            let modality = Modality::ALL[i % 3];
            engine
                .submit_embedding(
                    format!("item-{}", i % 12),
                    modality,
                    "mixed",
                    vec![(i % 5) as f32, (i % 7) as f32, 1.0, (i % 3) as f32],
                    Metadata::new(),
                )
                .await
                .unwrap();
        }

        let query = HybridQuery::new(vec![1.0, 1.0, 1.0, 0.0]).with_k(8);
        let first = engine.retrieve(&query).await.unwrap();
        assert!(!first.is_empty());
        for _ in 0..10 {
            assert_eq!(engine.retrieve(&query).await.unwrap(), first);
        }
    }

    /// Test 11: Oversized k is served without overflowing the candidate count
    #[tokio::test]
    async fn test_huge_k_does_not_overflow() {
        let mut config = test_config();
        config.retrieval.oversample_factor = 3;
        config.retrieval.underfill_retry_factor = Some(10);
        let engine = RetrievalEngine::open(config).await.unwrap();
        for i in 0..6 {
            let group = if i % 2 == 0 { "even" } else { "odd" };
            engine
                .submit_embedding(
                    format!("doc-{}", i),
                    Modality::DocumentText,
                    "docs",
                    vec![1.0, i as f32 * 0.1, 0.0, 0.0],
                    meta(&[("group", group)]),
                )
                .await
                .unwrap();
        }

        let all = engine
            .retrieve(&HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0]).with_k(usize::MAX))
            .await
            .unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].id, "doc-0");

        // Filtered down below k, so the wider retry runs too
        let odd = engine
            .retrieve(
                &HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0])
                    .with_filter(MetadataFilter::new().equals("group", "odd"))
                    .with_k(usize::MAX),
            )
            .await
            .unwrap();
        assert_eq!(odd.len(), 3);
        assert!(odd.iter().all(|r| r.id.starts_with("doc-")));
    }
}
