// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Tests for rank fusion through the public API

use chrono::Utc;
use fabstir_retrieval_engine::config::ModalityWeights;
use fabstir_retrieval_engine::rag::{
    Candidate, FusionStrategy, RankedList, WeightedReciprocalRank, WeightedScoreSum, RRF_C,
};
use fabstir_retrieval_engine::vector::{IndexKey, Metadata, MetadataValue, Modality};

#[cfg(test)]
mod fusion_tests {
    use super::*;

    fn candidate(id: &str, modality: Modality, score: f32, caption: Option<&str>) -> Candidate {
        let mut metadata = Metadata::new();
        if let Some(caption) = caption {
            metadata.insert("caption".to_string(), MetadataValue::from(caption));
        }
        Candidate {
            id: id.to_string(),
            modality,
            collection: "gallery".to_string(),
            score,
            metadata,
            created_at: Utc::now(),
        }
    }

    fn list(modality: Modality, hits: &[(&str, f32)]) -> RankedList {
        RankedList::new(
            IndexKey::new(modality, "gallery"),
            hits.iter()
                .map(|(id, score)| candidate(id, modality, *score, None))
                .collect(),
        )
    }

    /// Test 1: Reciprocal-rank contributions use 1-based ranks
    #[test]
    fn test_rrf_scores_by_rank() {
        let lists = vec![list(
            Modality::DocumentText,
            &[("first", 0.9), ("second", 0.8), ("third", 0.1)],
        )];
        let fused = WeightedReciprocalRank::default().fuse(&lists, &ModalityWeights::default());

        let expected = [1.0 / (RRF_C + 1.0), 1.0 / (RRF_C + 2.0), 1.0 / (RRF_C + 3.0)];
        for (result, score) in fused.iter().zip(expected) {
            assert!((result.fused_score - score).abs() < 1e-7);
        }
    }

    /// Test 2: Weights scale a modality's contribution
    #[test]
    fn test_weighted_contribution() {
        let weights = ModalityWeights {
            image_visual: 0.5,
            image_text: 1.5,
            document_text: 1.0,
        };
        let lists = vec![
            list(Modality::ImageVisual, &[("a", 0.99)]),
            list(Modality::ImageText, &[("a", 0.30)]),
        ];
        let fused = WeightedReciprocalRank::new(10.0).fuse(&lists, &weights);

        assert_eq!(fused.len(), 1);
        assert!((fused[0].fused_score - (0.5 / 11.0 + 1.5 / 11.0)).abs() < 1e-6);
        // Text contributed most
        assert_eq!(fused[0].modality, Modality::ImageText);
    }

    /// Test 3: Rank fusion ignores raw score scale, score sum does not
    #[test]
    fn test_strategies_disagree_on_scale() {
        let lists = vec![
            list(Modality::ImageVisual, &[("sharp", 0.95), ("flat", 0.94)]),
            list(Modality::DocumentText, &[("flat", 0.20), ("sharp", 0.01)]),
        ];
        let weights = ModalityWeights::default();

        let rrf = WeightedReciprocalRank::default().fuse(&lists, &weights);
        // Equal RRF totals; the tie breaks on the dominant modality's raw score
        assert_eq!(rrf[0].id, "sharp");

        let sum = WeightedScoreSum.fuse(&lists, &weights);
        assert_eq!(sum[0].id, "flat");
        assert!((sum[0].fused_score - 1.14).abs() < 1e-5);
    }

    /// Test 4: Merged metadata prefers the primary modality
    #[test]
    fn test_primary_modality_metadata_wins() {
        let lists = vec![
            RankedList::new(
                IndexKey::new(Modality::ImageVisual, "gallery"),
                vec![candidate("img", Modality::ImageVisual, 0.9, Some("visual caption"))],
            ),
            RankedList::new(
                IndexKey::new(Modality::ImageText, "gallery"),
                vec![
                    candidate("other", Modality::ImageText, 0.95, None),
                    candidate("img", Modality::ImageText, 0.5, Some("text caption")),
                ],
            ),
        ];
        let fused = WeightedReciprocalRank::default().fuse(&lists, &ModalityWeights::default());
        let img = fused.iter().find(|r| r.id == "img").unwrap();

        assert_eq!(img.modality, Modality::ImageVisual);
        assert_eq!(
            img.metadata.get("caption"),
            Some(&MetadataValue::from("visual caption"))
        );
        assert_eq!(img.collection, "gallery");
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(WeightedReciprocalRank::default().name(), "weighted_rrf");
        assert_eq!(WeightedScoreSum.name(), "weighted_score_sum");
    }
}
