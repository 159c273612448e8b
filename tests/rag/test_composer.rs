// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Tests for context composition under a character budget

use fabstir_retrieval_engine::config::ComposerConfig;
use fabstir_retrieval_engine::rag::{ContextComposer, FusedResult};
use fabstir_retrieval_engine::vector::{Metadata, MetadataValue, Modality};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};

#[cfg(test)]
mod composer_tests {
    use super::*;

    fn composer(budget: usize, floor: usize) -> ContextComposer {
        ContextComposer::new(ComposerConfig {
            text_budget_chars: budget,
            min_snippet_chars: floor,
            reference_uri_prefix: "/uploads".to_string(),
        })
    }

    fn result(id: &str, score: f32, modality: Modality, metadata: Metadata) -> FusedResult {
        FusedResult {
            id: id.to_string(),
            modality,
            collection: "c".to_string(),
            fused_score: score,
            contributing_scores: BTreeMap::new(),
            metadata,
        }
    }

    fn text_meta(field: &str, text: &str) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(field.to_string(), MetadataValue::from(text));
        metadata
    }

    /// Test 1: Budget is never exceeded and the floor always holds
    #[test]
    fn test_budget_and_floor_hold_for_random_inputs() {
        let mut rng = StdRng::seed_from_u64(2024);
        let alphabet: Vec<char> = "abcdé ü漢字xyz".chars().collect();

        for round in 0..200 {
            let count = rng.gen_range(0..12);
            let budget = rng.gen_range(0..400);
            let floor = rng.gen_range(1..60);

            let mut lengths = HashMap::new();
            let results: Vec<FusedResult> = (0..count)
                .map(|i| {
                    let len = rng.gen_range(1..150);
                    let text: String = (0..len)
                        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                        .collect();
                    let id = format!("r{}-{}", round, i);
                    lengths.insert(id.clone(), text.trim().chars().count());
                    result(&id, 1.0 - i as f32 * 0.01, Modality::DocumentText, text_meta("text", &text))
                })
                .collect();

            let bundle = composer(budget, floor).compose(&results, None);

            assert!(
                bundle.total_chars <= budget,
                "round {}: {} chars over budget {}",
                round,
                bundle.total_chars,
                budget
            );
            let counted: usize = bundle
                .items
                .iter()
                .filter_map(|item| item.text_snippet.as_ref())
                .map(|s| s.chars().count())
                .sum();
            assert_eq!(counted, bundle.total_chars);

            for item in &bundle.items {
                let full = lengths[&item.id];
                if let Some(snippet) = &item.text_snippet {
                    let len = snippet.chars().count();
                    assert!(
                        full == 0 || len >= floor.min(full),
                        "round {}: {} trimmed to {} (floor {}, full {})",
                        round,
                        item.id,
                        len,
                        floor,
                        full
                    );
                }
            }

            let ranks: Vec<usize> = bundle.items.iter().map(|i| i.citation_rank).collect();
            assert_eq!(ranks, (1..=bundle.items.len()).collect::<Vec<_>>());
            assert_eq!(bundle.items.len() + bundle.omitted, lengths.len());
        }
    }

    /// Test 2: Omission drops the lowest-ranked items first
    #[test]
    fn test_omits_from_the_bottom() {
        let results: Vec<FusedResult> = (0..4)
            .map(|i| {
                result(
                    &format!("r{}", i),
                    1.0 - i as f32 * 0.1,
                    Modality::DocumentText,
                    text_meta("text", &"w".repeat(100)),
                )
            })
            .collect();

        let bundle = composer(120, 20).compose(&results, None);
        let ids: Vec<&str> = bundle.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1"]);
        assert_eq!(bundle.omitted, 2);
        // Whole first snippet, the second cut to what is left
        assert_eq!(bundle.items[0].text_snippet.as_ref().unwrap().chars().count(), 100);
        let second = bundle.items[1].text_snippet.as_ref().unwrap();
        assert_eq!(second.chars().count(), 20);
        assert!(second.ends_with('…'));
    }

    /// Test 3: Image pages of one document collapse into one citation
    #[test]
    fn test_source_dedup_and_render() {
        let mut page_one = text_meta("ocr_text", "Quarterly revenue grew");
        page_one.insert("source_id".to_string(), MetadataValue::from("report.pdf"));
        let mut page_two = text_meta("caption", "bar chart of revenue");
        page_two.insert("source_id".to_string(), MetadataValue::from("report.pdf"));
        let photo = text_meta("caption", "team photo");

        let results = vec![
            result("page-2", 0.030, Modality::ImageVisual, page_two),
            result("page-1", 0.032, Modality::ImageText, page_one),
            result("photo", 0.020, Modality::ImageVisual, photo),
        ];
        let bundle = composer(1000, 10).compose(&results, None);

        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.items[0].id, "page-1");
        assert_eq!(bundle.items[0].modality, Modality::ImageText);
        assert_eq!(
            bundle.items[0].text_snippet.as_deref(),
            Some("bar chart of revenue | Quarterly revenue grew")
        );

        let rendered = bundle.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(
            lines,
            vec![
                "[1] bar chart of revenue | Quarterly revenue grew (/uploads/page-1)",
                "[2] team photo (/uploads/photo)",
            ]
        );
    }

    /// Test 4: Explicit budget overrides the configured one
    #[test]
    fn test_budget_override_and_empty_input() {
        let results = vec![result(
            "a",
            0.5,
            Modality::DocumentText,
            text_meta("text", &"z".repeat(500)),
        )];
        let bundle = composer(10_000, 10).compose(&results, Some(50));
        assert_eq!(bundle.budget_chars, 50);
        assert_eq!(bundle.total_chars, 50);

        let empty = composer(100, 10).compose(&[], None);
        assert!(empty.is_empty());
        assert_eq!(empty.render(), "");
    }
}
