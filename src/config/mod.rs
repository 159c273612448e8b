// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Engine configuration
//!
//! Loaded from TOML (every section optional, missing keys take defaults)
//! and overridable through `RETRIEVAL_*` environment variables.
//!
//! ```toml
//! [hnsw]
//! m = 16
//! ef_construction = 200
//!
//! [retrieval.weights]
//! image_visual = 1.0
//! image_text = 1.5
//! document_text = 1.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{RetrievalError, RetrievalResult};
use crate::vector::types::Modality;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Max neighbors per node (layer 0 allows 2x)
    pub m: usize,
    pub ef_construction: usize,
    /// Default candidate list size at query time
    pub ef_search: usize,
    /// Fixed seed for level assignment; random when absent
    pub seed: Option<u64>,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Root for the record log and index snapshots; in-memory when absent
    pub data_dir: Option<PathBuf>,
    /// Tombstone share above which a handle is rebuilt
    pub tombstone_rebuild_ratio: f64,
    /// Handles smaller than this are never compacted automatically
    pub min_nodes_for_rebuild: usize,
    pub auto_rebuild: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            tombstone_rebuild_ratio: 0.2,
            min_nodes_for_rebuild: 64,
            auto_rebuild: true,
        }
    }
}

/// Fixed vector length per modality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalityConfig {
    pub image_visual: usize,
    pub image_text: usize,
    pub document_text: usize,
}

impl Default for ModalityConfig {
    fn default() -> Self {
        Self {
            image_visual: 512,
            image_text: 768,
            document_text: 768,
        }
    }
}

impl ModalityConfig {
    pub fn dimension(&self, modality: Modality) -> usize {
        match modality {
            Modality::ImageVisual => self.image_visual,
            Modality::ImageText => self.image_text,
            Modality::DocumentText => self.document_text,
        }
    }
}

/// Per-modality fusion weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalityWeights {
    pub image_visual: f32,
    pub image_text: f32,
    pub document_text: f32,
}

impl Default for ModalityWeights {
    fn default() -> Self {
        Self {
            image_visual: 1.0,
            image_text: 1.0,
            document_text: 1.0,
        }
    }
}

impl ModalityWeights {
    pub fn weight(&self, modality: Modality) -> f32 {
        match modality {
            Modality::ImageVisual => self.image_visual,
            Modality::ImageText => self.image_text,
            Modality::DocumentText => self.document_text,
        }
    }

    /// Highest-weighted modality; ties resolve in declaration order
    pub fn dominant(&self) -> Modality {
        let mut best = Modality::ALL[0];
        for modality in Modality::ALL.into_iter().skip(1) {
            if self.weight(modality) > self.weight(best) {
                best = modality;
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_k: usize,
    /// Per-index candidates = k * oversample_factor
    pub oversample_factor: usize,
    /// Reciprocal-rank damping constant
    pub rrf_c: f32,
    pub weights: ModalityWeights,
    pub sub_search_timeout_ms: u64,
    /// When set, one re-search with this larger factor runs if filtering
    /// leaves an index with fewer than k survivors
    pub underfill_retry_factor: Option<usize>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 10,
            oversample_factor: 3,
            rrf_c: 60.0,
            weights: ModalityWeights::default(),
            sub_search_timeout_ms: 250,
            underfill_retry_factor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Total characters across all snippets
    pub text_budget_chars: usize,
    /// No included snippet is cut below this many characters
    pub min_snippet_chars: usize,
    pub reference_uri_prefix: String,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            text_budget_chars: 6000,
            min_snippet_chars: 80,
            reference_uri_prefix: "/uploads".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub hnsw: HnswConfig,
    pub index: IndexConfig,
    pub modalities: ModalityConfig,
    pub retrieval: RetrievalConfig,
    pub composer: ComposerConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> RetrievalResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| RetrievalError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override selected settings from `RETRIEVAL_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("RETRIEVAL_DATA_DIR") {
            self.index.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(m) = env_parse("RETRIEVAL_HNSW_M") {
            self.hnsw.m = m;
        }

        if let Some(ef) = env_parse("RETRIEVAL_EF_SEARCH") {
            self.hnsw.ef_search = ef;
        }

        if let Some(ms) = env_parse("RETRIEVAL_SUB_SEARCH_TIMEOUT_MS") {
            self.retrieval.sub_search_timeout_ms = ms;
        }

        if let Some(budget) = env_parse("RETRIEVAL_TEXT_BUDGET") {
            self.composer.text_budget_chars = budget;
        }
    }

    pub fn validate(&self) -> RetrievalResult<()> {
        let invalid = |msg: &str| Err(RetrievalError::InvalidConfig(msg.to_string()));

        if self.hnsw.m < 2 {
            return invalid("hnsw.m must be at least 2");
        }
        if self.hnsw.ef_construction == 0 || self.hnsw.ef_search == 0 {
            return invalid("hnsw ef values must be positive");
        }
        let ratio = self.index.tombstone_rebuild_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return invalid("index.tombstone_rebuild_ratio must be in (0, 1]");
        }
        if Modality::ALL
            .iter()
            .any(|&m| self.modalities.dimension(m) == 0)
        {
            return invalid("modality dimensions must be positive");
        }
        if Modality::ALL
            .iter()
            .any(|&m| !(self.retrieval.weights.weight(m) >= 0.0))
        {
            return invalid("fusion weights must be non-negative");
        }
        if self.retrieval.oversample_factor == 0 {
            return invalid("retrieval.oversample_factor must be positive");
        }
        if self.retrieval.rrf_c < 0.0 {
            return invalid("retrieval.rrf_c must be non-negative");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
