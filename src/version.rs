// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Version information for the Fabstir retrieval engine

/// Full version string with feature description
pub const VERSION: &str = "v0.1.0-hybrid-retrieval-2026-10-18";

/// Semantic version number
pub const VERSION_NUMBER: &str = env!("CARGO_PKG_VERSION");

/// Build date
pub const BUILD_DATE: &str = "2026-10-18";

/// On-disk snapshot format understood by this build
pub const SNAPSHOT_FORMAT: u16 = 1;

/// Supported features in this version
pub const FEATURES: &[&str] = &[
    "hnsw-index",
    "tombstone-compaction",
    "index-snapshots",
    "multimodal-fusion",
    "weighted-rrf",
    "metadata-filters",
    "context-composer",
];

/// Get formatted version string for logging
pub fn get_version_string() -> String {
    format!(
        "Fabstir Retrieval Engine {} ({})",
        VERSION_NUMBER, BUILD_DATE
    )
}

/// Get full version info for machine-readable output
pub fn get_version_info() -> serde_json::Value {
    serde_json::json!({
        "version": VERSION_NUMBER,
        "build": VERSION,
        "date": BUILD_DATE,
        "snapshot_format": SNAPSHOT_FORMAT,
        "features": FEATURES,
    })
}
