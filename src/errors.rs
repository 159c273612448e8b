// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Error types for the retrieval engine
//!
//! Covers every failure the engine can surface:
//! - Ingestion errors (dimension mismatch, invalid vectors, oversized metadata)
//! - Lookup errors (unknown ids, unknown collections)
//! - Query-time degradation (sub-search timeouts)
//! - Persistence errors (corrupt index snapshots, unreachable canonical store)

use thiserror::Error;

use crate::vector::types::Modality;

/// Result alias used throughout the crate
pub type RetrievalResult<T> = Result<T, RetrievalError>;

/// Errors raised by the store, the ANN indexes and the retriever
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Vector length disagrees with the fixed dimension of its modality or index
    #[error("Dimension mismatch: expected {expected}D, got {actual}D")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector contains NaN/Infinity or cannot be normalised
    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    /// Record metadata exceeds the per-record limit
    #[error("Metadata too large: {size} bytes (max: {limit} bytes)")]
    MetadataTooLarge { size: usize, limit: usize },

    /// Unknown or already deleted id
    #[error("Not found: {0}")]
    NotFound(String),

    /// No index has ever been created for this (modality, collection)
    #[error("Unknown collection: {collection} ({modality})")]
    UnknownCollection {
        modality: Modality,
        collection: String,
    },

    /// A sub-search exceeded its deadline
    #[error("Search timeout: {modality}/{collection} exceeded {timeout_ms}ms")]
    Timeout {
        modality: Modality,
        collection: String,
        timeout_ms: u64,
    },

    /// A persisted index snapshot could not be decoded or does not match the store
    #[error("Corrupt index state: {0}")]
    CorruptIndexState(String),

    /// Canonical store is unreachable; terminal for the request
    #[error("Vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RetrievalError {
    fn from(err: serde_json::Error) -> Self {
        RetrievalError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for RetrievalError {
    fn from(err: bincode::Error) -> Self {
        RetrievalError::CorruptIndexState(err.to_string())
    }
}

impl RetrievalError {
    /// Get user-friendly error message for API responses
    pub fn user_message(&self) -> String {
        match self {
            RetrievalError::DimensionMismatch { expected, actual } => {
                format!(
                    "Embedding rejected: expected {} dimensions, received {}",
                    expected, actual
                )
            }
            RetrievalError::NotFound(id) => format!("No embedding with id '{}'", id),
            RetrievalError::UnknownCollection { collection, .. } => {
                format!("Collection '{}' has no indexed content", collection)
            }
            RetrievalError::Timeout { modality, .. } => {
                format!("Search over {} content timed out", modality)
            }
            RetrievalError::StoreUnavailable(_) => {
                "Knowledge base is temporarily unavailable".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Get error code for logging and metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            RetrievalError::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            RetrievalError::InvalidVector(_) => "INVALID_VECTOR",
            RetrievalError::MetadataTooLarge { .. } => "METADATA_TOO_LARGE",
            RetrievalError::NotFound(_) => "NOT_FOUND",
            RetrievalError::UnknownCollection { .. } => "UNKNOWN_COLLECTION",
            RetrievalError::Timeout { .. } => "TIMEOUT",
            RetrievalError::CorruptIndexState(_) => "CORRUPT_INDEX_STATE",
            RetrievalError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            RetrievalError::InvalidConfig(_) => "INVALID_CONFIG",
            RetrievalError::Io(_) => "IO_ERROR",
            RetrievalError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetrievalError::Timeout { .. } | RetrievalError::StoreUnavailable(_)
        )
    }

    /// Whether the error must fail the whole request rather than degrade it
    pub fn is_fatal(&self) -> bool {
        matches!(self, RetrievalError::StoreUnavailable(_))
    }
}
