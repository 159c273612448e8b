// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Vector validation and normalisation helpers
//!
//! Every vector is L2-normalised before storage so cosine similarity
//! reduces to a dot product inside the index.

use crate::errors::{RetrievalError, RetrievalResult};

/// Dot product of two equal-length slices
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm
#[inline]
pub fn magnitude(vector: &[f32]) -> f32 {
    dot(vector, vector).sqrt()
}

/// Check the vector length and reject NaN/Infinity values
pub fn validate(vector: &[f32], expected_dimension: usize) -> RetrievalResult<()> {
    if vector.len() != expected_dimension {
        return Err(RetrievalError::DimensionMismatch {
            expected: expected_dimension,
            actual: vector.len(),
        });
    }

    if vector.iter().any(|v| !v.is_finite()) {
        return Err(RetrievalError::InvalidVector(
            "contains NaN or Infinity (all values must be finite numbers)".to_string(),
        ));
    }

    Ok(())
}

/// Return a unit-length copy of `vector`. Zero vectors cannot be normalised.
pub fn normalize(vector: &[f32]) -> RetrievalResult<Vec<f32>> {
    let norm = magnitude(vector);
    if norm == 0.0 || !norm.is_finite() {
        return Err(RetrievalError::InvalidVector(
            "zero-magnitude vector cannot be normalised".to_string(),
        ));
    }
    Ok(vector.iter().map(|&x| x / norm).collect())
}

/// Validate then normalise
pub fn prepare(vector: &[f32], expected_dimension: usize) -> RetrievalResult<Vec<f32>> {
    validate(vector, expected_dimension)?;
    normalize(vector)
}

/// Validate, then normalise unless the vector is already unit length.
/// Already-normalised input is returned bit-for-bit unchanged.
pub fn ensure_unit(vector: &[f32], expected_dimension: usize) -> RetrievalResult<Vec<f32>> {
    validate(vector, expected_dimension)?;
    if (magnitude(vector) - 1.0).abs() <= UNIT_TOLERANCE {
        return Ok(vector.to_vec());
    }
    normalize(vector)
}

const UNIT_TOLERANCE: f32 = 1e-5;
