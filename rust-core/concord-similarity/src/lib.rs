// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord Similarity Engine
//!
//! Scores how alike two insights are, in `[0, 1]`. Every other component
//! (detection, analysis, clustering, graph lookups) goes through
//! [`similarity`], so the function is total and deterministic: identical
//! inputs always produce bit-identical output.
//!
//! - Both sides carry an embedding of the same dimensionality: cosine
//!   similarity rescaled from `[-1, 1]` to `[0, 1]`.
//! - Otherwise: Jaccard overlap of lower-cased, punctuation-stripped tokens,
//!   flagged [`SimilarityScore::approximate`].

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod lexical;
pub use lexical::{jaccard, tokenize};

/// Similarity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding is empty")]
    EmptyEmbedding,

    #[error("Embedding contains a non-finite component at index {0}")]
    NonFinite(usize),
}

/// One side of a similarity comparison: the insight text and, when the
/// producing subsystem supplied one, its embedding.
#[derive(Debug, Clone, Copy)]
pub struct InsightVector<'a> {
    pub text: &'a str,
    pub embedding: Option<&'a [f32]>,
}

impl<'a> InsightVector<'a> {
    /// Text-only vector
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            embedding: None,
        }
    }

    /// Attach an embedding
    pub fn with_embedding(mut self, embedding: &'a [f32]) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Attach an optional embedding
    pub fn with_optional_embedding(mut self, embedding: Option<&'a [f32]>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// Result of a similarity comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScore {
    /// Score in `[0, 1]`
    pub value: f64,
    /// True when the lexical fallback produced the score
    pub approximate: bool,
}

impl SimilarityScore {
    /// Zero score (used for empty inputs)
    pub const ZERO: SimilarityScore = SimilarityScore {
        value: 0.0,
        approximate: true,
    };
}

/// Compute the similarity of two insights.
///
/// Never fails. Mismatched or degenerate (zero-norm) embeddings fall back to
/// the lexical score rather than erroring; dimensionality is validated at the
/// ingestion boundary with [`check_embedding`].
pub fn similarity(a: &InsightVector<'_>, b: &InsightVector<'_>) -> SimilarityScore {
    if let (Some(ea), Some(eb)) = (a.embedding, b.embedding) {
        if ea.len() == eb.len() && !ea.is_empty() {
            if let Some(cos) = cosine(ea, eb) {
                return SimilarityScore {
                    value: rescale(cos),
                    approximate: false,
                };
            }
        }
    }

    if a.text.trim().is_empty() && b.text.trim().is_empty() {
        return SimilarityScore::ZERO;
    }

    SimilarityScore {
        value: jaccard(a.text, b.text),
        approximate: true,
    }
}

/// Cosine similarity between two equal-length embeddings, in `[-1, 1]`.
///
/// Returns `None` when either vector has zero norm or a non-finite result.
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    if a == b {
        // Exact 1.0 for identical inputs regardless of rounding in the norms.
        let norm = squared_norm(a);
        return if norm > 0.0 && norm.is_finite() {
            Some(1.0)
        } else {
            None
        };
    }

    let va = as_f64_array(a);
    let vb = as_f64_array(b);
    let cos = cosine_similarity(va.view(), vb.view())?;
    if cos.is_finite() {
        Some(cos.clamp(-1.0, 1.0))
    } else {
        None
    }
}

/// Compute cosine similarity between two `f64` views.
pub fn cosine_similarity(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Option<f64> {
    let dot = a.dot(&b);
    let norm_a = a.dot(&a);
    let norm_b = b.dot(&b);
    if norm_a > 0.0 && norm_b > 0.0 {
        Some(dot / (norm_a * norm_b).sqrt())
    } else {
        None
    }
}

/// Map a cosine value from `[-1, 1]` onto `[0, 1]`.
pub fn rescale(cos: f64) -> f64 {
    ((cos + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Element-wise mean of a set of embeddings.
///
/// Returns `None` if the set is empty or the dimensionalities disagree.
pub fn mean_embedding<'a, I>(embeddings: I) -> Option<Vec<f32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Option<Array1<f64>> = None;
    let mut count = 0usize;

    for e in embeddings {
        let v = as_f64_array(e);
        match sum.as_mut() {
            None => sum = Some(v),
            Some(acc) if acc.len() == v.len() => *acc += &v,
            Some(_) => return None,
        }
        count += 1;
    }

    let sum = sum?;
    if count == 0 || sum.is_empty() {
        return None;
    }
    Some(sum.iter().map(|x| (x / count as f64) as f32).collect())
}

/// Validate an embedding at an ingestion boundary.
///
/// `expected` is the configured dimensionality, if any.
pub fn check_embedding(embedding: &[f32], expected: Option<usize>) -> Result<(), SimilarityError> {
    if embedding.is_empty() {
        return Err(SimilarityError::EmptyEmbedding);
    }
    if let Some(expected) = expected {
        if embedding.len() != expected {
            return Err(SimilarityError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }
    }
    if let Some(idx) = embedding.iter().position(|x| !x.is_finite()) {
        return Err(SimilarityError::NonFinite(idx));
    }
    Ok(())
}

fn as_f64_array(v: &[f32]) -> Array1<f64> {
    v.iter().map(|x| *x as f64).collect()
}

fn squared_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_vectors_score_one() {
        let e = [0.3_f32, -0.2, 0.9];
        let a = InsightVector::new("a").with_embedding(&e);
        let score = similarity(&a, &a);
        assert_eq!(score.value, 1.0);
        assert!(!score.approximate);
    }

    #[test]
    fn test_orthogonal_vectors_score_half() {
        let x = [1.0_f32, 0.0, 0.0];
        let y = [0.0_f32, 1.0, 0.0];
        let score = similarity(
            &InsightVector::new("x").with_embedding(&x),
            &InsightVector::new("y").with_embedding(&y),
        );
        assert!((score.value - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_opposite_vectors_score_zero() {
        let x = [1.0_f32, 2.0];
        let y = [-1.0_f32, -2.0];
        let score = similarity(
            &InsightVector::new("x").with_embedding(&x),
            &InsightVector::new("y").with_embedding(&y),
        );
        assert!(score.value.abs() < 1e-12);
    }

    #[test]
    fn test_missing_embedding_falls_back_to_lexical() {
        let x = [1.0_f32, 0.0];
        let a = InsightVector::new("Acme sentiment is positive").with_embedding(&x);
        let b = InsightVector::new("acme sentiment is negative!");
        let score = similarity(&a, &b);
        assert!(score.approximate);
        // {acme, sentiment, is} shared out of 5 distinct tokens
        assert!((score.value - 3.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_dimension_mismatch_falls_back_to_lexical() {
        let x = [1.0_f32, 0.0];
        let y = [1.0_f32, 0.0, 0.0];
        let score = similarity(
            &InsightVector::new("same words").with_embedding(&x),
            &InsightVector::new("same words").with_embedding(&y),
        );
        assert!(score.approximate);
        assert_eq!(score.value, 1.0);
    }

    #[test]
    fn test_empty_inputs_score_zero() {
        let score = similarity(&InsightVector::new(""), &InsightVector::new("  "));
        assert_eq!(score.value, 0.0);
    }

    #[test]
    fn test_zero_norm_embedding_uses_lexical() {
        let z = [0.0_f32, 0.0];
        let score = similarity(
            &InsightVector::new("alpha").with_embedding(&z),
            &InsightVector::new("alpha").with_embedding(&z),
        );
        assert!(score.approximate);
        assert_eq!(score.value, 1.0);
    }

    #[test]
    fn test_mean_embedding() {
        let a = [1.0_f32, 0.0];
        let b = [0.0_f32, 1.0];
        let mean = mean_embedding([&a[..], &b[..]]).unwrap();
        assert_eq!(mean, vec![0.5, 0.5]);

        let c = [1.0_f32, 0.0, 0.0];
        assert!(mean_embedding([&a[..], &c[..]]).is_none());
        assert!(mean_embedding(std::iter::empty::<&[f32]>()).is_none());
    }

    #[test]
    fn test_check_embedding() {
        assert!(check_embedding(&[0.1, 0.2], Some(2)).is_ok());
        assert_eq!(
            check_embedding(&[0.1, 0.2], Some(3)),
            Err(SimilarityError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(check_embedding(&[], None), Err(SimilarityError::EmptyEmbedding));
        assert_eq!(
            check_embedding(&[0.1, f32::NAN], None),
            Err(SimilarityError::NonFinite(1))
        );
    }
}
