//! Cosine similarity between face embeddings.
//!
//! Accumulates in `f64` regardless of the `f32` storage precision so long
//! embeddings do not lose precision to cancellation.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Cosine similarity of two equal-length vectors, in [-1, 1].
///
/// Returns 0.0 when either vector has zero norm. Unequal lengths are a
/// contract violation and fail instead of truncating.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return Ok(0.0);
    }
    let sim = dot / denom;
    if sim.is_finite() {
        Ok(sim.clamp(-1.0, 1.0))
    } else {
        Ok(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identical_vectors() {
        let a = [0.3f32, -1.2, 4.0, 0.001];
        let sim = cosine_similarity(&a, &a).unwrap();
        assert!((sim - 1.0).abs() < 1e-9, "got {sim}");
    }

    #[test]
    fn test_orthogonal_vectors() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-12);
    }

    #[test]
    fn test_opposite_vectors() {
        let sim = cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]).unwrap();
        assert!((sim + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_vector_either_side() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_empty_vectors() {
        assert_eq!(cosine_similarity(&[], &[]).unwrap(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0]).unwrap_err();
        assert_eq!(err, SimilarityError::DimensionMismatch { left: 3, right: 2 });
    }

    #[test]
    fn test_long_vector_precision() {
        // 192-dim embedding, the size produced by MobileFaceNet-style models
        let a: Vec<f32> = (0..192).map(|i| ((i as f32) * 0.37).sin()).collect();
        let sim = cosine_similarity(&a, &a).unwrap();
        assert!((sim - 1.0).abs() < 1e-9);
    }

    fn vec_pair() -> impl Strategy<Value = (Vec<f32>, Vec<f32>)> {
        (1usize..64).prop_flat_map(|dim| {
            (
                proptest::collection::vec(-100.0f32..100.0, dim),
                proptest::collection::vec(-100.0f32..100.0, dim),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_symmetric((a, b) in vec_pair()) {
            let ab = cosine_similarity(&a, &b).unwrap();
            let ba = cosine_similarity(&b, &a).unwrap();
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_bounded_and_finite((a, b) in vec_pair()) {
            let sim = cosine_similarity(&a, &b).unwrap();
            prop_assert!(sim.is_finite());
            prop_assert!((-1.0..=1.0).contains(&sim));
        }
    }
}
