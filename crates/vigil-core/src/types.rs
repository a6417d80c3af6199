use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::similarity::{cosine_similarity, SimilarityError};

/// Face embedding vector (length fixed by the model, e.g. 192 for MobileFaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "mobile_facenet").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Fails when the
    /// embeddings come from models with different output sizes.
    pub fn similarity(&self, other: &Embedding) -> Result<f64, SimilarityError> {
        cosine_similarity(&self.values, &other.values)
    }
}

/// A classifier label with its confidence in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub text: String,
    pub confidence: f32,
}

impl Label {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// An enrolled reference face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Gallery identifier (the reference image's base name).
    pub id: String,
    pub embedding: Embedding,
    /// Where the reference image was loaded from.
    pub source: PathBuf,
}

/// Result of matching a probe against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Best-scoring candidate, reported even when it falls below threshold.
    /// `None` only when the gallery had nothing to score.
    pub best_candidate_id: Option<String>,
    pub best_source: Option<PathBuf>,
    /// Cosine similarity of the best candidate [-1, 1], or
    /// [`NO_CANDIDATE_SCORE`](crate::matcher::NO_CANDIDATE_SCORE) for an empty gallery.
    pub similarity: f64,
    pub threshold: f64,
}

/// How a [`MatchResult`] should be presented to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched,
    BelowThreshold,
    EmptyGallery,
}

impl MatchOutcome {
    pub fn message(self) -> &'static str {
        match self {
            MatchOutcome::Matched => "match found",
            MatchOutcome::BelowThreshold => "no match above threshold",
            MatchOutcome::EmptyGallery => "no reference images enrolled",
        }
    }
}

impl MatchResult {
    pub fn outcome(&self) -> MatchOutcome {
        if self.matched {
            MatchOutcome::Matched
        } else if self.best_candidate_id.is_none() {
            MatchOutcome::EmptyGallery
        } else {
            MatchOutcome::BelowThreshold
        }
    }

    /// Similarity mapped into [0, 1] for storage and display.
    pub fn clamped_similarity(&self) -> f64 {
        self.similarity.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(matched: bool, id: Option<&str>, similarity: f64) -> MatchResult {
        MatchResult {
            matched,
            best_candidate_id: id.map(str::to_string),
            best_source: None,
            similarity,
            threshold: 0.85,
        }
    }

    #[test]
    fn test_embedding_similarity_delegates() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::with_model(vec![1.0, 0.0, 0.0], "test");
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(b.model_version.as_deref(), Some("test"));
    }

    #[test]
    fn test_embedding_similarity_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!(a.similarity(&b).is_err());
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(result(true, Some("a"), 0.9).outcome(), MatchOutcome::Matched);
        assert_eq!(result(false, Some("a"), 0.2).outcome(), MatchOutcome::BelowThreshold);
        assert_eq!(result(false, None, -1.0).outcome(), MatchOutcome::EmptyGallery);
    }

    #[test]
    fn test_clamped_similarity() {
        assert_eq!(result(false, None, -1.0).clamped_similarity(), 0.0);
        assert_eq!(result(true, Some("a"), 0.75).clamped_similarity(), 0.75);
    }
}
