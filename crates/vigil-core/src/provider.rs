//! Model boundaries: face embedding and label classification.
//!
//! Vigil never runs face detection or classification itself; it consumes
//! these traits. [`ThumbnailEmbedder`] is a model-free baseline used for
//! development and tests. It is not a biometric model.

use std::sync::Arc;

use image::imageops::FilterType;
use thiserror::Error;

use crate::frame::Frame;
use crate::types::{Embedding, Label};

const THUMBNAIL_SIZE: u32 = 16;
const THUMBNAIL_MODEL_VERSION: &str = "thumbnail16";
/// Luma standard deviation (0–255 scale) below which a frame is treated as featureless.
const THUMBNAIL_MIN_STDDEV: f32 = 1.0;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("model not available: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Face detector + embedding model.
pub trait EmbeddingProvider: Send + Sync {
    /// Detect faces and return one embedding per face, strongest first.
    ///
    /// An empty vector means no face was found. Callers use only the first
    /// entry; multiple faces are not disambiguated.
    fn detect_and_embed(&self, frame: &Frame) -> Result<Vec<Embedding>, ProviderError>;
}

/// General-purpose image classifier.
pub trait LabelProvider: Send + Sync {
    fn classify(&self, frame: &Frame) -> Result<Vec<Label>, ProviderError>;
}

impl<T: EmbeddingProvider + ?Sized> EmbeddingProvider for Arc<T> {
    fn detect_and_embed(&self, frame: &Frame) -> Result<Vec<Embedding>, ProviderError> {
        (**self).detect_and_embed(frame)
    }
}

impl<T: LabelProvider + ?Sized> LabelProvider for Arc<T> {
    fn classify(&self, frame: &Frame) -> Result<Vec<Label>, ProviderError> {
        (**self).classify(frame)
    }
}

/// Whole-image baseline embedder.
///
/// Downscales the frame to a 16×16 luma thumbnail, mean-centres it and
/// L2-normalizes the result into a 256-dim vector. Featureless (flat)
/// frames report no face.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbnailEmbedder;

impl ThumbnailEmbedder {
    pub const DIM: usize = (THUMBNAIL_SIZE * THUMBNAIL_SIZE) as usize;
}

impl EmbeddingProvider for ThumbnailEmbedder {
    fn detect_and_embed(&self, frame: &Frame) -> Result<Vec<Embedding>, ProviderError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let rgb = image::RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
            .ok_or_else(|| {
                ProviderError::InferenceFailed(format!(
                    "frame buffer does not match {}x{}",
                    frame.width(), frame.height()
                ))
            })?;
        let thumb = image::imageops::resize(&rgb, THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);

        let luma: Vec<f32> = thumb
            .pixels()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .collect();

        let n = luma.len() as f32;
        let mean = luma.iter().sum::<f32>() / n;
        let centered: Vec<f32> = luma.iter().map(|v| v - mean).collect();
        let variance = centered.iter().map(|v| v * v).sum::<f32>() / n;
        if variance.sqrt() < THUMBNAIL_MIN_STDDEV {
            tracing::debug!(
                width = frame.width(),
                height = frame.height(),
                "thumbnail embedder: featureless frame"
            );
            return Ok(Vec::new());
        }

        // L2-normalize the embedding
        let norm = centered.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = centered.iter().map(|v| v / norm).collect();

        Ok(vec![Embedding::with_model(values, THUMBNAIL_MODEL_VERSION)])
    }
}

/// Label provider returning a fixed list, for callers that already hold labels.
#[derive(Debug, Clone, Default)]
pub struct StaticLabeler {
    labels: Vec<Label>,
}

impl StaticLabeler {
    pub fn new(labels: Vec<Label>) -> Self {
        Self { labels }
    }
}

impl LabelProvider for StaticLabeler {
    fn classify(&self, _frame: &Frame) -> Result<Vec<Label>, ProviderError> {
        Ok(self.labels.clone())
    }
}

/// Label provider that never returns labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLabels;

impl LabelProvider for NoLabels {
    fn classify(&self, _frame: &Frame) -> Result<Vec<Label>, ProviderError> {
        Ok(Vec::new())
    }
}
