//! Gallery matcher — best-candidate selection over cosine similarity.
//!
//! Candidates are scored in discovery order. A strictly greater score
//! replaces the current best; an equal score keeps the earlier candidate.
//! Sharded scans merge on (score, discovery index) so they select the same
//! candidate as a sequential scan.

use rayon::prelude::*;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::frame::Frame;
use crate::gallery::{GalleryEntry, GalleryError, GallerySource};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::similarity::SimilarityError;
use crate::types::{Embedding, MatchCandidate, MatchResult};

/// Score reported when there was nothing to compare against.
pub const NO_CANDIDATE_SCORE: f64 = -1.0;

const DEFAULT_THRESHOLD: f64 = 0.85;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("no face detected in probe image")]
    NoFaceDetected,
    #[error(transparent)]
    DimensionMismatch(#[from] SimilarityError),
    #[error("embedding provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("gallery scan cancelled")]
    Cancelled,
}

/// Progress notifications emitted during a gallery scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Scored {
        index: usize,
        id: String,
        similarity: f64,
    },
    Skipped {
        index: usize,
        id: String,
        reason: String,
    },
}

pub type ProgressFn = dyn Fn(ScanEvent) + Send + Sync;

/// Strategy for comparing a probe embedding against precomputed candidates.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[MatchCandidate],
        threshold: f64,
    ) -> Result<MatchResult, SimilarityError>;
}

/// Sequential cosine-similarity matcher, first-wins on ties.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[MatchCandidate],
        threshold: f64,
    ) -> Result<MatchResult, SimilarityError> {
        let mut best: Option<Best> = None;
        for (i, candidate) in gallery.iter().enumerate() {
            let sim = probe.similarity(&candidate.embedding)?;
            Best::offer(&mut best, i, sim);
        }
        Ok(build_result(best, threshold, |i| {
            (gallery[i].id.clone(), gallery[i].source.clone())
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Best {
    index: usize,
    score: f64,
}

impl Best {
    fn offer(best: &mut Option<Best>, index: usize, score: f64) {
        match best {
            Some(b) if score <= b.score => {}
            _ => *best = Some(Best { index, score }),
        }
    }

    /// Combine two shard results: higher score wins, equal scores keep the
    /// lower discovery index.
    fn merge(a: Option<Best>, b: Option<Best>) -> Option<Best> {
        match (a, b) {
            (Some(x), Some(y)) => {
                if y.score > x.score || (y.score == x.score && y.index < x.index) {
                    Some(y)
                } else {
                    Some(x)
                }
            }
            (x, None) => x,
            (None, y) => y,
        }
    }
}

fn build_result(
    best: Option<Best>,
    threshold: f64,
    describe: impl Fn(usize) -> (String, std::path::PathBuf),
) -> MatchResult {
    match best {
        Some(b) => {
            let (id, source) = describe(b.index);
            MatchResult {
                matched: b.score >= threshold,
                best_candidate_id: Some(id),
                best_source: Some(source),
                similarity: b.score,
                threshold,
            }
        }
        None => MatchResult {
            matched: false,
            best_candidate_id: None,
            best_source: None,
            similarity: NO_CANDIDATE_SCORE,
            threshold,
        },
    }
}

/// Matcher tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherConfig {
    /// Minimum similarity for a positive match.
    pub threshold: f64,
    /// Number of shards a scan is split into (1 = sequential).
    pub workers: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            workers: 1,
        }
    }
}

/// Scans a gallery for the candidate most similar to a probe image.
pub struct GalleryMatcher<E> {
    embedder: E,
    config: MatcherConfig,
}

impl<E: EmbeddingProvider> GalleryMatcher<E> {
    pub fn new(embedder: E, config: MatcherConfig) -> Self {
        Self { embedder, config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Embed the probe's first detected face.
    pub fn embed_probe(&self, probe: &Frame) -> Result<Embedding, MatchError> {
        self.embedder
            .detect_and_embed(probe)?
            .into_iter()
            .next()
            .ok_or(MatchError::NoFaceDetected)
    }

    /// Identify `probe` against every image in `gallery`.
    ///
    /// Unreadable candidates and candidates without a face are skipped.
    /// The probe having no face is an error, distinct from a low score.
    pub fn find_best_match(
        &self,
        probe: &Frame,
        gallery: &dyn GallerySource,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> Result<MatchResult, MatchError> {
        let probe_embedding = self.embed_probe(probe)?;
        let entries = gallery.entries()?;
        tracing::info!(
            candidates = entries.len(),
            workers = self.config.workers,
            threshold = self.config.threshold,
            "scanning gallery"
        );

        let best = self.scan(entries.len(), cancel, |i| {
            let entry = &entries[i];
            let Some(embedding) = self.embed_entry(gallery, entry, progress) else {
                return Ok(None);
            };
            let similarity = probe_embedding.similarity(&embedding)?;
            tracing::debug!(id = %entry.id, similarity, "candidate scored");
            if let Some(notify) = progress {
                notify(ScanEvent::Scored {
                    index: entry.index,
                    id: entry.id.clone(),
                    similarity,
                });
            }
            Ok(Some(similarity))
        })?;

        let result = build_result(best, self.config.threshold, |i| {
            (entries[i].id.clone(), entries[i].source.clone())
        });
        tracing::info!(
            matched = result.matched,
            best = ?result.best_candidate_id,
            similarity = result.similarity,
            "gallery scan complete"
        );
        Ok(result)
    }

    /// Embed every usable gallery image once, preserving discovery order.
    pub fn embed_gallery(
        &self,
        gallery: &dyn GallerySource,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<MatchCandidate>, MatchError> {
        let entries = gallery.entries()?;
        let embed_one = |entry: &GalleryEntry| -> Result<Option<MatchCandidate>, MatchError> {
            if cancel.is_cancelled() {
                return Err(MatchError::Cancelled);
            }
            Ok(self
                .embed_entry(gallery, entry, progress)
                .map(|embedding| MatchCandidate {
                    id: entry.id.clone(),
                    embedding,
                    source: entry.source.clone(),
                }))
        };

        let embedded: Vec<Option<MatchCandidate>> = if self.config.workers > 1 {
            entries.par_iter().map(embed_one).collect::<Result<_, _>>()?
        } else {
            entries.iter().map(embed_one).collect::<Result<_, _>>()?
        };
        Ok(embedded.into_iter().flatten().collect())
    }

    /// Match a probe embedding against precomputed candidates.
    pub fn compare_precomputed(
        &self,
        probe: &Embedding,
        candidates: &[MatchCandidate],
        cancel: &CancellationToken,
    ) -> Result<MatchResult, MatchError> {
        let best = self.scan(candidates.len(), cancel, |i| {
            Ok(Some(probe.similarity(&candidates[i].embedding)?))
        })?;
        Ok(build_result(best, self.config.threshold, |i| {
            (candidates[i].id.clone(), candidates[i].source.clone())
        }))
    }

    /// Load, decode and embed one candidate. Failures are logged and
    /// reported as skips; the decoded frame is dropped before returning.
    fn embed_entry(
        &self,
        gallery: &dyn GallerySource,
        entry: &GalleryEntry,
        progress: Option<&ProgressFn>,
    ) -> Option<Embedding> {
        let skip = |reason: String| {
            tracing::warn!(id = %entry.id, source = %entry.source.display(), %reason, "skipping candidate");
            if let Some(notify) = progress {
                notify(ScanEvent::Skipped {
                    index: entry.index,
                    id: entry.id.clone(),
                    reason,
                });
            }
            None
        };

        let bytes = match gallery.load(entry) {
            Ok(bytes) => bytes,
            Err(e) => return skip(format!("unreadable: {e}")),
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => return skip(format!("undecodable: {e}")),
        };
        drop(bytes);

        match self.embedder.detect_and_embed(&frame) {
            Ok(faces) => match faces.into_iter().next() {
                Some(embedding) => Some(embedding),
                None => skip("no face detected".to_string()),
            },
            Err(e) => skip(format!("embedding failed: {e}")),
        }
    }

    /// Score indices `0..len` and return the best, checking `cancel` before
    /// each candidate. Splits into `workers` contiguous shards when > 1.
    fn scan<F>(&self, len: usize, cancel: &CancellationToken, score: F) -> Result<Option<Best>, MatchError>
    where
        F: Fn(usize) -> Result<Option<f64>, MatchError> + Sync,
    {
        let run_shard = |range: std::ops::Range<usize>| -> Result<Option<Best>, MatchError> {
            let mut best = None;
            for i in range {
                if cancel.is_cancelled() {
                    return Err(MatchError::Cancelled);
                }
                if let Some(sim) = score(i)? {
                    Best::offer(&mut best, i, sim);
                }
            }
            Ok(best)
        };

        let workers = self.config.workers.max(1);
        if workers == 1 || len < 2 {
            return run_shard(0..len);
        }

        let shard_len = len.div_ceil(workers);
        (0..workers)
            .into_par_iter()
            .map(|w| {
                let start = (w * shard_len).min(len);
                let end = (start + shard_len).min(len);
                run_shard(start..end)
            })
            .try_reduce(|| None, |a, b| Ok(Best::merge(a, b)))
    }
}
