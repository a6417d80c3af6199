//! vigil-core — Identity matching and image analysis engine.
//!
//! Scores face embeddings with cosine similarity, scans an enrolled
//! gallery for the best candidate, and derives heuristic content
//! statistics (brightness, palette, category, quality) from an image.
//! Face detection, embedding and labelling models are consumed through
//! the traits in [`provider`].

pub mod analyzer;
pub mod frame;
pub mod gallery;
pub mod matcher;
pub mod profile;
pub mod provider;
pub mod similarity;
pub mod types;

pub use analyzer::{AnalysisResult, AnalyzerConfig, Category, ColorBucket, ContentAnalyzer};
pub use frame::{Frame, FrameError};
pub use gallery::{
    DirectoryGallery, GalleryEntry, GalleryError, GallerySource, MemoryGallery, SubjectEntry,
};
pub use matcher::{
    CosineMatcher, GalleryMatcher, MatchError, Matcher, MatcherConfig, ProgressFn, ScanEvent,
    NO_CANDIDATE_SCORE,
};
pub use profile::SubjectProfile;
pub use provider::{EmbeddingProvider, LabelProvider, NoLabels, ProviderError, StaticLabeler, ThumbnailEmbedder};
pub use similarity::{cosine_similarity, SimilarityError};
pub use tokio_util::sync::CancellationToken;
pub use types::{Embedding, Label, MatchCandidate, MatchOutcome, MatchResult};
