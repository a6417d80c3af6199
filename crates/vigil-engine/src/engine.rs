use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vigil_core::{
    AnalysisResult, CancellationToken, ContentAnalyzer, DirectoryGallery, EmbeddingProvider, Frame,
    FrameError, GalleryError, GalleryMatcher, Label, LabelProvider, MatchError, MatchOutcome,
    MatchResult, ProviderError, ScanEvent, SubjectProfile,
};
use vigil_ledger::{HistoryLedger, HistoryRecord, LedgerError, MatchStatus};

use crate::config::{Config, ConfigError};

const REQUEST_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("image error: {0}")]
    Frame(#[from] FrameError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("{0}")]
    Match(#[from] MatchError),
    #[error("label provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("history error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Short text suitable for showing to an operator.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Match(MatchError::NoFaceDetected) => {
                "No face found in the photo. Please retake it.".to_string()
            }
            EngineError::Match(MatchError::Cancelled) => "Identification was cancelled.".to_string(),
            other => format!("Technical error: {other}"),
        }
    }
}

/// What happened to the history record of an identification attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryWrite {
    Saved,
    /// Unmatched attempts are not recorded in this configuration.
    Skipped,
    /// The record could not be persisted; the caller should warn or retry.
    Failed(String),
}

/// Result of an identification request.
#[derive(Debug, Clone)]
pub struct IdentifyOutcome {
    pub result: MatchResult,
    /// Profile of the matched subject, if one is enrolled.
    pub profile: Option<SubjectProfile>,
    pub record: Option<HistoryRecord>,
    pub history: HistoryWrite,
}

impl IdentifyOutcome {
    pub fn outcome(&self) -> MatchOutcome {
        self.result.outcome()
    }

    /// Display name of the best candidate, if any.
    pub fn subject_name(&self) -> Option<&str> {
        let id = self.result.best_candidate_id.as_deref()?;
        Some(match &self.profile {
            Some(profile) => profile.display_name(id),
            None => id,
        })
    }
}

/// Messages sent from handles to the engine thread.
enum EngineRequest {
    Identify {
        probe: PathBuf,
        cancel: CancellationToken,
        progress: Option<mpsc::UnboundedSender<ScanEvent>>,
        reply: oneshot::Sender<Result<IdentifyOutcome, EngineError>>,
    },
    Analyze {
        image: PathBuf,
        labels: Option<Vec<Label>>,
        reply: oneshot::Sender<Result<AnalysisResult, EngineError>>,
    },
    Enroll {
        image: PathBuf,
        base_name: String,
        profile: SubjectProfile,
        reply: oneshot::Sender<Result<PathBuf, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    ledger: Arc<HistoryLedger>,
}

impl EngineHandle {
    /// Shared history ledger. Safe to use concurrently with the engine.
    pub fn ledger(&self) -> &HistoryLedger {
        &self.ledger
    }

    /// Identify the subject in `probe` against the enrolled gallery.
    pub async fn identify(
        &self,
        probe: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<IdentifyOutcome, EngineError> {
        self.identify_with_progress(probe, cancel, None).await
    }

    /// Like [`identify`](Self::identify), streaming per-candidate events to `progress`.
    pub async fn identify_with_progress(
        &self,
        probe: impl Into<PathBuf>,
        cancel: CancellationToken,
        progress: Option<mpsc::UnboundedSender<ScanEvent>>,
    ) -> Result<IdentifyOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify {
                probe: probe.into(),
                cancel,
                progress,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Analyze an image. Uses `labels` when given, otherwise asks the label provider.
    pub async fn analyze(
        &self,
        image: impl Into<PathBuf>,
        labels: Option<Vec<Label>>,
    ) -> Result<AnalysisResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                image: image.into(),
                labels,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Enroll a reference image under `base_name`. Returns the stored image path.
    pub async fn enroll(
        &self,
        image: impl Into<PathBuf>,
        base_name: impl Into<String>,
        profile: SubjectProfile,
    ) -> Result<PathBuf, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                image: image.into(),
                base_name: base_name.into(),
                profile,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

struct Engine {
    matcher: GalleryMatcher<Arc<dyn EmbeddingProvider>>,
    labeler: Arc<dyn LabelProvider>,
    analyzer: ContentAnalyzer,
    gallery: DirectoryGallery,
    ledger: Arc<HistoryLedger>,
    record_unmatched: bool,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Validates the configuration, creates the gallery directories and opens
/// the history ledger before starting, so misconfiguration fails fast.
pub fn spawn_engine(
    config: &Config,
    embedder: Arc<dyn EmbeddingProvider>,
    labeler: Arc<dyn LabelProvider>,
) -> Result<EngineHandle, EngineError> {
    config.validate()?;

    let gallery = config.gallery();
    gallery.ensure_dirs()?;
    tracing::info!(
        images = %gallery.image_dir().display(),
        data = %gallery.data_dir().display(),
        "gallery ready"
    );

    let ledger = Arc::new(config.open_ledger()?);

    let engine = Engine {
        matcher: GalleryMatcher::new(embedder, config.matcher_config()),
        labeler,
        analyzer: ContentAnalyzer::new(config.analyzer_config()),
        gallery,
        ledger: ledger.clone(),
        record_unmatched: config.record_unmatched,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(REQUEST_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("vigil-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Identify {
                        probe,
                        cancel,
                        progress,
                        reply,
                    } => {
                        let result = engine.run_identify(&probe, &cancel, progress);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Analyze {
                        image,
                        labels,
                        reply,
                    } => {
                        let _ = reply.send(engine.run_analyze(&image, labels));
                    }
                    EngineRequest::Enroll {
                        image,
                        base_name,
                        profile,
                        reply,
                    } => {
                        let _ = reply.send(engine.run_enroll(&image, &base_name, profile));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, ledger })
}

impl Engine {
    /// Decode the probe, scan the gallery, then record the attempt.
    fn run_identify(
        &self,
        probe_path: &Path,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<ScanEvent>>,
    ) -> Result<IdentifyOutcome, EngineError> {
        let captured_ref = probe_path.display().to_string();
        let notify = progress.map(|tx| {
            move |event: ScanEvent| {
                let _ = tx.send(event);
            }
        });

        let scanned = {
            let probe = Frame::open(probe_path)?;
            self.matcher.find_best_match(
                &probe,
                &self.gallery,
                cancel,
                notify.as_ref().map(|f| f as &vigil_core::ProgressFn),
            )
        };

        let result = match scanned {
            Ok(result) => result,
            Err(MatchError::NoFaceDetected) => {
                tracing::info!(probe = %captured_ref, "identify: no face in probe");
                if self.record_unmatched {
                    let record = HistoryRecord::new(
                        captured_ref,
                        None,
                        "",
                        SubjectProfile::default(),
                        0.0,
                        MatchStatus::NoFace,
                    );
                    self.write_history(record);
                }
                return Err(MatchError::NoFaceDetected.into());
            }
            Err(e) => return Err(e.into()),
        };

        let profile = match result.best_candidate_id.as_deref() {
            Some(id) => self.lookup_profile(id),
            None => None,
        };

        let record = if result.matched {
            let base_name = result.best_candidate_id.clone().unwrap_or_default();
            Some(HistoryRecord::new(
                captured_ref,
                result.best_source.as_ref().map(|p| p.display().to_string()),
                base_name,
                profile.clone().unwrap_or_default(),
                result.clamped_similarity(),
                MatchStatus::Success,
            ))
        } else if self.record_unmatched {
            Some(HistoryRecord::new(
                captured_ref,
                None,
                "",
                SubjectProfile::default(),
                result.clamped_similarity(),
                MatchStatus::NoMatch,
            ))
        } else {
            None
        };

        let history = match &record {
            Some(record) => self.write_history(record.clone()),
            None => HistoryWrite::Skipped,
        };

        tracing::info!(
            outcome = ?result.outcome(),
            best = ?result.best_candidate_id,
            similarity = result.similarity,
            history = ?history,
            "identify complete"
        );

        Ok(IdentifyOutcome {
            result,
            profile,
            record,
            history,
        })
    }

    fn lookup_profile(&self, base_name: &str) -> Option<SubjectProfile> {
        match self.gallery.profile(base_name) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(base_name, error = %e, "failed to load subject profile");
                None
            }
        }
    }

    fn write_history(&self, record: HistoryRecord) -> HistoryWrite {
        match self.ledger.append(record) {
            Ok(()) => HistoryWrite::Saved,
            Err(e) => {
                tracing::warn!(error = %e, "failed to record identification attempt");
                HistoryWrite::Failed(e.to_string())
            }
        }
    }

    fn run_analyze(&self, path: &Path, labels: Option<Vec<Label>>) -> Result<AnalysisResult, EngineError> {
        let frame = Frame::open(path)?;
        let labels = match labels {
            Some(labels) => labels,
            None => self.labeler.classify(&frame)?,
        };
        Ok(self.analyzer.analyze(&frame, &labels))
    }

    /// Enroll only images the embedding provider can use as references.
    fn run_enroll(&self, path: &Path, base_name: &str, profile: SubjectProfile) -> Result<PathBuf, EngineError> {
        let frame = Frame::open(path)?;
        self.matcher.embed_probe(&frame)?;
        Ok(self.gallery.enroll(base_name, &frame, profile)?)
    }
}
