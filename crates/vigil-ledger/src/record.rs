use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Local, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use vigil_core::SubjectProfile;

/// Upper bound (exclusive) for the random starting point of the id sequence.
const SEQ_SEED_RANGE: u64 = 1000;

/// Outcome of one identification attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Success,
    NoMatch,
    NoFace,
    Error,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Success => "success",
            MatchStatus::NoMatch => "no_match",
            MatchStatus::NoFace => "no_face",
            MatchStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One audit entry. Serialized with the camelCase keys of the on-disk schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default)]
    pub captured_image_ref: String,
    #[serde(default)]
    pub matched_image_ref: Option<String>,
    #[serde(default)]
    pub matched_base_name: String,
    /// Copy of the subject profile at the time of the match.
    #[serde(default, rename = "matchedDataSnapshot")]
    pub matched_data: SubjectProfile,
    pub similarity_score: f64,
    pub timestamp_millis: i64,
    #[serde(default)]
    pub status: MatchStatus,
}

impl HistoryRecord {
    /// New record stamped with the current time and a fresh id.
    pub fn new(
        captured_image_ref: impl Into<String>,
        matched_image_ref: Option<String>,
        matched_base_name: impl Into<String>,
        matched_data: SubjectProfile,
        similarity_score: f64,
        status: MatchStatus,
    ) -> Self {
        let timestamp_millis = Utc::now().timestamp_millis();
        Self {
            id: next_record_id(timestamp_millis),
            captured_image_ref: captured_image_ref.into(),
            matched_image_ref,
            matched_base_name: matched_base_name.into(),
            matched_data,
            similarity_score,
            timestamp_millis,
            status,
        }
    }

    /// Profile name, falling back to the matched base name.
    pub fn display_name(&self) -> &str {
        self.matched_data.display_name(&self.matched_base_name)
    }

    pub fn subject_id(&self) -> &str {
        self.matched_data.id.as_deref().unwrap_or("")
    }

    pub fn department(&self) -> &str {
        self.matched_data.department.as_deref().unwrap_or("")
    }

    pub fn datetime(&self) -> Option<DateTime<Local>> {
        Local.timestamp_millis_opt(self.timestamp_millis).single()
    }

    /// e.g. "Mar 01, 2024 09:30"
    pub fn formatted_date(&self) -> String {
        self.datetime()
            .map(|dt| dt.format("%b %d, %Y %H:%M").to_string())
            .unwrap_or_default()
    }

    /// e.g. "09:30:12"
    pub fn formatted_time(&self) -> String {
        self.datetime()
            .map(|dt| dt.format("%H:%M:%S").to_string())
            .unwrap_or_default()
    }

    /// Score as a percentage with one decimal, e.g. "91.3%".
    pub fn formatted_similarity(&self) -> String {
        format!("{:.1}%", self.similarity_score * 100.0)
    }

    /// True when the query is a case-insensitive substring of the base name,
    /// display name, subject id or department.
    pub(crate) fn matches_query(&self, lowered_query: &str) -> bool {
        [
            self.matched_base_name.as_str(),
            self.display_name(),
            self.subject_id(),
            self.department(),
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(lowered_query))
    }
}

/// `HIST_<millis>_<seq>`; `seq` is process-wide and strictly increasing, so
/// ids stay unique and ordered within one millisecond.
pub fn next_record_id(timestamp_millis: i64) -> String {
    static SEQ: OnceLock<AtomicU64> = OnceLock::new();
    let seq = SEQ
        .get_or_init(|| AtomicU64::new(rand::thread_rng().gen_range(0..SEQ_SEED_RANGE)))
        .fetch_add(1, Ordering::Relaxed);
    format!("HIST_{timestamp_millis}_{seq}")
}
