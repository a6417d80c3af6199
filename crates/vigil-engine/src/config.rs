use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_core::{AnalyzerConfig, DirectoryGallery, MatcherConfig};
use vigil_ledger::{HistoryLedger, JsonFileStore, LedgerConfig, LedgerError, SqliteStore};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the history snapshot lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Json,
    Sqlite,
}

impl FromStr for LedgerBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LedgerBackend::Json),
            "sqlite" => Ok(LedgerBackend::Sqlite),
            other => Err(ConfigError::Invalid(format!("unknown ledger backend {other:?}"))),
        }
    }
}

/// Engine configuration: TOML file, then `VIGIL_*` overrides, then defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enrolled reference images (`<base>.jpg`).
    pub image_dir: PathBuf,
    /// Subject profiles (`<base>.json`).
    pub data_dir: PathBuf,
    /// History snapshot file (JSON file or SQLite database).
    pub ledger_path: PathBuf,
    pub ledger_backend: LedgerBackend,
    /// Maximum number of history records kept.
    pub history_capacity: usize,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f64,
    /// Shards per gallery scan (1 = sequential).
    pub scan_workers: usize,
    pub brightness_stride: u32,
    pub color_stride: u32,
    /// Also record attempts that did not produce a match.
    pub record_unmatched: bool,
}

impl Default for Config {
    fn default() -> Self {
        let root = default_data_root();
        let matcher = MatcherConfig::default();
        let analyzer = AnalyzerConfig::default();
        Self {
            image_dir: root.join("ReferenceImages"),
            data_dir: root.join("ReferenceData"),
            ledger_path: root.join("history.json"),
            ledger_backend: LedgerBackend::default(),
            history_capacity: LedgerConfig::default().capacity,
            similarity_threshold: matcher.threshold,
            scan_workers: matcher.workers,
            brightness_stride: analyzer.brightness_stride,
            color_stride: analyzer.color_stride,
            record_unmatched: true,
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `VIGIL_CONFIG`), apply `VIGIL_*`
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("VIGIL_CONFIG").map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from `VIGIL_*` environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Apply overrides from a `VIGIL_*` key lookup. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("VIGIL_IMAGE_DIR") {
            self.image_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIGIL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIGIL_LEDGER_PATH") {
            self.ledger_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "VIGIL_LEDGER_BACKEND", &mut self.ledger_backend);
        override_parsed(&lookup, "VIGIL_HISTORY_CAPACITY", &mut self.history_capacity);
        override_parsed(&lookup, "VIGIL_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        override_parsed(&lookup, "VIGIL_SCAN_WORKERS", &mut self.scan_workers);
        override_parsed(&lookup, "VIGIL_BRIGHTNESS_STRIDE", &mut self.brightness_stride);
        override_parsed(&lookup, "VIGIL_COLOR_STRIDE", &mut self.color_stride);
        if let Some(v) = lookup("VIGIL_RECORD_UNMATCHED") {
            self.record_unmatched = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} is outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be at least 1".into()));
        }
        if self.scan_workers == 0 {
            return Err(ConfigError::Invalid("scan_workers must be at least 1".into()));
        }
        if self.brightness_stride == 0 || self.color_stride == 0 {
            return Err(ConfigError::Invalid("sampling strides must be at least 1".into()));
        }
        Ok(())
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            threshold: self.similarity_threshold,
            workers: self.scan_workers,
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            brightness_stride: self.brightness_stride,
            color_stride: self.color_stride,
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            capacity: self.history_capacity,
        }
    }

    pub fn gallery(&self) -> DirectoryGallery {
        DirectoryGallery::new(&self.image_dir, &self.data_dir)
    }

    /// Open the history ledger on the configured backend.
    pub fn open_ledger(&self) -> Result<HistoryLedger, LedgerError> {
        let ledger = match self.ledger_backend {
            LedgerBackend::Json => {
                HistoryLedger::new(JsonFileStore::new(&self.ledger_path), self.ledger_config())
            }
            LedgerBackend::Sqlite => {
                HistoryLedger::new(SqliteStore::open(&self.ledger_path)?, self.ledger_config())
            }
        };
        tracing::info!(
            backend = ?self.ledger_backend,
            path = %self.ledger_path.display(),
            capacity = self.history_capacity,
            "history ledger opened"
        );
        Ok(ledger)
    }
}

/// `$XDG_DATA_HOME/vigil`, falling back to `~/.local/share/vigil`.
fn default_data_root() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.similarity_threshold, 0.85);
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.scan_workers, 1);
        assert_eq!(config.brightness_stride, 10);
        assert_eq!(config.color_stride, 20);
        assert_eq!(config.ledger_backend, LedgerBackend::Json);
        assert!(config.record_unmatched);
        assert!(config.image_dir.ends_with("vigil/ReferenceImages"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("VIGIL_IMAGE_DIR", "/srv/gallery"),
            ("VIGIL_LEDGER_BACKEND", "SQLite"),
            ("VIGIL_SIMILARITY_THRESHOLD", "0.6"),
            ("VIGIL_SCAN_WORKERS", "4"),
            ("VIGIL_RECORD_UNMATCHED", "0"),
            ("VIGIL_HISTORY_CAPACITY", "not-a-number"),
        ]));
        assert_eq!(config.image_dir, PathBuf::from("/srv/gallery"));
        assert_eq!(config.ledger_backend, LedgerBackend::Sqlite);
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.scan_workers, 4);
        assert!(!config.record_unmatched);
        assert_eq!(config.history_capacity, 100);
    }

    #[test]
    fn test_toml_file_with_partial_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(
            &path,
            "similarity_threshold = 0.7\nledger_backend = \"sqlite\"\nledger_path = \"/var/lib/vigil/history.db\"\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.ledger_backend, LedgerBackend::Sqlite);
        assert_eq!(config.ledger_path, PathBuf::from("/var/lib/vigil/history.db"));
        assert_eq!(config.history_capacity, 100);
    }

    #[test]
    fn test_bad_toml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "similarity_threshold = \"high\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cases: Vec<Box<dyn Fn(&mut Config)>> = vec![
            Box::new(|c| c.similarity_threshold = 1.5),
            Box::new(|c| c.history_capacity = 0),
            Box::new(|c| c.scan_workers = 0),
            Box::new(|c| c.color_stride = 0),
        ];
        for mutate in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_open_ledger_backends() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            ledger_path: dir.path().join("history.db"),
            ledger_backend: LedgerBackend::Sqlite,
            ..Config::default()
        };
        assert_eq!(config.open_ledger().unwrap().count().unwrap(), 0);
        config.ledger_backend = LedgerBackend::Json;
        config.ledger_path = dir.path().join("history.json");
        assert_eq!(config.open_ledger().unwrap().config().capacity, 100);
    }
}
