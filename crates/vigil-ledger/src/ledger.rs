use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::record::HistoryRecord;
use crate::store::{SnapshotStore, StoreError};

const DEFAULT_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("history persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("history snapshot is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error("failed to encode history: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Maximum number of records retained; the oldest are evicted first.
    pub capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Aggregate similarity statistics. All zero for an empty ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerStats {
    pub count: usize,
    pub avg_similarity: f64,
    pub max_similarity: f64,
    pub min_similarity: f64,
}

/// Bounded, newest-first history of match outcomes.
///
/// Every mutation runs as one [`SnapshotStore::update`] under the ledger's
/// mutex, and file or SQLite stores also exclude other processes for that
/// cycle. A failed save leaves the previous snapshot in place and returns
/// the error; nothing is silently dropped.
pub struct HistoryLedger {
    store: Mutex<Box<dyn SnapshotStore>>,
    config: LedgerConfig,
}

impl HistoryLedger {
    pub fn new(store: impl SnapshotStore + 'static, config: LedgerConfig) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn SnapshotStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read-modify-write of the whole record list. `edit` returns `false`
    /// to leave the snapshot unwritten; the result is the saved list, if any.
    fn modify(
        &self,
        edit: impl FnOnce(&mut Vec<HistoryRecord>) -> bool,
    ) -> Result<Option<Vec<HistoryRecord>>, LedgerError> {
        let mut store = self.lock();
        let mut edit = Some(edit);
        let mut failure = None;
        let mut saved = None;
        store.update(&mut |blob| {
            let edit = edit.take()?;
            let mut records = match decode_records(blob) {
                Ok(records) => records,
                Err(e) => {
                    failure = Some(e);
                    return None;
                }
            };
            if !edit(&mut records) {
                return None;
            }
            match serde_json::to_string(&records) {
                Ok(encoded) => {
                    saved = Some(records);
                    Some(encoded)
                }
                Err(e) => {
                    failure = Some(LedgerError::Encode(e));
                    None
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    /// Insert at the front and evict beyond capacity.
    pub fn append(&self, record: HistoryRecord) -> Result<(), LedgerError> {
        let id = record.id.clone();
        let capacity = self.config.capacity;
        let mut evicted = 0;
        let saved = self.modify(|records| {
            records.insert(0, record);
            evicted = records.len().saturating_sub(capacity);
            records.truncate(capacity);
            true
        })?;
        let count = saved.map_or(0, |records| records.len());
        tracing::info!(%id, count, evicted, "history record added");
        Ok(())
    }

    /// All records, newest first.
    pub fn list(&self) -> Result<Vec<HistoryRecord>, LedgerError> {
        let blob = self.lock().load()?;
        decode_records(blob)
    }

    pub fn get(&self, id: &str) -> Result<Option<HistoryRecord>, LedgerError> {
        Ok(self.list()?.into_iter().find(|r| r.id == id))
    }

    pub fn count(&self) -> Result<usize, LedgerError> {
        Ok(self.list()?.len())
    }

    /// Remove one record. `Ok(false)` when the id is unknown; nothing is written then.
    pub fn delete(&self, id: &str) -> Result<bool, LedgerError> {
        let saved = self.modify(|records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            records.len() != before
        })?;
        if saved.is_none() {
            tracing::debug!(%id, "history record not found");
            return Ok(false);
        }
        tracing::info!(%id, "history record deleted");
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), LedgerError> {
        self.lock().clear()?;
        tracing::info!("history cleared");
        Ok(())
    }

    pub fn statistics(&self) -> Result<LedgerStats, LedgerError> {
        let records = self.list()?;
        if records.is_empty() {
            return Ok(LedgerStats::default());
        }

        let mut total = 0.0;
        let mut max = f64::MIN;
        let mut min = f64::MAX;
        for record in &records {
            let score = record.similarity_score;
            total += score;
            max = max.max(score);
            min = min.min(score);
        }
        Ok(LedgerStats {
            count: records.len(),
            avg_similarity: total / records.len() as f64,
            max_similarity: max,
            min_similarity: min,
        })
    }

    /// Case-insensitive substring search; a blank query returns everything.
    pub fn search(&self, query: &str) -> Result<Vec<HistoryRecord>, LedgerError> {
        let records = self.list()?;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(records);
        }
        Ok(records.into_iter().filter(|r| r.matches_query(&query)).collect())
    }

    /// Records with `start <= timestamp <= end`.
    pub fn by_date_range(&self, start_millis: i64, end_millis: i64) -> Result<Vec<HistoryRecord>, LedgerError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| (start_millis..=end_millis).contains(&r.timestamp_millis))
            .collect())
    }

    pub fn by_similarity_floor(&self, min_score: f64) -> Result<Vec<HistoryRecord>, LedgerError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.similarity_score >= min_score)
            .collect())
    }
}

/// Decode the snapshot. An unparseable blob is an error; individual
/// malformed entries are skipped.
fn decode_records(blob: Option<String>) -> Result<Vec<HistoryRecord>, LedgerError> {
    let Some(blob) = blob else {
        return Ok(Vec::new());
    };
    if blob.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<serde_json::Value> = serde_json::from_str(&blob).map_err(LedgerError::Corrupt)?;
    let mut records = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<HistoryRecord>(value) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(index, error = %e, "skipping malformed history record"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MatchStatus;
    use crate::store::{JsonFileStore, MemoryStore, SqliteStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use vigil_core::SubjectProfile;

    fn record(base: &str, score: f64, timestamp_millis: i64) -> HistoryRecord {
        let mut r = HistoryRecord::new(
            format!("/captures/{base}.jpg"),
            Some(format!("/gallery/{base}.jpg")),
            base,
            SubjectProfile::default(),
            score,
            MatchStatus::Success,
        );
        r.timestamp_millis = timestamp_millis;
        r
    }

    fn memory_ledger(capacity: usize) -> HistoryLedger {
        HistoryLedger::new(MemoryStore::new(), LedgerConfig { capacity })
    }

    /// Memory store whose saves can be made to fail.
    struct FlakyStore {
        inner: MemoryStore,
        fail: Arc<AtomicBool>,
    }

    impl SnapshotStore for FlakyStore {
        fn load(&self) -> Result<Option<String>, StoreError> {
            self.inner.load()
        }

        fn save(&mut self, blob: &str) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.save(blob)
        }

        fn clear(&mut self) -> Result<(), StoreError> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_append_is_newest_first() {
        let ledger = memory_ledger(10);
        ledger.append(record("first", 0.5, 1)).unwrap();
        ledger.append(record("second", 0.6, 2)).unwrap();
        let names: Vec<String> = ledger.list().unwrap().into_iter().map(|r| r.matched_base_name).collect();
        assert_eq!(names, vec!["second", "first"]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let ledger = memory_ledger(DEFAULT_CAPACITY);
        let mut ids = Vec::new();
        for i in 0..101 {
            let r = record(&format!("s{i}"), 0.5, i);
            ids.push(r.id.clone());
            ledger.append(r).unwrap();
        }
        let records = ledger.list().unwrap();
        assert_eq!(records.len(), 100);
        assert_eq!(records[0].id, ids[100]);
        assert!(records.iter().all(|r| r.id != ids[0]));
        assert_eq!(records[99].id, ids[1]);
    }

    #[test]
    fn test_statistics() {
        let ledger = memory_ledger(10);
        assert_eq!(ledger.statistics().unwrap(), LedgerStats::default());

        for (i, score) in [0.9, 0.7, 0.8].into_iter().enumerate() {
            ledger.append(record("s", score, i as i64)).unwrap();
        }
        let stats = ledger.statistics().unwrap();
        assert_eq!(stats.count, 3);
        assert!((stats.avg_similarity - 0.8).abs() < 1e-9);
        assert_eq!(stats.max_similarity, 0.9);
        assert_eq!(stats.min_similarity, 0.7);
    }

    #[test]
    fn test_statistics_unsorted_scores() {
        let ledger = memory_ledger(10);
        for (i, score) in [0.9, 0.5, 0.7].into_iter().enumerate() {
            ledger.append(record("s", score, i as i64)).unwrap();
        }
        let stats = ledger.statistics().unwrap();
        assert_eq!(stats.count, 3);
        assert!((stats.avg_similarity - 0.7).abs() < 1e-9);
        assert_eq!(stats.max_similarity, 0.9);
        assert_eq!(stats.min_similarity, 0.5);
    }

    #[test]
    fn test_delete_and_get() {
        let ledger = memory_ledger(10);
        let r = record("gone", 0.5, 1);
        let id = r.id.clone();
        ledger.append(r).unwrap();
        ledger.append(record("kept", 0.5, 2)).unwrap();

        assert!(ledger.get(&id).unwrap().is_some());
        assert!(ledger.delete(&id).unwrap());
        assert!(ledger.get(&id).unwrap().is_none());
        assert!(!ledger.delete(&id).unwrap());
        assert_eq!(ledger.count().unwrap(), 1);

        ledger.clear().unwrap();
        assert_eq!(ledger.count().unwrap(), 0);
    }

    #[test]
    fn test_search() {
        let ledger = memory_ledger(10);
        let mut profile = SubjectProfile::named("Ada Lovelace");
        profile.id = Some("S-1815".into());
        profile.department = Some("Mathematics".into());
        let mut ada = record("ada_ref", 0.9, 1);
        ada.matched_data = profile;
        ledger.append(ada).unwrap();
        ledger.append(record("bob_ref", 0.8, 2)).unwrap();

        assert_eq!(ledger.search("LOVELACE").unwrap().len(), 1);
        assert_eq!(ledger.search("s-18").unwrap().len(), 1);
        assert_eq!(ledger.search("math").unwrap().len(), 1);
        assert_eq!(ledger.search("bob").unwrap().len(), 1);
        assert_eq!(ledger.search("_ref").unwrap().len(), 2);
        assert_eq!(ledger.search("   ").unwrap().len(), 2);
        assert!(ledger.search("zzz").unwrap().is_empty());
    }

    #[test]
    fn test_date_range_and_similarity_floor() {
        let ledger = memory_ledger(10);
        for (ts, score) in [(100, 0.2), (200, 0.85), (300, 0.9)] {
            ledger.append(record("s", score, ts)).unwrap();
        }
        assert_eq!(ledger.by_date_range(100, 200).unwrap().len(), 2);
        assert_eq!(ledger.by_date_range(201, 299).unwrap().len(), 0);
        assert_eq!(ledger.by_date_range(300, 300).unwrap().len(), 1);
        assert_eq!(ledger.by_similarity_floor(0.85).unwrap().len(), 2);
        assert_eq!(ledger.by_similarity_floor(0.0).unwrap().len(), 3);
    }

    #[test]
    fn test_failed_write_preserves_state() {
        let fail = Arc::new(AtomicBool::new(false));
        let ledger = HistoryLedger::new(
            FlakyStore {
                inner: MemoryStore::new(),
                fail: fail.clone(),
            },
            LedgerConfig::default(),
        );
        let kept = record("kept", 0.5, 1);
        let kept_id = kept.id.clone();
        ledger.append(kept).unwrap();

        fail.store(true, Ordering::SeqCst);
        let err = ledger.append(record("lost", 0.6, 2)).unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert!(ledger.delete(&kept_id).is_err());

        fail.store(false, Ordering::SeqCst);
        let records = ledger.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, kept_id);
    }

    #[test]
    fn test_corrupt_snapshot_refuses_mutation() {
        let mut store = MemoryStore::new();
        store.save("{not json").unwrap();
        let ledger = HistoryLedger::new(store, LedgerConfig::default());
        assert!(matches!(ledger.list(), Err(LedgerError::Corrupt(_))));
        assert!(matches!(ledger.append(record("x", 0.5, 1)), Err(LedgerError::Corrupt(_))));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let good = serde_json::to_value(record("good", 0.7, 5)).unwrap();
        let blob = serde_json::json!([{"id": 12}, good, "junk"]).to_string();
        let mut store = MemoryStore::new();
        store.save(&blob).unwrap();
        let ledger = HistoryLedger::new(store, LedgerConfig::default());
        let records = ledger.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].matched_base_name, "good");
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let ledger = Arc::new(memory_ledger(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        ledger.append(record(&format!("t{t}_{i}"), 0.5, i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.count().unwrap(), 200);
    }

    /// Several ledgers over one backing file, as with concurrent CLI runs.
    fn append_from_separate_ledgers(open: impl Fn() -> HistoryLedger + Sync) {
        std::thread::scope(|scope| {
            for t in 0..4 {
                let open = &open;
                scope.spawn(move || {
                    let ledger = open();
                    for i in 0..50 {
                        ledger.append(record(&format!("t{t}_{i}"), 0.5, i)).unwrap();
                    }
                });
            }
        });
        let records = open().list().unwrap();
        assert_eq!(records.len(), 200);
        let ids: std::collections::HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_separate_json_ledgers_do_not_lose_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        append_from_separate_ledgers(|| {
            HistoryLedger::new(JsonFileStore::new(&path), LedgerConfig { capacity: 1000 })
        });
    }

    #[test]
    fn test_separate_sqlite_ledgers_do_not_lose_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        SqliteStore::open(&path).unwrap();
        append_from_separate_ledgers(|| {
            HistoryLedger::new(SqliteStore::open(&path).unwrap(), LedgerConfig { capacity: 1000 })
        });
    }

    #[test]
    fn test_scores_persist_bit_exact() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let ledger = HistoryLedger::new(JsonFileStore::new(&path), LedgerConfig { capacity: 300 });
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut scores: Vec<f64> = (0..298).map(|_| rng.gen::<f64>()).collect();
        scores.extend([0.1 + 0.2, f64::MIN_POSITIVE]);
        for (i, &score) in scores.iter().enumerate() {
            ledger.append(record("s", score, i as i64)).unwrap();
        }

        let reopened = HistoryLedger::new(JsonFileStore::new(&path), LedgerConfig { capacity: 300 });
        let stored: Vec<u64> = reopened
            .list()
            .unwrap()
            .iter()
            .rev()
            .map(|r| r.similarity_score.to_bits())
            .collect();
        let expected: Vec<u64> = scores.iter().map(|s| s.to_bits()).collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_file_and_sqlite_backends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("history.json");
        let db_path = dir.path().join("history.db");

        let r = record("persisted", 0.75, 42);
        {
            let json = HistoryLedger::new(JsonFileStore::new(&json_path), LedgerConfig::default());
            json.append(r.clone()).unwrap();
            let sqlite = HistoryLedger::new(SqliteStore::open(&db_path).unwrap(), LedgerConfig::default());
            sqlite.append(r.clone()).unwrap();
        }

        let json = HistoryLedger::new(JsonFileStore::new(&json_path), LedgerConfig::default());
        let sqlite = HistoryLedger::new(SqliteStore::open(&db_path).unwrap(), LedgerConfig::default());
        assert_eq!(json.list().unwrap(), vec![r.clone()]);
        assert_eq!(sqlite.list().unwrap(), vec![r]);
    }
}
