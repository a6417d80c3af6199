//! Snapshot persistence backends.
//!
//! A store holds one opaque text blob per namespace. Saves replace the
//! whole blob atomically: after a failed save the previous blob is still
//! what `load` returns. [`SnapshotStore::update`] is the read-modify-write
//! primitive; file and SQLite stores serialize it across processes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::fs_std::FileExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Namespace the history snapshot is stored under.
pub const NAMESPACE: &str = "vigil.history";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    namespace  TEXT PRIMARY KEY,
    blob       TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// How long a SQLite writer waits for another connection's transaction.
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Edit step for [`SnapshotStore::update`]: gets the current blob, returns
/// the replacement or `None` to leave the store as it is.
pub type UpdateFn<'a> = dyn FnMut(Option<String>) -> Option<String> + 'a;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait SnapshotStore: Send {
    /// Current blob, or `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<String>, StoreError>;
    /// Replace the blob atomically.
    fn save(&mut self, blob: &str) -> Result<(), StoreError>;
    fn clear(&mut self) -> Result<(), StoreError>;

    /// Load, edit and save with no other writer in between.
    ///
    /// The default is only exclusive within the owning ledger; stores that
    /// can be shared between processes override it.
    fn update(&mut self, edit: &mut UpdateFn<'_>) -> Result<(), StoreError> {
        let current = self.load()?;
        if let Some(blob) = edit(current) {
            self.save(&blob)?;
        }
        Ok(())
    }
}

impl<T: SnapshotStore + ?Sized> SnapshotStore for Box<T> {
    fn load(&self) -> Result<Option<String>, StoreError> {
        (**self).load()
    }

    fn save(&mut self, blob: &str) -> Result<(), StoreError> {
        (**self).save(blob)
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        (**self).clear()
    }

    fn update(&mut self, edit: &mut UpdateFn<'_>) -> Result<(), StoreError> {
        (**self).update(edit)
    }
}

/// JSON file written via temp file + fsync + rename.
///
/// Writers take an exclusive advisory lock on `<file>.lock` next to the
/// snapshot, so ledgers in different processes never interleave their
/// read-modify-write cycles. Readers don't lock; the rename is atomic.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    }

    pub fn lock_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| NAMESPACE.to_string());
        self.path.with_file_name(format!("{name}.lock"))
    }

    /// Block until this process holds the writer lock. Released when the
    /// returned file is dropped.
    fn acquire_writer_lock(&self) -> Result<File, StoreError> {
        fs::create_dir_all(self.dir()).map_err(|e| self.io_err(e))?;
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StoreError::Io {
                path: lock_path.clone(),
                source,
            })?;
        FileExt::lock_exclusive(&file).map_err(|source| StoreError::Io {
            path: lock_path,
            source,
        })?;
        Ok(file)
    }

    /// Write to a uniquely named sibling, fsync, then rename over the target.
    /// The temp file is removed if any step fails.
    fn write_atomic(&self, blob: &str) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(|e| self.io_err(e))?;
        tmp.write_all(blob.as_bytes()).map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;

        tracing::debug!(path = %self.path.display(), bytes = blob.len(), "snapshot saved");
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn save(&mut self, blob: &str) -> Result<(), StoreError> {
        let _lock = self.acquire_writer_lock()?;
        self.write_atomic(blob)
    }

    fn update(&mut self, edit: &mut UpdateFn<'_>) -> Result<(), StoreError> {
        let _lock = self.acquire_writer_lock()?;
        let current = self.load()?;
        if let Some(blob) = edit(current) {
            self.write_atomic(&blob)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        let _lock = self.acquire_writer_lock()?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

/// SQLite-backed store, one row per namespace.
pub struct SqliteStore {
    conn: Connection,
    namespace: String,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            namespace: NAMESPACE.to_string(),
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

fn select_blob(conn: &Connection, namespace: &str) -> Result<Option<String>, StoreError> {
    let blob = conn
        .query_row(
            "SELECT blob FROM snapshots WHERE namespace = ?1",
            params![namespace],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(blob)
}

fn upsert_blob(conn: &Connection, namespace: &str, blob: &str) -> Result<(), StoreError> {
    let now = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO snapshots (namespace, blob, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(namespace) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
        params![namespace, blob, now],
    )?;
    Ok(())
}

impl SnapshotStore for SqliteStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        select_blob(&self.conn, &self.namespace)
    }

    fn save(&mut self, blob: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        upsert_blob(&tx, &self.namespace, blob)?;
        tx.commit()?;
        Ok(())
    }

    /// `BEGIN IMMEDIATE` takes the write lock before the read, so two
    /// connections can't both read the same snapshot and overwrite each other.
    fn update(&mut self, edit: &mut UpdateFn<'_>) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = select_blob(&tx, &self.namespace)?;
        if let Some(blob) = edit(current) {
            upsert_blob(&tx, &self.namespace, &blob)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM snapshots WHERE namespace = ?1",
            params![self.namespace],
        )?;
        Ok(())
    }
}

/// In-process store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blob: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self.blob.clone())
    }

    fn save(&mut self, blob: &str) -> Result<(), StoreError> {
        self.blob = Some(blob.to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.blob = None;
        Ok(())
    }
}
