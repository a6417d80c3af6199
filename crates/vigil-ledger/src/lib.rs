//! vigil-ledger — Bounded history of identification attempts.
//!
//! Records are kept newest first in a single serialized snapshot. Every
//! mutation rewrites the whole snapshot under one lock, so concurrent
//! appends and deletes never overwrite each other.

pub mod ledger;
pub mod record;
pub mod store;

pub use ledger::{HistoryLedger, LedgerConfig, LedgerError, LedgerStats};
pub use record::{HistoryRecord, MatchStatus};
pub use store::{JsonFileStore, MemoryStore, SnapshotStore, SqliteStore, StoreError, UpdateFn, NAMESPACE};
