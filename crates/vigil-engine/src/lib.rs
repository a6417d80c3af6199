//! vigil-engine — Explicit configuration and the identification worker.
//!
//! [`spawn_engine`] moves matching, analysis and enrollment onto a
//! dedicated OS thread; callers talk to it through the async
//! [`EngineHandle`].

pub mod config;
pub mod engine;

pub use config::{Config, ConfigError, LedgerBackend};
pub use engine::{spawn_engine, EngineError, EngineHandle, HistoryWrite, IdentifyOutcome};
