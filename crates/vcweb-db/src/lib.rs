//! `PostgreSQL` archive for vcweb experiments.
//!
//! Running experiments live in memory. This crate keeps what outlives the
//! process: archived experiments and the signals they raised.
//!
//! ```text
//! Experiment
//!     |
//!     +-- archive_record() --> ArchiveStore   (experiment_archives, JSONB)
//!     |
//!     +-- SignalBus channel --> SignalLogStore (experiment_signals)
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- Connection pool, configuration and migrations
//! - [`archive_store`] -- Save, load, list and delete experiment archives
//! - [`signal_log`] -- Append and read back emitted signals
//! - [`error`] -- Shared error types

pub mod archive_store;
pub mod error;
pub mod postgres;
pub mod signal_log;

pub use archive_store::{ArchiveRow, ArchiveStore};
pub use error::DbError;
pub use postgres::{PostgresConfig, PostgresPool};
pub use signal_log::{SignalLogStore, SignalRow};
