//! Error taxonomy for the bootstrap importer.
//!
//! Two enums, matching the two severities the orchestrator cares about:
//! [`ImportError`] is file-level (captured on a `Result`, never panics the
//! process) and [`FatalError`] short-circuits the run before the worker
//! pool even starts.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Outcome of attempting to import a single file. Every variant maps to
/// exactly one tracker status; see `tracker::Status`.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: i64, actual: i64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("failed to acquire a database connection: {0}")]
    ConnectionAcquire(#[source] deadpool_postgres::PoolError),

    #[error("database error: {0}")]
    Database(#[source] tokio_postgres::Error),

    #[error("no timestamp column found for table {table}")]
    MissingTimestampColumn { table: String },

    #[error("cannot parse partition date range from {0}")]
    UnparseablePartitionRange(String),

    #[error("io error: {0}")]
    Io(#[source] io::Error),

    /// Mid-file cancellation. Never a terminal tracker state: the entry
    /// stays `IN_PROGRESS` and the next run's resumption cleanup resets it.
    #[error("import cancelled")]
    Cancelled,
}

impl ImportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImportError::Cancelled)
    }

    /// Whether this outcome should be recorded as `FAILED_VALIDATION`
    /// (as opposed to `FAILED_TO_IMPORT`).
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            ImportError::SizeMismatch { .. } | ImportError::HashMismatch { .. }
        )
    }
}

impl From<io::Error> for ImportError {
    fn from(err: io::Error) -> Self {
        ImportError::Io(err)
    }
}

impl From<tokio_postgres::Error> for ImportError {
    fn from(err: tokio_postgres::Error) -> Self {
        ImportError::Database(err)
    }
}

impl From<deadpool_postgres::PoolError> for ImportError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        ImportError::ConnectionAcquire(err)
    }
}

/// Process-fatal conditions. These are checked before the pool starts and
/// short-circuit the run; none of them are per-file.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("failed to read tracking file: {0}")]
    TrackerIo(#[source] io::Error),

    #[error("failed to parse tracking file: {0}")]
    TrackerParse(#[source] serde_json::Error),

    #[error(
        "database not initialized: {0} does not exist; run `init` first"
    )]
    InitNotCompleted(PathBuf),

    #[error("another instance is already running (pid {0} is alive); remove the pid file if this is stale")]
    AnotherInstanceRunning(i32),

    #[error("database error: {0}")]
    Database(#[source] tokio_postgres::Error),

    #[error("pool build error: {0}")]
    PoolBuild(#[source] deadpool_postgres::CreatePoolError),

    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FatalError {
    fn from(err: io::Error) -> Self {
        FatalError::Io(err)
    }
}

impl From<tokio_postgres::Error> for FatalError {
    fn from(err: tokio_postgres::Error) -> Self {
        FatalError::Database(err)
    }
}

impl From<deadpool_postgres::CreatePoolError> for FatalError {
    fn from(err: deadpool_postgres::CreatePoolError) -> Self {
        FatalError::PoolBuild(err)
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;
