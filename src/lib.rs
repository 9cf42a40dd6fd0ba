//! Parallel bulk database bootstrapper for a blockchain mirror-node.
//!
//! The import engine: a worker pool that consumes a manifest of gzip-
//! compressed CSV shards and, for each file, runs a single-pass
//! decompress + hash + stream-COPY pipeline under a transaction, with
//! durable per-file status tracking that survives crashes and signals.

pub mod buffers;
pub mod config;
pub mod error;
pub mod importer;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod tracker;
pub mod worker;

pub use error::{FatalError, ImportError};
