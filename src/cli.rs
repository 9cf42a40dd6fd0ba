//! Command-line surface: `init`, `import`, `status`, `watch`. Only
//! `import` and `status` are implemented end to end here; `init` and
//! `watch` are out of scope (the schema/role bootstrap shell script and
//! the live terminal UI live outside the import engine) and exit with a
//! clear pointer to the collaborator that owns them.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "mirrornode-bootstrap",
    about = "Mirror Node database bootstrap tool",
    long_about = "High-performance tool for bootstrapping mirror-node databases with parallel imports."
)]
pub struct Cli {
    /// Path to a bootstrap.env config file, layered under the real
    /// process environment.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize database with schema and roles (out of scope here).
    Init {
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        #[arg(short, long)]
        schema: Option<PathBuf>,
    },

    /// Import the manifest's data files into the database.
    Import {
        /// Directory containing the gzipped CSV shards.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Path to the manifest CSV (filename,row_count,file_size,blake3_hash).
        #[arg(short, long)]
        manifest: Option<PathBuf>,
        /// Number of concurrent worker tasks.
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Print a summary of per-file import status from the tracking file.
    Status,

    /// Watch live import progress (out of scope here).
    Watch {
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
}
