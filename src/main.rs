//! Thin CLI entry point: argument parsing, env-file/env layering, signal
//! wiring, and dispatch into the library's `orchestrator`/`tracker`
//! modules. No import logic lives here.

mod cli;
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mirrornode_bootstrap::config::Config;
use mirrornode_bootstrap::orchestrator::{self, ImportOptions};
use mirrornode_bootstrap::tracker::{Status, Tracker};

use cli::{Cli, Command};

fn main() {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_env_file(path).unwrap_or_else(|e| {
            eprintln!("failed to load config file {}: {e}", path.display());
            std::process::exit(1);
        }),
        None => Config::default(),
    };
    cfg.load_from_env();

    let rt = tokio::runtime::Runtime::new().expect("failed to start async runtime");
    let exit_code = rt.block_on(run(cli.command, cfg));
    std::process::exit(exit_code);
}

/// Sibling `bootstrap-logs/` directory of the running executable, matching
/// the Go binary's `filepath.Join(filepath.Dir(exePath), "bootstrap-logs")`.
fn logs_dir() -> PathBuf {
    let exe = std::env::current_exe().expect("failed to resolve executable path");
    exe.parent()
        .expect("executable has no parent directory")
        .join("bootstrap-logs")
}

async fn run(command: Command, mut cfg: Config) -> i32 {
    match command {
        Command::Import { data_dir, manifest, jobs } => run_import(&mut cfg, data_dir, manifest, jobs).await,
        Command::Status => run_status(&cfg),
        Command::Init { .. } => {
            logging::init_stderr_only(cfg.debug_mode);
            error!(
                "`init` is not implemented by this build; run the upstream \
                 mirrornode-bootstrap init script, then re-run `import` once \
                 it has written the SKIP_DB_INIT flag file."
            );
            1
        }
        Command::Watch { .. } => {
            logging::init_stderr_only(cfg.debug_mode);
            error!("`watch` is not implemented by this build; use `status` for a point-in-time summary.");
            1
        }
    }
}

async fn run_import(
    cfg: &mut Config,
    data_dir: Option<PathBuf>,
    manifest: Option<PathBuf>,
    jobs: Option<usize>,
) -> i32 {
    let logs_dir = logs_dir();
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        eprintln!("failed to create logs directory {}: {e}", logs_dir.display());
        return 1;
    }

    let _guard = match logging::init_with_file(&logs_dir, cfg.debug_mode) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("failed to open log file: {e}");
            return 1;
        }
    };

    let data_dir = data_dir
        .or_else(|| (!cfg.data_dir.is_empty()).then(|| PathBuf::from(&cfg.data_dir)))
        .unwrap_or_else(|| PathBuf::from("./data"));
    let manifest_file = manifest
        .or_else(|| (!cfg.manifest_file.is_empty()).then(|| PathBuf::from(&cfg.manifest_file)))
        .unwrap_or_else(|| data_dir.join("manifest.csv"));
    let jobs = jobs.filter(|&j| j > 0).unwrap_or(cfg.max_jobs);

    info!(data_dir = %data_dir.display(), manifest = %manifest_file.display(), jobs, "starting import");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("received signal, shutting down...");
        signal_cancel.cancel();
        // Workers get a short grace period to roll back in-flight
        // transactions and exit cleanly; if the process is still alive
        // after that, force it down. If the run already finished and
        // `main` called `std::process::exit`, this task never gets here.
        tokio::time::sleep(Duration::from_secs(2)).await;
        error!("forced shutdown after grace period");
        std::process::exit(1);
    });

    let opts = ImportOptions { data_dir, manifest_file, jobs, logs_dir };

    match orchestrator::run_import(cfg, opts, cancel).await {
        Ok(summary) => {
            info!("====================================================");
            if summary.was_interrupted {
                warn!("====================================================");
                warn!(completed = summary.success_count, pending = summary.pending_count, "import was interrupted by signal");
                warn!("run the import command again to resume");
                warn!("====================================================");
            } else if summary.fail_count > 0 || summary.discrepancy_count > 0 || summary.inconsistent_count > 0 {
                error!("====================================================");
                error!("the database import encountered errors");
                error!("mirrornode requires a fully synchronized database");
                error!("please review the errors and discrepancies above");
                error!("====================================================");
            } else if summary.pending_count > 0 {
                warn!(pending = summary.pending_count, "import incomplete: some files were not processed");
                warn!("run the import command again to continue");
            } else {
                info!("db import completed successfully");
                info!("the database is fully identical to the data files");
                info!("====================================================");
            }
            summary.exit_code()
        }
        Err(e) => {
            error!(error = %e, "import failed to start");
            1
        }
    }
}

fn run_status(cfg: &Config) -> i32 {
    logging::init_stderr_only(cfg.debug_mode);
    let logs_dir = logs_dir();
    let tracking_path = logs_dir.join(&cfg.tracking_file);

    let tracker = Tracker::new(&tracking_path);
    if let Err(e) = tracker.open() {
        eprintln!("failed to load tracking data from {}: {e}", tracking_path.display());
        return 1;
    }

    let counts = tracker.count_by_status();
    println!("Import status (from {}):", tracking_path.display());
    println!("  Imported:    {}", counts.get(&Status::Imported).copied().unwrap_or(0));
    println!("  In Progress: {}", counts.get(&Status::InProgress).copied().unwrap_or(0));
    println!(
        "  Failed:      {}",
        counts.get(&Status::FailedToImport).copied().unwrap_or(0)
            + counts.get(&Status::FailedValidation).copied().unwrap_or(0)
    );
    println!("  Not Started: {}", counts.get(&Status::NotStarted).copied().unwrap_or(0));
    0
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
