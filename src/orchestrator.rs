//! Wires manifest, tracker, worker pool, and progress monitor together
//! into the end-to-end `import` run: `bootstrap-logs/` layout, the
//! PID-file single-instance guard, the `SKIP_DB_INIT` flag check, pool
//! sizing (`workers + 2`), tracking pre-population that skips special
//! files, resumption cleanup of non-terminal statuses, the
//! submit-in-a-separate-task / drain-results-here deadlock avoidance, the
//! row-count discrepancy log, and the final statistics / exit-code
//! decision tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool_postgres::{Config as DbConfig, ManagerConfig, Pool as DbPool, PoolConfig, RecyclingMethod, Runtime};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffers::BufferPools;
use crate::config::Config;
use crate::error::FatalError;
use crate::importer;
use crate::manifest::Manifest;
use crate::progress::Monitor;
use crate::tracker::{HashStatus, Status, Tracker};
use crate::worker::{Job, JobResult, Pool as WorkerPool};

/// File dropped into `bootstrap-logs/` by `init` once schema setup and the
/// credential switch-over are done. Its absence means `import` would run
/// against a database that was never bootstrapped.
pub const SKIP_DB_INIT_FLAG: &str = "SKIP_DB_INIT";
const PID_FILE_NAME: &str = "bootstrap.pid";

pub struct ImportOptions {
    pub data_dir: PathBuf,
    pub manifest_file: PathBuf,
    pub jobs: usize,
    pub logs_dir: PathBuf,
}

/// Outcome of a completed `import` run, used to decide the process exit
/// code without the orchestrator itself calling `std::process::exit`.
pub struct ImportSummary {
    pub success_count: usize,
    pub fail_count: usize,
    pub discrepancy_count: usize,
    pub inconsistent_count: usize,
    pub pending_count: usize,
    pub was_interrupted: bool,
    pub total_rows: i64,
    pub elapsed: Duration,
}

impl ImportSummary {
    /// Matches the exit-code decision tree: interrupted, then
    /// failed/discrepant/inconsistent, then incomplete, else success.
    pub fn exit_code(&self) -> i32 {
        if self.was_interrupted {
            1
        } else if self.fail_count > 0 || self.discrepancy_count > 0 || self.inconsistent_count > 0 {
            1
        } else if self.pending_count > 0 {
            1
        } else {
            0
        }
    }
}

/// Single-instance guard via a PID file and a null-signal liveness probe.
/// Returns a guard that removes the file on drop; callers must hold it for
/// the duration of the run.
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    pub fn acquire(logs_dir: &Path) -> Result<Self, FatalError> {
        let path = logs_dir.join(PID_FILE_NAME);

        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(existing_pid) = contents.trim().parse::<i32>() {
                if existing_pid > 0 && process_is_alive(existing_pid) {
                    return Err(FatalError::AnotherInstanceRunning(existing_pid));
                }
            }
        }

        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(PidGuard { path })
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn process_is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

pub async fn run_import(
    cfg: &mut Config,
    opts: ImportOptions,
    cancel: CancellationToken,
) -> Result<ImportSummary, FatalError> {
    let start = Instant::now();

    std::fs::create_dir_all(&opts.logs_dir)?;
    let _pid_guard = PidGuard::acquire(&opts.logs_dir)?;

    let skip_db_init_flag = opts.logs_dir.join(SKIP_DB_INIT_FLAG);
    if !skip_db_init_flag.exists() {
        return Err(FatalError::InitNotCompleted(skip_db_init_flag));
    }
    info!("database initialized, using mirror_node credentials");
    cfg.use_application_user();

    let manifest = Manifest::load(&opts.manifest_file, &opts.data_dir)?;
    info!(
        files = manifest.count(),
        total_rows = manifest.total_expected_rows(),
        "manifest loaded"
    );

    let tracking_path = opts.logs_dir.join(&cfg.tracking_file);
    let tracker = Arc::new(Tracker::new(&tracking_path));
    tracker.open()?;

    let mut prepopulated = 0;
    for filename in manifest.all_files() {
        if importer::is_special_file(filename) {
            continue;
        }
        let basename = basename_of(filename);
        let (status, _) = tracker.read_status(&basename);
        if status == Status::NotStarted {
            tracker.write_status(&basename, Status::NotStarted, HashStatus::Unverified)?;
            prepopulated += 1;
        }
    }
    info!(path = %tracking_path.display(), prepopulated, "tracking file initialized");

    let reset = tracker.reset_incomplete()?;
    if reset > 0 {
        info!(files_reset = reset, "resumption cleanup complete");
    }

    let mut db_config = DbConfig::new();
    db_config.host = Some(cfg.pg_host.clone());
    db_config.port = Some(cfg.pg_port.parse::<u16>().unwrap_or(5432));
    db_config.user = Some(cfg.pg_user.clone());
    db_config.password = Some(cfg.pg_password.clone());
    db_config.dbname = Some(cfg.pg_database.clone());
    db_config.manager = Some(ManagerConfig { recycling_method: RecyclingMethod::Fast });
    db_config.pool = Some(PoolConfig::new(opts.jobs + 2));
    let db_pool: DbPool = db_config.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)?;

    let monitor_conn = db_pool.get().await.map_err(|e| {
        FatalError::Io(std::io::Error::other(format!("failed to acquire monitor connection: {e}")))
    })?;

    info!(
        host = %cfg.pg_host,
        database = %cfg.pg_database,
        pool_size = opts.jobs + 2,
        "connected to database"
    );

    let progress_path = opts.logs_dir.join(&cfg.progress_file);
    let monitor = Arc::new(Monitor::new(monitor_conn, Duration::from_secs(5), Some(progress_path)));
    if let Err(e) = monitor.create_progress_table().await {
        warn!(error = %e, "failed to create progress table");
    }

    let monitor_cancel = cancel.clone();
    let monitor_handle = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.run(monitor_cancel).await })
    };

    let buffers = BufferPools::new();
    let decompressor_threads = cfg.decompressor_threads;
    let tracker_for_workers = Arc::clone(&tracker);
    let manifest = Arc::new(manifest);
    let manifest_for_workers = Arc::clone(&manifest);
    let monitor_for_workers = Arc::clone(&monitor);
    let cancel_for_workers = cancel.clone();

    let processor = Arc::new(move |job: Job| {
        let db_pool = db_pool.clone();
        let tracker = Arc::clone(&tracker_for_workers);
        let manifest = Arc::clone(&manifest_for_workers);
        let monitor = Arc::clone(&monitor_for_workers);
        let buffers = buffers.clone();
        let cancel = cancel_for_workers.clone();

        Box::pin(async move {
            debug!(file = %job.filename, index = job.index, "worker received job");

            if tracker.is_imported(&job.filename) {
                debug!(file = %job.filename, "skipping already imported file");
                return JobResult {
                    job,
                    success: true,
                    rows_imported: 0,
                    expected_rows: 0,
                    row_count_mismatch: false,
                    error: None,
                };
            }

            let Some(entry) = manifest.get_by_basename(&job.filename) else {
                error!(file = %job.filename, "file not in manifest");
                return JobResult {
                    success: false,
                    rows_imported: 0,
                    expected_rows: 0,
                    row_count_mismatch: false,
                    error: Some(format!("file not in manifest: {}", job.filename)),
                    job,
                };
            };
            let expected_rows = entry.row_count;
            let expected_size = entry.file_size;
            let expected_hash = entry.blake3_hash.clone();

            let acquire_start = Instant::now();
            let client = match db_pool.get().await {
                Ok(c) => c,
                Err(e) => {
                    let acquire_time = acquire_start.elapsed();
                    error!(file = %job.filename, error = %e, acquire_time_ms = acquire_time.as_millis(), "connection failed");
                    let _ = tracker.write_status(&job.filename, Status::FailedToImport, HashStatus::Unverified);
                    return JobResult {
                        success: false,
                        rows_imported: 0,
                        expected_rows,
                        row_count_mismatch: false,
                        error: Some(format!("connection failed: {e}")),
                        job,
                    };
                }
            };
            let acquire_time = acquire_start.elapsed();
            if acquire_time > Duration::from_millis(100) {
                warn!(file = %job.filename, acquire_time_ms = acquire_time.as_millis(), "slow connection acquire");
            }

            let monitor_clone = Arc::clone(&monitor);
            let register_filename = job.filename.clone();
            tokio::spawn(async move {
                let _ = monitor_clone.register_file(&register_filename, expected_rows).await;
            });

            info!(file = %job.filename, expected_rows, "starting file import");
            let _ = tracker.write_status(&job.filename, Status::InProgress, HashStatus::Unverified);

            let import_fut = async {
                let mut client = client;
                let tx = client.transaction().await?;
                let outcome = importer::import_with_validation(
                    &tx,
                    &job.file_path,
                    &job.filename,
                    &expected_hash,
                    expected_size,
                    decompressor_threads,
                    &buffers,
                )
                .await?;
                tx.commit().await?;
                Ok::<_, crate::error::ImportError>(outcome)
            };

            // A signal mid-COPY must surface as `Cancelled`, not a terminal
            // failure: the tracker entry stays `IN_PROGRESS` and the next
            // run's resumption cleanup retries it. `tx` (and its borrowed
            // `client`) is dropped on this branch, which rolls back whatever
            // the COPY had streamed so far.
            let import_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(crate::error::ImportError::Cancelled),
                result = import_fut => result,
            };

            match import_result {
                Ok(outcome) => {
                    let mismatch = expected_rows > 0 && outcome.rows_imported != expected_rows;
                    if mismatch {
                        warn!(
                            file = %job.filename,
                            expected_rows,
                            actual_rows = outcome.rows_imported,
                            "row count mismatch"
                        );
                    }
                    let _ = tracker.write_status(&job.filename, Status::Imported, HashStatus::Verified);
                    let _ = monitor.mark_complete(&job.filename).await;
                    buffers.maybe_rotate(outcome.rows_imported);

                    info!(file = %job.filename, table = %outcome.table_name, rows = outcome.rows_imported, "file imported");

                    JobResult {
                        success: true,
                        rows_imported: outcome.rows_imported,
                        expected_rows,
                        row_count_mismatch: mismatch,
                        error: None,
                        job,
                    }
                }
                Err(e) if e.is_cancelled() => {
                    info!(file = %job.filename, "import interrupted");
                    let _ = tracker.write_status(&job.filename, Status::InProgress, HashStatus::Unverified);
                    JobResult {
                        success: false,
                        rows_imported: 0,
                        expected_rows,
                        row_count_mismatch: false,
                        error: Some(e.to_string()),
                        job,
                    }
                }
                Err(e) => {
                    let terminal_status =
                        if e.is_validation_failure() { Status::FailedValidation } else { Status::FailedToImport };
                    error!(file = %job.filename, error = %e, "import failed");
                    let _ = tracker.write_status(&job.filename, terminal_status, HashStatus::Unverified);
                    JobResult {
                        success: false,
                        rows_imported: 0,
                        expected_rows,
                        row_count_mismatch: false,
                        error: Some(e.to_string()),
                        job,
                    }
                }
            }
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = JobResult> + Send>>
    });

    let mut worker_pool = WorkerPool::start(opts.jobs, cancel.clone(), processor);
    let mut results_rx = worker_pool.take_results();

    let mut jobs_to_submit = Vec::new();
    let mut skipped_count = 0;
    for filename in manifest.all_files() {
        if importer::is_special_file(filename) {
            continue;
        }
        let basename = basename_of(filename);

        if tracker.is_imported(&basename) {
            skipped_count += 1;
            continue;
        }

        let (status, _) = tracker.read_status(&basename);
        if status == Status::FailedToImport || status == Status::FailedValidation {
            warn!(file = %basename, previous_status = ?status, "retrying previously failed file");
        }

        if let Some(entry) = manifest.get_by_basename(&basename) {
            jobs_to_submit.push(Job {
                index: jobs_to_submit.len(),
                file_path: manifest.full_path(entry),
                filename: basename,
            });
        }
    }
    let expected_count = jobs_to_submit.len();

    // Submission runs on its own task so it can never block the draining
    // below: the job channel and the result channel are each bounded, and
    // if one task both submitted and awaited results, a full result
    // channel would stall every worker mid-send with nothing left to
    // drain it. See `worker::Pool`'s docs for the full argument.
    let submitter = tokio::spawn(async move {
        for job in jobs_to_submit {
            if !worker_pool.submit(job).await {
                break;
            }
        }
        worker_pool.close().await;
    });

    let discrepancy_path = opts.logs_dir.join("bootstrap_discrepancies.log");
    let mut discrepancy_file: Option<tokio::fs::File> = None;
    let mut total_rows = 0i64;
    let mut success_count = 0usize;
    let mut fail_count = 0usize;
    let mut discrepancy_count = 0usize;

    let mut received = 0usize;
    while received < expected_count {
        let Some(result) = results_rx.recv().await else { break };
        received += 1;

        if result.success {
            success_count += 1;
            total_rows += result.rows_imported;
        } else {
            fail_count += 1;
            if let Some(err) = &result.error {
                error!(file = %result.job.filename, error = %err, "import failed");
            }
        }

        if result.row_count_mismatch {
            discrepancy_count += 1;
            if discrepancy_file.is_none() {
                discrepancy_file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&discrepancy_path)
                    .await
                    .ok();
            }
            if let Some(f) = discrepancy_file.as_mut() {
                let line = format!(
                    "{}: expected={}, imported={}\n",
                    result.job.filename, result.expected_rows, result.rows_imported
                );
                let _ = f.write_all(line.as_bytes()).await;
            }
        }
    }

    submitter.await.ok();

    let was_interrupted = cancel.is_cancelled();

    let _ = monitor.cleanup().await;
    monitor_handle.abort();

    let inconsistent_files = tracker.files_with_status(Status::InProgress);
    let inconsistent_count = inconsistent_files.len();

    let elapsed = start.elapsed();
    let processed_count = success_count + fail_count;
    let pending_count = expected_count.saturating_sub(processed_count);

    info!(
        total_files = manifest.count(),
        skipped = skipped_count,
        attempted = processed_count,
        completed = success_count,
        failed = fail_count,
        inconsistent = inconsistent_count,
        total_rows,
        elapsed_secs = elapsed.as_secs(),
        "import statistics"
    );

    if discrepancy_count > 0 {
        warn!(discrepancy_count, "discrepancies detected; see bootstrap_discrepancies.log");
    } else {
        info!("no discrepancies detected during import");
    }

    if inconsistent_count > 0 {
        for f in &inconsistent_files {
            warn!(file = %f, "file still marked IN_PROGRESS; may need re-import");
        }
    }

    Ok(ImportSummary {
        success_count,
        fail_count,
        discrepancy_count,
        inconsistent_count,
        pending_count,
        was_interrupted,
        total_rows,
        elapsed,
    })
}

fn basename_of(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string())
}
