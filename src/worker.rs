//! Bounded job/result queues driving the parallel import pipeline.
//!
//! Channels are sized `workers*2` so a burst of completions never stalls
//! a worker mid-send, the worker loop selects between a new job and
//! cancellation, and process-wide counters are shared via `Arc<AtomicU64>`.
//!
//! The producer (submitting jobs) and the consumer (draining results) MUST
//! run on separate tasks. If a single task both submitted a job and then
//! awaited its result, and the result channel filled up first, every
//! worker would block sending its result while the only task able to drain
//! them was itself blocked submitting — a deadlock. Keeping submission and
//! draining concurrent is the one property a caller of this module must
//! never give up.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A single file queued for import.
#[derive(Debug, Clone)]
pub struct Job {
    pub filename: String,
    pub file_path: PathBuf,
    pub index: usize,
}

/// Outcome of processing one [`Job`].
#[derive(Debug)]
pub struct JobResult {
    pub job: Job,
    pub success: bool,
    pub rows_imported: i64,
    pub expected_rows: i64,
    pub row_count_mismatch: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicI64,
    completed: AtomicI64,
    failed: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub submitted: i64,
    pub completed: i64,
    pub failed: i64,
    pub pending: i64,
}

/// A running pool of workers. Construct with [`Pool::start`], submit jobs
/// with [`Pool::submit`] from one task while draining [`Pool::results`]
/// from another, then [`Pool::close`] once every job has been submitted.
pub struct Pool {
    jobs_tx: mpsc::Sender<Job>,
    results_rx: mpsc::Receiver<JobResult>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    workers: usize,
}

type Processor =
    Arc<dyn Fn(Job) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync>;

impl Pool {
    /// Spawns `workers` tasks, each pulling from a channel of capacity
    /// `workers * 2` and calling `processor` for every job. `cancel` is a
    /// child of (or equal to) the orchestrator's root cancellation token;
    /// cancelling it stops workers from picking up further jobs.
    pub fn start(workers: usize, cancel: CancellationToken, processor: Processor) -> Self {
        let capacity = workers * 2;
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(capacity);
        let (results_tx, results_rx) = mpsc::channel::<JobResult>(capacity);
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let counters = Arc::new(Counters::default());

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let jobs_rx = Arc::clone(&jobs_rx);
            let results_tx = results_tx.clone();
            let cancel = cancel.clone();
            let counters = Arc::clone(&counters);
            let processor = Arc::clone(&processor);

            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = jobs_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            job = rx.recv() => job,
                        }
                    };
                    let Some(job) = job else { break };

                    let result = processor(job).await;
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    if !result.success {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        send_res = results_tx.send(result) => {
                            if send_res.is_err() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        Pool {
            jobs_tx,
            results_rx,
            handles,
            cancel,
            counters,
            workers,
        }
    }

    /// Submits a job, blocking (asynchronously) if every worker is busy
    /// and the queue is full. Returns `false` if the pool has been
    /// cancelled before the job could be accepted.
    pub async fn submit(&self, job: Job) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            send_res = self.jobs_tx.send(job) => {
                if send_res.is_ok() {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Channel of completed job results. Must be drained concurrently with
    /// [`Pool::submit`] calls, never after all submission has finished.
    pub fn results(&mut self) -> &mut mpsc::Receiver<JobResult> {
        &mut self.results_rx
    }

    /// Takes ownership of the results channel, leaving a closed dummy
    /// receiver in its place. Lets a caller move draining to a task
    /// separate from the one that owns the `Pool` (and will eventually
    /// call [`Pool::close`]), which is what the deadlock-avoidance
    /// property above actually requires.
    pub fn take_results(&mut self) -> mpsc::Receiver<JobResult> {
        let (_tx, rx) = mpsc::channel(1);
        std::mem::replace(&mut self.results_rx, rx)
    }

    /// Drops the submission side so workers exit once the queue empties,
    /// then waits for every worker task to finish.
    pub async fn close(mut self) {
        drop(self.jobs_tx);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn metrics(&self) -> Metrics {
        let submitted = self.counters.submitted.load(Ordering::Relaxed);
        let completed = self.counters.completed.load(Ordering::Relaxed);
        Metrics {
            submitted,
            completed,
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending: submitted - completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn job(index: usize) -> Job {
        Job {
            filename: format!("file{index}.csv.gz"),
            file_path: PathBuf::from(format!("/data/file{index}.csv.gz")),
            index,
        }
    }

    #[tokio::test]
    async fn submits_and_drains_results_concurrently() {
        let cancel = CancellationToken::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let processed_clone = Arc::clone(&processed);

        let mut pool = Pool::start(
            4,
            cancel.clone(),
            Arc::new(move |job: Job| {
                let processed = Arc::clone(&processed_clone);
                Box::pin(async move {
                    processed.fetch_add(1, Ordering::Relaxed);
                    JobResult {
                        job,
                        success: true,
                        rows_imported: 10,
                        expected_rows: 10,
                        row_count_mismatch: false,
                        error: None,
                    }
                })
            }),
        );

        let submitter = {
            let jobs: Vec<Job> = (0..20).map(job).collect();
            let pool_tx = pool.jobs_tx.clone();
            tokio::spawn(async move {
                for j in jobs {
                    let _ = pool_tx.send(j).await;
                }
            })
        };

        let mut received = 0;
        while received < 20 {
            match tokio::time::timeout(Duration::from_secs(5), pool.results().recv()).await {
                Ok(Some(_)) => received += 1,
                _ => break,
            }
        }

        submitter.await.unwrap();
        assert_eq!(received, 20);
        assert_eq!(processed.load(Ordering::Relaxed), 20);

        pool.close().await;
    }

    #[tokio::test]
    async fn cancellation_stops_further_submission() {
        let cancel = CancellationToken::new();
        let pool = Pool::start(
            1,
            cancel.clone(),
            Arc::new(|job: Job| {
                Box::pin(async move {
                    JobResult {
                        job,
                        success: true,
                        rows_imported: 0,
                        expected_rows: 0,
                        row_count_mismatch: false,
                        error: None,
                    }
                })
            }),
        );

        cancel.cancel();
        let accepted = pool.submit(job(0)).await;
        assert!(!accepted);
        pool.close().await;
    }

    #[tokio::test]
    async fn metrics_reflect_failures() {
        let cancel = CancellationToken::new();
        let mut pool = Pool::start(
            2,
            cancel.clone(),
            Arc::new(|job: Job| {
                Box::pin(async move {
                    JobResult {
                        success: job.index % 2 == 0,
                        rows_imported: 0,
                        expected_rows: 0,
                        row_count_mismatch: false,
                        error: if job.index % 2 == 0 { None } else { Some("boom".to_string()) },
                        job,
                    }
                })
            }),
        );

        for i in 0..4 {
            assert!(pool.submit(job(i)).await);
        }
        for _ in 0..4 {
            pool.results().recv().await.unwrap();
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.submitted, 4);
        assert_eq!(metrics.completed, 4);
        assert_eq!(metrics.failed, 2);

        pool.close().await;
    }
}
