//! Real-time import progress: polls `pg_stat_progress_copy`, computes a
//! rolling rows/sec rate, and rewrites a fixed-column progress file on a
//! tick.
//!
//! The formatting functions take `&mut dyn Write` rather than writing
//! directly to a file handle, so the column layout and rate math can be
//! unit-tested without a live terminal or database.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const PROGRESS_TABLE: &str = "bootstrap_manifest_progress";
const APPLICATION_NAME_PREFIX: &str = "bootstrap_copy_";

#[derive(Debug, Clone, PartialEq)]
pub struct FileProgress {
    pub filename: String,
    pub rows_processed: i64,
    pub total_rows: i64,
    pub percentage: f64,
    pub rate: i64,
}

#[derive(Clone, Copy)]
struct SampleState {
    rows: i64,
    at: Instant,
}

/// Tracks progress across the run. Holds its own serialized connection: a
/// single connection is cheaper and avoids contending with the worker
/// pool's copy connections for a slot.
pub struct Monitor {
    conn: AsyncMutex<deadpool_postgres::Client>,
    interval: Duration,
    last_state: SyncMutex<HashMap<String, SampleState>>,
    progress_file: Option<std::path::PathBuf>,
}

impl Monitor {
    pub fn new(
        conn: deadpool_postgres::Client,
        interval: Duration,
        progress_file: Option<std::path::PathBuf>,
    ) -> Self {
        Monitor {
            conn: AsyncMutex::new(conn),
            interval,
            last_state: SyncMutex::new(HashMap::new()),
            progress_file,
        }
    }

    pub async fn create_progress_table(&self) -> Result<(), tokio_postgres::Error> {
        let query = format!(
            "CREATE TEMPORARY TABLE IF NOT EXISTS {PROGRESS_TABLE} (
                filename TEXT PRIMARY KEY,
                total_rows BIGINT,
                status TEXT DEFAULT 'pending'
            )"
        );
        let conn = self.conn.lock().await;
        conn.execute(&query, &[]).await?;
        Ok(())
    }

    pub async fn register_file(
        &self,
        filename: &str,
        total_rows: i64,
    ) -> Result<(), tokio_postgres::Error> {
        let query = format!(
            "INSERT INTO {PROGRESS_TABLE} (filename, total_rows, status)
             VALUES ($1, $2, 'importing')
             ON CONFLICT (filename) DO UPDATE SET total_rows = $2, status = 'importing'"
        );
        let conn = self.conn.lock().await;
        conn.execute(&query, &[&filename, &total_rows]).await?;
        Ok(())
    }

    pub async fn mark_complete(&self, filename: &str) -> Result<(), tokio_postgres::Error> {
        let query = format!("UPDATE {PROGRESS_TABLE} SET status = 'complete' WHERE filename = $1");
        let conn = self.conn.lock().await;
        conn.execute(&query, &[&filename]).await?;
        Ok(())
    }

    pub async fn fetch_progress(&self) -> Result<Vec<FileProgress>, tokio_postgres::Error> {
        let query = format!(
            "SELECT
                COALESCE(regexp_replace(a.application_name, '^{APPLICATION_NAME_PREFIX}', ''), 'unknown') AS filename,
                COALESCE(p.tuples_processed, 0) AS rows_processed,
                COALESCE(t.total_rows, 0) AS total_rows
             FROM pg_stat_progress_copy p
             JOIN pg_stat_activity a ON a.pid = p.pid
             LEFT JOIN {PROGRESS_TABLE} t ON t.filename = regexp_replace(a.application_name, '^{APPLICATION_NAME_PREFIX}', '')
             WHERE a.application_name LIKE '{APPLICATION_NAME_PREFIX}%'"
        );

        let rows = {
            let conn = self.conn.lock().await;
            conn.query(&query, &[]).await?
        };

        let now = Instant::now();
        let mut last_state = self.last_state.lock();
        let mut results = Vec::with_capacity(rows.len());

        for row in rows {
            let filename: String = row.get(0);
            let rows_processed: i64 = row.get(1);
            let total_rows: i64 = row.get(2);

            let rate = match last_state.get(&filename) {
                Some(prev) => {
                    let elapsed = now.duration_since(prev.at).as_secs_f64();
                    if elapsed > 0.0 {
                        ((rows_processed - prev.rows) as f64 / elapsed) as i64
                    } else {
                        0
                    }
                }
                None => 0,
            };

            let percentage = if total_rows > 0 {
                rows_processed as f64 / total_rows as f64 * 100.0
            } else {
                0.0
            };

            last_state.insert(filename.clone(), SampleState { rows: rows_processed, at: now });

            results.push(FileProgress {
                filename,
                rows_processed,
                total_rows,
                percentage,
                rate,
            });
        }

        Ok(results)
    }

    /// Writes the fixed-column progress report, or does nothing if no
    /// progress file was configured.
    pub fn write_progress_file(&self, progresses: &[FileProgress]) -> std::io::Result<()> {
        let Some(path) = &self.progress_file else { return Ok(()) };

        let tmp_path = {
            let mut s = path.as_os_str().to_os_string();
            s.push(".tmp");
            std::path::PathBuf::from(s)
        };

        let mut out = String::new();
        format_progress_report(&mut out, progresses);
        std::fs::write(&tmp_path, out)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Runs the tick loop until `cancel` fires. Query errors are logged
    /// and skipped rather than treated as fatal — a transient monitoring
    /// hiccup must never abort an in-flight import.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.fetch_progress().await {
                        Ok(progresses) if !progresses.is_empty() => {
                            if let Err(e) = self.write_progress_file(&progresses) {
                                warn!(error = %e, "failed to write progress file");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "failed to fetch progress"),
                    }
                }
            }
        }
    }

    pub async fn cleanup(&self) -> Result<(), tokio_postgres::Error> {
        let query = format!("DROP TABLE IF EXISTS {PROGRESS_TABLE}");
        let conn = self.conn.lock().await;
        conn.execute(&query, &[]).await?;
        Ok(())
    }
}

fn truncate_filename(filename: &str, max_len: usize) -> String {
    if filename.len() <= max_len {
        return filename.to_string();
    }
    let keep = max_len - 3;
    let start = filename
        .char_indices()
        .rev()
        .nth(keep.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    format!("...{}", &filename[start..])
}

pub fn format_number(n: i64) -> String {
    let sign = if n < 0 { "-" } else { "" };
    let digits = n.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{sign}{}", grouped.chars().rev().collect::<String>())
}

pub fn format_rate(rate: i64) -> String {
    format!("{}/s", format_number(rate))
}

pub fn format_percentage(pct: f64) -> String {
    format!("{pct:.2}%")
}

/// Writes the header, separator, and one row per file in the
/// `Filename Rows_Processed Total_Rows Percentage Rate` layout.
fn format_progress_report(out: &mut String, progresses: &[FileProgress]) {
    use std::fmt::Write;

    let _ = writeln!(
        out,
        "{:<60} {:>20} {:>20} {:>10} {:>15}",
        "Filename", "Rows_Processed", "Total_Rows", "Percentage", "Rate"
    );
    let _ = writeln!(out, "{}", "-".repeat(150));

    for p in progresses {
        let _ = writeln!(
            out,
            "{:<60} {:>20} {:>20} {:>10} {:>15}",
            truncate_filename(&p.filename, 60),
            format_number(p.rows_processed),
            format_number(p.total_rows),
            format_percentage(p.percentage),
            format_rate(p.rate),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
        assert_eq!(format_number(-1234), "-1,234");
    }

    #[test]
    fn format_rate_appends_per_second() {
        assert_eq!(format_rate(1234), "1,234/s");
    }

    #[test]
    fn format_percentage_two_decimals() {
        assert_eq!(format_percentage(25.0), "25.00%");
        assert_eq!(format_percentage(0.0), "0.00%");
    }

    #[test]
    fn truncate_filename_preserves_tail() {
        assert_eq!(truncate_filename("short.csv.gz", 60), "short.csv.gz");
        let long = "a".repeat(80);
        let truncated = truncate_filename(&long, 60);
        assert_eq!(truncated.len(), 60);
        assert!(truncated.starts_with("..."));
    }

    #[test]
    fn truncate_filename_does_not_split_multibyte_chars() {
        let long: String = "\u{00e9}".repeat(80);
        let truncated = truncate_filename(&long, 60);
        assert!(truncated.starts_with("..."));
        assert_eq!(truncated.chars().count(), 60);
    }

    #[test]
    fn report_format_has_header_and_rows() {
        let mut out = String::new();
        let progresses = vec![FileProgress {
            filename: "account_balance.csv.gz".to_string(),
            rows_processed: 500,
            total_rows: 1000,
            percentage: 50.0,
            rate: 100,
        }];
        format_progress_report(&mut out, &progresses);
        assert!(out.contains("Filename"));
        assert!(out.contains("account_balance.csv.gz"));
        assert!(out.contains("50.00%"));
        assert!(out.contains("100/s"));
    }
}
