//! Parsing and querying of the CSV manifest that lists every shard's
//! expected row count, file size, and BLAKE3 hash.
//!
//! Column parsing is tolerant rather than strict: a missing row count is
//! `N/A`, a row with an unparseable file size is skipped outright, and
//! lookups normalize to basename so callers don't have to care whether a
//! manifest path carries a subdirectory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::FatalError;

/// A single manifest row.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Relative path as written in the manifest (may include a subdirectory).
    pub filename: String,
    /// Expected row count, or `-1` if the manifest said `N/A`/left it blank.
    pub row_count: i64,
    pub file_size: i64,
    pub blake3_hash: String,
}

/// All manifest entries, indexed by basename.
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: HashMap<String, Entry>,
    data_dir: PathBuf,
}

impl Manifest {
    /// Parses `manifest_path`, an open CSV with header row
    /// `filename,row_count,file_size,blake3_hash`. Rows with fewer than 4
    /// fields, a blank filename, or an unparseable file size are skipped
    /// rather than treated as fatal; the header row is always skipped.
    pub fn load(manifest_path: &Path, data_dir: &Path) -> Result<Self, FatalError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(manifest_path)
            .map_err(|e| FatalError::Manifest(format!("failed to open manifest: {e}")))?;

        let mut entries = HashMap::new();
        for (i, record) in reader.records().enumerate() {
            let record = record
                .map_err(|e| FatalError::Manifest(format!("failed to parse manifest CSV: {e}")))?;
            if i == 0 {
                continue;
            }
            if record.len() < 4 {
                continue;
            }

            let filename = record[0].trim().to_string();
            if filename.is_empty() {
                continue;
            }

            let row_count = match record[1].trim() {
                "N/A" | "" => -1,
                s => s.parse().unwrap_or(-1),
            };

            let Ok(file_size) = record[2].trim().parse::<i64>() else {
                continue;
            };

            let blake3_hash = record[3].trim().to_string();
            let normalized = normalize_filename(&filename);

            entries.insert(
                normalized,
                Entry {
                    filename,
                    row_count,
                    file_size,
                    blake3_hash,
                },
            );
        }

        Ok(Manifest {
            entries,
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Looks up an entry by full path or basename.
    pub fn get(&self, filename: &str) -> Option<&Entry> {
        self.entries.get(&normalize_filename(filename))
    }

    pub fn get_by_basename(&self, basename: &str) -> Option<&Entry> {
        self.entries.get(basename)
    }

    pub fn all_files(&self) -> Vec<&str> {
        self.entries.values().map(|e| e.filename.as_str()).collect()
    }

    pub fn all_basenames(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn full_path(&self, entry: &Entry) -> PathBuf {
        self.data_dir.join(&entry.filename)
    }

    /// Sum of row counts, excluding entries whose row count is `-1` (N/A).
    pub fn total_expected_rows(&self) -> i64 {
        self.entries.values().filter(|e| e.row_count > 0).map(|e| e.row_count).sum()
    }

    pub fn total_expected_bytes(&self) -> i64 {
        self.entries.values().map(|e| e.file_size).sum()
    }

    /// Entries whose filename's table name (after partition-suffix
    /// stripping) matches `table_name`.
    pub fn filter_by_table(&self, table_name: &str) -> Vec<&Entry> {
        self.entries
            .values()
            .filter(|e| extract_table_name(&e.filename) == table_name)
            .collect()
    }
}

fn normalize_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string())
}

/// Strips a `.csv.gz`/`.gz`/`.csv` suffix and a trailing `_pYYYY_MM(_atma)?`
/// partition suffix, leaving the base table name.
///
/// Examples: `account_balance_p2024_01.csv.gz` -> `account_balance`,
/// `flyway_schema_history.csv.gz` -> `flyway_schema_history`.
fn extract_table_name(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let base = base
        .strip_suffix(".csv.gz")
        .or_else(|| base.strip_suffix(".gz"))
        .or_else(|| base.strip_suffix(".csv"))
        .unwrap_or(&base);

    if let Some(idx) = base.find("_p") {
        if idx > 0 {
            let suffix = &base[idx + 2..];
            if suffix.len() >= 4 && suffix.as_bytes()[0].is_ascii_digit() {
                return base[..idx].to_string();
            }
        }
    }

    base.to_string()
}
