//! Durable, resumable per-file import status tracking backed by a JSON
//! file on disk.
//!
//! Writes are atomic: serialize, write to a `.tmp` sibling, rename over
//! the real file, and clean up the tmp file if the rename itself fails.
//! Reads and writes both go through a `parking_lot::RwLock` guarding the
//! in-memory map that mirrors the file on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::FatalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "NOT_STARTED")]
    NotStarted,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "IMPORTED")]
    Imported,
    #[serde(rename = "FAILED_VALIDATION")]
    FailedValidation,
    #[serde(rename = "FAILED_TO_IMPORT")]
    FailedToImport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashStatus {
    #[serde(rename = "HASH_UNVERIFIED")]
    Unverified,
    #[serde(rename = "HASH_VERIFIED")]
    Verified,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileStatus {
    pub status: Status,
    pub hash_status: HashStatus,
}

type TrackingData = HashMap<String, FileStatus>;

/// Manages import status tracking with JSON file storage. `open` must be
/// called once before any reads or writes; the in-memory map is the
/// source of truth between calls, flushed to disk on every write.
pub struct Tracker {
    path: PathBuf,
    data: RwLock<TrackingData>,
}

impl Tracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Tracker {
            path: path.into(),
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Loads existing tracking data from the JSON file. A missing file is
    /// not an error (first run); a present-but-unparseable file is fatal.
    pub fn open(&self) -> Result<(), FatalError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.data.write() = HashMap::new();
                return Ok(());
            }
            Err(e) => return Err(FatalError::TrackerIo(e)),
        };

        let parsed: TrackingData =
            serde_json::from_str(&content).map_err(FatalError::TrackerParse)?;
        *self.data.write() = parsed;
        Ok(())
    }

    fn save(&self) -> Result<(), FatalError> {
        let content = {
            let data = self.data.read();
            serde_json::to_string_pretty(&*data).map_err(FatalError::TrackerParse)?
        };

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        std::fs::write(&tmp_path, content).map_err(FatalError::TrackerIo)?;
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(FatalError::TrackerIo(e));
        }
        Ok(())
    }

    pub fn read_status(&self, filename: &str) -> (Status, HashStatus) {
        let basename = basename(filename);
        match self.data.read().get(&basename) {
            Some(fs) => (fs.status, fs.hash_status),
            None => (Status::NotStarted, HashStatus::Unverified),
        }
    }

    pub fn write_status(
        &self,
        filename: &str,
        status: Status,
        hash_status: HashStatus,
    ) -> Result<(), FatalError> {
        let basename = basename(filename);
        self.data.write().insert(basename, FileStatus { status, hash_status });
        self.save()
    }

    pub fn all_statuses(&self) -> HashMap<String, FileStatus> {
        self.data.read().clone()
    }

    pub fn files_not_imported(&self) -> Vec<String> {
        self.data
            .read()
            .iter()
            .filter(|(_, fs)| fs.status != Status::Imported)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn files_with_status(&self, status: Status) -> Vec<String> {
        self.data
            .read()
            .iter()
            .filter(|(_, fs)| fs.status == status)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn count_by_status(&self) -> HashMap<Status, usize> {
        let mut counts = HashMap::new();
        for fs in self.data.read().values() {
            *counts.entry(fs.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn is_imported(&self, filename: &str) -> bool {
        self.read_status(filename).0 == Status::Imported
    }

    pub fn needs_import(&self, filename: &str) -> bool {
        self.read_status(filename).0 != Status::Imported
    }

    /// Removes the tracking file and resets the in-memory map.
    pub fn clear(&self) -> Result<(), FatalError> {
        *self.data.write() = HashMap::new();
        std::fs::remove_file(&self.path).map_err(FatalError::TrackerIo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_files(&self) -> usize {
        self.data.read().len()
    }

    /// Resumption cleanup: any entry that is neither `Imported` nor
    /// `NotStarted` (i.e. was interrupted mid-run) is reset to
    /// `NotStarted`/`Unverified` so the next pass retries it from scratch.
    pub fn reset_incomplete(&self) -> Result<usize, FatalError> {
        let mut reset_count = 0;
        {
            let mut data = self.data.write();
            for fs in data.values_mut() {
                if fs.status != Status::Imported && fs.status != Status::NotStarted {
                    fs.status = Status::NotStarted;
                    fs.hash_status = HashStatus::Unverified;
                    reset_count += 1;
                }
            }
        }
        if reset_count > 0 {
            self.save()?;
        }
        Ok(reset_count)
    }
}

fn basename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("tracker-test-{}.json", rand::random::<u64>()));
        p
    }

    #[test]
    fn open_with_missing_file_starts_empty() {
        let path = temp_path();
        let tracker = Tracker::new(&path);
        tracker.open().unwrap();
        assert_eq!(tracker.total_files(), 0);
    }

    #[test]
    fn write_then_read_round_trips_through_disk() {
        let path = temp_path();
        let tracker = Tracker::new(&path);
        tracker.open().unwrap();
        tracker
            .write_status("account_balance.csv.gz", Status::Imported, HashStatus::Verified)
            .unwrap();

        let reopened = Tracker::new(&path);
        reopened.open().unwrap();
        let (status, hash_status) = reopened.read_status("account_balance.csv.gz");
        assert_eq!(status, Status::Imported);
        assert_eq!(hash_status, HashStatus::Verified);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn lookup_normalizes_to_basename() {
        let path = temp_path();
        let tracker = Tracker::new(&path);
        tracker.open().unwrap();
        tracker
            .write_status("subdir/a.csv.gz", Status::InProgress, HashStatus::Unverified)
            .unwrap();
        assert_eq!(tracker.read_status("a.csv.gz").0, Status::InProgress);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn corrupted_file_is_fatal() {
        let path = temp_path();
        std::fs::write(&path, b"not json").unwrap();
        let tracker = Tracker::new(&path);
        let err = tracker.open().unwrap_err();
        assert!(matches!(err, FatalError::TrackerParse(_)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn reset_incomplete_only_touches_interrupted_entries() {
        let path = temp_path();
        let tracker = Tracker::new(&path);
        tracker.open().unwrap();
        tracker.write_status("a.csv.gz", Status::Imported, HashStatus::Verified).unwrap();
        tracker.write_status("b.csv.gz", Status::InProgress, HashStatus::Unverified).unwrap();
        tracker.write_status("c.csv.gz", Status::FailedToImport, HashStatus::Unverified).unwrap();
        tracker.write_status("d.csv.gz", Status::NotStarted, HashStatus::Unverified).unwrap();

        let reset = tracker.reset_incomplete().unwrap();
        assert_eq!(reset, 2);
        assert_eq!(tracker.read_status("a.csv.gz").0, Status::Imported);
        assert_eq!(tracker.read_status("b.csv.gz").0, Status::NotStarted);
        assert_eq!(tracker.read_status("c.csv.gz").0, Status::NotStarted);
        assert_eq!(tracker.read_status("d.csv.gz").0, Status::NotStarted);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn count_by_status_tallies_correctly() {
        let path = temp_path();
        let tracker = Tracker::new(&path);
        tracker.open().unwrap();
        tracker.write_status("a.csv.gz", Status::Imported, HashStatus::Verified).unwrap();
        tracker.write_status("b.csv.gz", Status::Imported, HashStatus::Verified).unwrap();
        tracker.write_status("c.csv.gz", Status::NotStarted, HashStatus::Unverified).unwrap();

        let counts = tracker.count_by_status();
        assert_eq!(counts.get(&Status::Imported), Some(&2));
        assert_eq!(counts.get(&Status::NotStarted), Some(&1));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn clear_removes_file_and_resets_memory() {
        let path = temp_path();
        let tracker = Tracker::new(&path);
        tracker.open().unwrap();
        tracker.write_status("a.csv.gz", Status::Imported, HashStatus::Verified).unwrap();
        tracker.clear().unwrap();
        assert_eq!(tracker.total_files(), 0);
        assert!(!path.exists());
    }
}
