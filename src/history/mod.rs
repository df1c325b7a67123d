//! Run history ledger.
//!
//! Every execution attempt is recorded as a [`RunRecord`] in a single JSON
//! file (an array, oldest first). The file is read by the catch-up engine and
//! by anything that wants to show past runs, so it stays human readable.
//!
//! Writes are copy-on-write: the whole array is serialized to a temp file in
//! the same directory and renamed over the original. Read-modify-write
//! cycles are serialized by a mutex within the process and by a
//! `<history>.lock` file across processes (the CLI and OS-fired runs write
//! concurrently). A lock file older than [`STALE_LOCK_AGE`] is evicted.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration as StdDuration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// How long a writer waits for another process to release the lock file.
const LOCK_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// A lock file this old belongs to a crashed writer.
pub const STALE_LOCK_AGE: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to read run history {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write run history {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("run history {} is malformed: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize run history: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("run history lock poisoned")]
    Poisoned,

    #[error("failed to lock run history {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("timed out waiting for run history lock {}", .path.display())]
    LockTimeout { path: PathBuf },
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Manual,
    Scheduled,
    Catchup,
}

impl TriggeredBy {
    /// Scheduled and catch-up runs have nobody watching.
    pub fn is_headless(self) -> bool {
        !matches!(self, Self::Manual)
    }
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Catchup => write!(f, "catchup"),
        }
    }
}

/// One execution attempt of a task.
///
/// `completed_at` is set exactly when `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub triggered_by: TriggeredBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    /// A fresh `running` record.
    pub fn start(task_name: impl Into<String>, triggered_by: TriggeredBy, at: DateTime<Utc>) -> Self {
        Self {
            task_name: task_name.into(),
            started_at: at,
            completed_at: None,
            status: RunStatus::Running,
            triggered_by,
            error: None,
        }
    }

    fn apply(&mut self, patch: RunPatch) {
        self.completed_at = Some(patch.completed_at);
        self.status = patch.status;
        self.error = patch.error;
    }
}

/// Completion data applied to the latest record of a task.
#[derive(Debug, Clone)]
pub struct RunPatch {
    completed_at: DateTime<Utc>,
    status: RunStatus,
    error: Option<String>,
}

impl RunPatch {
    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            completed_at: at,
            status: RunStatus::Completed,
            error: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            completed_at: at,
            status: RunStatus::Failed,
            error: Some(error.into()),
        }
    }
}

/// File-backed run history.
pub struct RunHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record (normally a `running` one from [`RunRecord::start`]).
    pub fn append(&self, record: RunRecord) -> Result<(), HistoryError> {
        let _guard = self.lock_for_write()?;
        let mut records = self.read()?;
        debug!(task = %record.task_name, trigger = %record.triggered_by, "appending run record");
        records.push(record);
        self.write(&records)
    }

    /// Patch the most recent record of `task_name`.
    ///
    /// Returns `false` without touching the file when the task has no
    /// records.
    pub fn update_latest(&self, task_name: &str, patch: RunPatch) -> Result<bool, HistoryError> {
        let _guard = self.lock_for_write()?;
        let mut records = self.read()?;

        // max_by_key keeps the last of equal maxima, i.e. the latest append.
        let latest = records
            .iter_mut()
            .filter(|r| r.task_name == task_name)
            .max_by_key(|r| r.started_at);

        match latest {
            Some(record) => {
                debug!(task = %task_name, status = %patch.status, "completing run record");
                record.apply(patch);
                self.write(&records)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All records, oldest first.
    pub fn load_all(&self) -> Result<Vec<RunRecord>, HistoryError> {
        let _guard = self.lock.lock().map_err(|_| HistoryError::Poisoned)?;
        let mut records = self.read()?;
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    /// Newest first, at most `n`.
    pub fn recent(&self, n: usize) -> Result<Vec<RunRecord>, HistoryError> {
        let mut records = self.load_all()?;
        records.reverse();
        records.truncate(n);
        Ok(records)
    }

    /// Newest first for a single task, at most `n`.
    pub fn recent_for(&self, task_name: &str, n: usize) -> Result<Vec<RunRecord>, HistoryError> {
        let mut records = self.load_all()?;
        records.retain(|r| r.task_name == task_name);
        records.reverse();
        records.truncate(n);
        Ok(records)
    }

    /// Start time of the task's most recent run, whatever its status.
    pub fn last_run(&self, task_name: &str) -> Result<Option<DateTime<Utc>>, HistoryError> {
        let records = self.load_all()?;
        Ok(latest_start(&records, task_name))
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Take the in-process mutex, then the cross-process lock file. The lock
    /// file comes first in the tuple so it is released before the mutex.
    fn lock_for_write(&self) -> Result<(LockFile, MutexGuard<'_, ()>), HistoryError> {
        let guard = self.lock.lock().map_err(|_| HistoryError::Poisoned)?;
        let lock_path = self.lock_path();
        let lock_err = |source| HistoryError::Lock {
            path: lock_path.clone(),
            source,
        };

        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(lock_err)?;
        }

        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok((LockFile { path: lock_path.clone() }, guard));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    evict_stale_lock(&lock_path);
                    if started.elapsed() > LOCK_TIMEOUT {
                        return Err(HistoryError::LockTimeout {
                            path: lock_path.clone(),
                        });
                    }
                    std::thread::sleep(StdDuration::from_millis(2));
                }
                Err(e) => return Err(lock_err(e)),
            }
        }
    }

    fn read(&self) -> Result<Vec<RunRecord>, HistoryError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HistoryError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| HistoryError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, records: &[RunRecord]) -> Result<(), HistoryError> {
        let write_err = |source| HistoryError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "history.json".to_string());
        let tmp_path = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let json = serde_json::to_vec_pretty(records)?;
        std::fs::write(&tmp_path, json).map_err(write_err)?;
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(write_err(e));
        }
        Ok(())
    }
}

/// Held while a process rewrites the history file.
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn evict_stale_lock(lock_path: &Path) {
    let age = std::fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
    if age.is_some_and(|age| age > STALE_LOCK_AGE) {
        warn!(path = %lock_path.display(), "Removing stale run history lock");
        let _ = std::fs::remove_file(lock_path);
    }
}

/// Start time of the newest record for `task_name` in `records`.
pub fn latest_start(records: &[RunRecord], task_name: &str) -> Option<DateTime<Utc>> {
    records
        .iter()
        .filter(|r| r.task_name == task_name)
        .map(|r| r.started_at)
        .max()
}
