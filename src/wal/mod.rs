//! Write-ahead log.
//!
//! Commits are appended to the current `<lfsn>.log` file before their rows
//! reach any memory index. Files are rotated after `rotate_wm` rows and a
//! rotated file is deleted once every row it holds has been compacted into
//! node files.

pub mod header;
pub mod recovery;
pub mod wal;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::store::sequence::Sequence;
use crate::store::value::Value;

pub use self::wal::{Batch, Record, ReplayIterator, Savepoint, Wal};

/// Name of the log directory inside the repository.
pub const LOG_DIR: &str = "log";

/// A rotated file kept until its rows are on disk elsewhere.
#[derive(Debug, Clone)]
struct Closed {
    lfsn: u64,
    path: PathBuf,
    lsn_max: u64,
}

#[derive(Debug, Default)]
struct Files {
    closed: VecDeque<Closed>,
    current: Option<Wal>,
}

/// The set of log files of one environment.
#[derive(Debug)]
pub struct LogPool {
    dir: PathBuf,
    config: LogConfig,
    seq: Arc<Sequence>,
    files: Mutex<Files>,
}

impl LogPool {
    pub fn new(dir: PathBuf, config: LogConfig, seq: Arc<Sequence>) -> Self {
        Self {
            dir,
            config,
            seq,
            files: Mutex::new(Files::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Registers a file found at recovery, already fully replayed.
    pub fn attach(&self, lfsn: u64, path: PathBuf, lsn_max: u64) -> Result<()> {
        self.seq.observe_lfsn(lfsn);
        self.files.lock()?.closed.push_back(Closed {
            lfsn,
            path,
            lsn_max,
        });
        Ok(())
    }

    /// Closes the current file and starts `<next lfsn>.log`.
    pub fn rotate(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut files = self.files.lock()?;
        let lfsn = self.seq.next_lfsn();
        let wal = Wal::create(&self.dir, lfsn)?;
        if let Some(old) = files.current.replace(wal) {
            old.sync()?;
            files.closed.push_back(Closed {
                lfsn: old.lfsn(),
                path: old.path().to_path_buf(),
                lsn_max: old.lsn_max(),
            });
        }
        tracing::info!(lfsn, "Rotated log");
        Ok(())
    }

    /// Whether the current file has reached the rotation watermark.
    pub fn rotate_ready(&self) -> bool {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.current.as_ref().map(|w| w.records()))
            .map(|records| records >= self.config.rotate_wm)
            .unwrap_or(false)
    }

    /// Appends one commit and returns the position to roll back to if
    /// applying it fails afterwards.
    pub fn write(&self, lsn: u64, rows: &[(u32, Arc<Value>)]) -> Result<Option<Savepoint>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let mut files = self.files.lock()?;
        let Some(wal) = files.current.as_mut() else {
            return Err(crate::Error::InvalidState("log is not open".to_string()));
        };
        let sp = wal.savepoint();
        if let Err(e) = wal.write(lsn, rows) {
            return Err(undo(wal, sp, e));
        }
        if self.config.sync {
            if let Err(e) = wal.sync() {
                return Err(undo(wal, sp, e));
            }
        }
        Ok(Some(sp))
    }

    /// Truncates the current file back to `sp` after applying a commit
    /// failed. Returns the error to report: `cause` once the frames are gone,
    /// a log error if they could not be removed.
    pub fn rollback(&self, sp: Savepoint, cause: Error) -> Error {
        let mut files = match self.files.lock() {
            Ok(files) => files,
            Err(e) => return e.into(),
        };
        match files.current.as_mut() {
            Some(wal) => undo(wal, sp, cause),
            None => cause,
        }
    }

    pub fn sync(&self) -> Result<()> {
        if let Some(wal) = self.files.lock()?.current.as_ref() {
            wal.sync()?;
        }
        Ok(())
    }

    /// Deletes rotated files whose rows are all older than `lsn_min`, the
    /// oldest lsn any memory index still holds (`None` when all memory is
    /// empty).
    pub fn collect_garbage(&self, lsn_min: Option<u64>) -> Result<usize> {
        let mut files = self.files.lock()?;
        let mut removed = 0;
        while let Some(file) = files.closed.front() {
            if lsn_min.is_some_and(|min| file.lsn_max >= min) {
                break;
            }
            std::fs::remove_file(&file.path).or_else(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })?;
            tracing::debug!(lfsn = file.lfsn, "Removed log file");
            files.closed.pop_front();
            removed += 1;
        }
        Ok(removed)
    }

    /// Rotated files `collect_garbage(lsn_min)` would delete.
    pub fn collectable(&self, lsn_min: Option<u64>) -> usize {
        self.files
            .lock()
            .map(|f| {
                f.closed
                    .iter()
                    .take_while(|c| !lsn_min.is_some_and(|min| c.lsn_max >= min))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Every log file, oldest first.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let files = self.files.lock()?;
        let mut paths: Vec<PathBuf> = files.closed.iter().map(|c| c.path.clone()).collect();
        if let Some(wal) = files.current.as_ref() {
            paths.push(wal.path().to_path_buf());
        }
        Ok(paths)
    }

    /// Number of log files.
    pub fn count(&self) -> usize {
        self.files
            .lock()
            .map(|f| f.closed.len() + usize::from(f.current.is_some()))
            .unwrap_or(0)
    }

    /// Rows in the current file.
    pub fn records(&self) -> u64 {
        self.files
            .lock()
            .ok()
            .and_then(|f| f.current.as_ref().map(|w| w.records()))
            .unwrap_or(0)
    }

    /// Syncs and closes the current file.
    pub fn close(&self) -> Result<()> {
        let mut files = self.files.lock()?;
        if let Some(wal) = files.current.take() {
            wal.sync()?;
            files.closed.push_back(Closed {
                lfsn: wal.lfsn(),
                path: wal.path().to_path_buf(),
                lsn_max: wal.lsn_max(),
            });
        }
        Ok(())
    }
}

/// Truncates a failed append. Frames that cannot be truncated would be
/// replayed as a commit, so that failure replaces `cause`.
fn undo(wal: &mut Wal, sp: Savepoint, cause: Error) -> Error {
    match wal.rollback(sp) {
        Ok(()) => cause,
        Err(e) => {
            tracing::error!(lfsn = sp.lfsn, error = %e, cause = %cause, "Log rollback failed");
            Error::CorruptedWal(format!("failed to truncate log {}: {} ({})", sp.lfsn, e, cause))
        }
    }
}
