//! Exclusive repository lock.
//!
//! An environment holds `sophdb.lock` in its directory for as long as it is
//! open, so a second process (or a second `Environment` in the same process)
//! cannot recover or write the same repository concurrently.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

pub const LOCK_FILE: &str = "sophdb.lock";

#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if needed and takes an exclusive, non-blocking
    /// lock on it. The file holds the owner's process id.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::LockError)?;

        Self::try_lock(&file).map_err(Error::LockError)?;

        writeln!(file, "{}", std::process::id()).map_err(Error::LockError)?;
        file.flush().map_err(Error::LockError)?;

        Ok(Self { _file: file, path })
    }

    /// Locks `<dir>/sophdb.lock`.
    pub fn lock_dir(dir: &Path) -> Result<Self> {
        Self::lock(dir.join(LOCK_FILE))
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        Ok(())
    }

    /// Releases the lock. The file itself is left in place.
    pub fn unlock(self) {}

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_lock_records_pid() {
        let tmp = TempDir::new().unwrap();
        let lock = FileLock::lock_dir(tmp.path()).unwrap();

        assert_eq!(lock.path(), tmp.path().join(LOCK_FILE));
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
        lock.unlock();
    }

    #[test]
    fn test_double_lock() {
        let tmp = TempDir::new().unwrap();
        let _first = FileLock::lock_dir(tmp.path()).unwrap();
        assert!(matches!(
            FileLock::lock_dir(tmp.path()),
            Err(Error::LockError(_))
        ));
    }

    #[test]
    fn test_relock_after_drop() {
        let tmp = TempDir::new().unwrap();
        {
            let _lock = FileLock::lock_dir(tmp.path()).unwrap();
        }
        assert!(FileLock::lock_dir(tmp.path()).is_ok());
    }
}
