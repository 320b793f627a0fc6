use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::error::Result;
use crate::Error;

/// Lifecycle of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Offline = 0,
    Recover = 1,
    Online = 2,
    Shutdown = 3,
    /// An I/O or consistency failure left the engine in an unknown state.
    /// Only a close and a fresh open (which runs recovery) leave it.
    Malfunction = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Status::Recover,
            2 => Status::Online,
            3 => Status::Shutdown,
            4 => Status::Malfunction,
            _ => Status::Offline,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Offline => "offline",
            Status::Recover => "recover",
            Status::Online => "online",
            Status::Shutdown => "shutdown",
            Status::Malfunction => "malfunction",
        };
        f.write_str(name)
    }
}

/// Background task classes in scheduling priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
    Checkpoint,
    NodeGc,
    Backup,
    Expire,
    Gc,
    Compaction,
}

impl TaskClass {
    pub const PRIORITY: [TaskClass; 6] = [
        TaskClass::Checkpoint,
        TaskClass::NodeGc,
        TaskClass::Backup,
        TaskClass::Expire,
        TaskClass::Gc,
        TaskClass::Compaction,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskClass::Checkpoint => "checkpoint",
            TaskClass::NodeGc => "node-gc",
            TaskClass::Backup => "backup",
            TaskClass::Expire => "expire",
            TaskClass::Gc => "gc",
            TaskClass::Compaction => "compaction",
        }
    }
}

/// Environment-wide mutable state shared by the API and background tasks.
#[derive(Debug, Default)]
pub struct EnvState {
    status: AtomicU8,
    error: RwLock<Option<String>>,
    /// Checkpoint target lsn, 0 when no checkpoint is pending.
    checkpoint: AtomicU64,
    /// Backup requested and not yet run, 0 when none.
    backup: AtomicU64,
    running: [AtomicUsize; 6],
}

impl EnvState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Last malfunction message.
    pub fn error(&self) -> Option<String> {
        self.error.read().ok().and_then(|e| e.clone())
    }

    /// Marks the engine malfunctioned and returns the error to propagate.
    pub fn malfunction(&self, err: Error) -> Error {
        let message = err.to_string();
        tracing::error!(error = %message, "Engine malfunction");
        if let Ok(mut error) = self.error.write() {
            *error = Some(message.clone());
        }
        self.set_status(Status::Malfunction);
        Error::Malfunction(message)
    }

    /// Escalates I/O failures hit during normal operation to a malfunction.
    pub fn escalate(&self, err: Error) -> Error {
        if err.is_io() {
            self.malfunction(err)
        } else {
            err
        }
    }

    /// Fails unless the environment accepts reads.
    pub fn check_online(&self) -> Result<()> {
        match self.status() {
            Status::Online => Ok(()),
            Status::Malfunction => Err(self.malfunction_error()),
            status => Err(Error::InvalidState(format!("environment is {}", status))),
        }
    }

    /// Fails unless the environment accepts writes.
    pub fn check_mutable(&self) -> Result<()> {
        self.check_online()
    }

    fn malfunction_error(&self) -> Error {
        Error::Malfunction(self.error().unwrap_or_else(|| "engine malfunction".to_string()))
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::SeqCst)
    }

    pub fn set_checkpoint(&self, lsn: u64) {
        self.checkpoint.store(lsn, Ordering::SeqCst);
    }

    pub fn backup(&self) -> u64 {
        self.backup.load(Ordering::SeqCst)
    }

    pub fn set_backup(&self, bsn: u64) {
        self.backup.store(bsn, Ordering::SeqCst);
    }

    /// Clears a pending backup request if it is still `bsn`.
    pub fn finish_backup(&self, bsn: u64) {
        let _ = self
            .backup
            .compare_exchange(bsn, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Tasks of `class` currently running.
    pub fn running(&self, class: TaskClass) -> usize {
        self.running[class.slot()].load(Ordering::SeqCst)
    }

    /// Claims a slot of `class` unless `limit` tasks already run.
    pub fn try_start(&self, class: TaskClass, limit: usize) -> Option<TaskGuard<'_>> {
        let counter = &self.running[class.slot()];
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()?;
        Some(TaskGuard { state: self, class })
    }
}

/// RAII guard for one running background task.
pub struct TaskGuard<'a> {
    state: &'a EnvState,
    class: TaskClass,
}

impl TaskGuard<'_> {
    pub fn class(&self) -> TaskClass {
        self.class
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.state.running[self.class.slot()].fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let state = EnvState::new();
        assert_eq!(state.status(), Status::Offline);
        assert!(matches!(state.check_online(), Err(Error::InvalidState(_))));

        state.set_status(Status::Online);
        assert!(state.check_mutable().is_ok());

        let err = state.malfunction(Error::InvalidData("bad page".to_string()));
        assert!(matches!(err, Error::Malfunction(_)));
        assert_eq!(state.status(), Status::Malfunction);
        assert!(state.error().unwrap().contains("bad page"));
        match state.check_mutable() {
            Err(Error::Malfunction(msg)) => assert!(msg.contains("bad page")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_task_guard_limits() {
        let state = EnvState::new();
        let first = state.try_start(TaskClass::Compaction, 2);
        let second = state.try_start(TaskClass::Compaction, 2);
        assert!(first.is_some() && second.is_some());
        assert!(state.try_start(TaskClass::Compaction, 2).is_none());
        assert!(state.try_start(TaskClass::Gc, 1).is_some());
        assert_eq!(state.running(TaskClass::Compaction), 2);

        drop(first);
        assert_eq!(state.running(TaskClass::Compaction), 1);
        assert!(state.try_start(TaskClass::Compaction, 2).is_some());
        assert!(state.try_start(TaskClass::Backup, 0).is_none());
    }

    #[test]
    fn test_backup_request_is_cleared_once() {
        let state = EnvState::new();
        state.set_backup(3);
        state.finish_backup(2);
        assert_eq!(state.backup(), 3);
        state.finish_backup(3);
        assert_eq!(state.backup(), 0);
    }
}
