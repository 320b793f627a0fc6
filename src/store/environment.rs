//! The environment: one repository directory, its databases and the engine
//! core they share.
//!
//! An environment is configured while offline (`add_database`), recovered by
//! `open` and then serves reads, writes and transactions until `close`. Work
//! that keeps the repository healthy (compaction, checkpoints, garbage
//! collection, backups) is planned and run one task per `step`, either by
//! background workers or by the caller directly.

use std::fs;
use std::sync::{Arc, RwLock};

use super::backup;
use super::database::Database;
use super::recovery;
use super::sequence::Sequence;
use super::state::{EnvState, Status};
use super::transaction::Transaction;
use super::txn::TxManager;
use crate::config::{DatabaseConfig, EnvConfig};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::scheduler::plan::{PlanInput, Planner, Task};
use crate::store::compression::Compression;
use crate::store::value;
use crate::wal::{LogPool, LOG_DIR};

pub const VERSION: &str = "2.2";

/// Engine core shared by every database handle and transaction of one open
/// environment.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) seq: Arc<Sequence>,
    pub(crate) txm: TxManager,
    pub(crate) log: LogPool,
    pub(crate) state: Arc<EnvState>,
}

struct Opened {
    shared: Arc<Shared>,
    databases: Vec<Arc<Database>>,
    lock: FileLock,
}

/// Point-in-time engine gauges.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub databases: usize,
    pub nodes: usize,
    pub garbage_nodes: usize,
    pub memory_used: usize,
    pub transactions: usize,
    pub shadows: usize,
    pub log_files: usize,
    pub log_records: u64,
    pub lsn: u64,
}

pub struct Environment {
    config: EnvConfig,
    /// Status of the current (or last) open; replaced on every open so
    /// handles from a previous open stay offline.
    state: RwLock<Arc<EnvState>>,
    registry: RwLock<Vec<(String, DatabaseConfig)>>,
    open: RwLock<Option<Opened>>,
    planner: Planner,
}

impl Environment {
    pub fn new(config: EnvConfig) -> Self {
        Self {
            config,
            state: RwLock::new(Arc::new(EnvState::new())),
            registry: RwLock::new(Vec::new()),
            open: RwLock::new(None),
            planner: Planner::new(),
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn status(&self) -> Status {
        self.state().map(|s| s.status()).unwrap_or(Status::Malfunction)
    }

    /// Message of the failure that malfunctioned the engine, if any.
    pub fn error(&self) -> Option<String> {
        self.state().ok().and_then(|s| s.error())
    }

    fn state(&self) -> Result<Arc<EnvState>> {
        Ok(Arc::clone(&*self.state.read()?))
    }

    /// Registers a database. Only allowed while the environment is offline.
    pub fn add_database(&self, name: &str, config: DatabaseConfig) -> Result<()> {
        if self.status() != Status::Offline {
            return Err(Error::InvalidState(format!(
                "databases can only be added offline (environment is {})",
                self.status()
            )));
        }
        if name.is_empty() || name.contains(['/', '\\', '.']) || name == LOG_DIR {
            return Err(Error::InvalidInput(format!("invalid database name: {:?}", name)));
        }
        config.schema.validate()?;
        Compression::parse(&config.compression)?;

        let mut registry = self.registry.write()?;
        if registry.iter().any(|(n, _)| n == name) {
            return Err(Error::InvalidInput(format!("database {} already exists", name)));
        }
        registry.push((name.to_string(), config));
        Ok(())
    }

    /// Recovers the repository and brings the environment online.
    pub fn open(&self) -> Result<()> {
        let mut open = self.open.write()?;
        if open.is_some() {
            return Err(Error::InvalidState(format!("environment is {}", self.status())));
        }

        fs::create_dir_all(&self.config.dir)?;
        let lock = FileLock::lock_dir(&self.config.dir)?;

        let state = Arc::new(EnvState::new());
        state.set_status(Status::Recover);
        *self.state.write()? = Arc::clone(&state);

        let seq = Arc::new(Sequence::new());
        let shared = Arc::new(Shared {
            txm: TxManager::new(Arc::clone(&seq)),
            log: LogPool::new(self.config.dir.join(LOG_DIR), self.config.log.clone(), Arc::clone(&seq)),
            seq,
            state: Arc::clone(&state),
        });

        let registry = self.registry.read()?.clone();
        let recovered = recovery::recover(&self.config, &registry, &shared).and_then(|databases| {
            if let Some(root) = &self.config.backup_path {
                backup::recover(root, &shared.seq)?;
            }
            Ok(databases)
        });
        let databases = match recovered {
            Ok(databases) => databases,
            Err(e) => {
                tracing::error!(dir = %self.config.dir.display(), error = %e, "Recovery failed");
                state.set_status(Status::Offline);
                return Err(e);
            }
        };

        state.set_status(Status::Online);
        tracing::info!(
            dir = %self.config.dir.display(),
            databases = databases.len(),
            lsn = shared.seq.lsn(),
            "Environment online"
        );
        *open = Some(Opened {
            shared,
            databases,
            lock,
        });
        Ok(())
    }

    /// Takes the environment offline. Open transactions and cursors of this
    /// session fail from here on.
    pub fn close(&self) -> Result<()> {
        let Some(opened) = self.open.write()?.take() else {
            return Ok(());
        };
        let state = &opened.shared.state;
        let malfunction = state.status() == Status::Malfunction;
        state.set_status(Status::Shutdown);

        let closed = opened.shared.log.close();
        opened.lock.unlock();
        state.set_status(Status::Offline);
        if malfunction {
            tracing::warn!(error = ?state.error(), "Environment closed after malfunction");
        } else {
            tracing::info!(dir = %self.config.dir.display(), "Environment offline");
        }
        closed
    }

    fn opened(&self) -> Result<(Arc<Shared>, Vec<Arc<Database>>)> {
        match self.open.read()?.as_ref() {
            Some(opened) => Ok((Arc::clone(&opened.shared), opened.databases.clone())),
            None => Err(Error::InvalidState("environment is offline".to_string())),
        }
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        let (shared, databases) = self.opened()?;
        shared.state.check_online()?;
        databases
            .into_iter()
            .find(|db| db.name() == name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown database {}", name)))
    }

    pub fn databases(&self) -> Result<Vec<Arc<Database>>> {
        Ok(self.opened()?.1)
    }

    pub fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.opened()?.0, false)
    }

    /// Begins a transaction that can only read.
    pub fn begin_read_only(&self) -> Result<Transaction> {
        Transaction::begin(self.opened()?.0, true)
    }

    /// Requests that everything committed so far be written to node files.
    /// The scheduler carries it out; `checkpointing` turns false when done.
    pub fn checkpoint(&self) -> Result<()> {
        let (shared, _) = self.opened()?;
        shared.state.check_mutable()?;
        let lsn = shared.seq.lsn();
        shared.state.set_checkpoint(lsn);
        tracing::info!(lsn, "Checkpoint requested");
        Ok(())
    }

    pub fn checkpointing(&self) -> bool {
        self.state().map(|s| s.checkpoint() != 0).unwrap_or(false)
    }

    /// Requests a backup into the configured backup path and returns its
    /// number. The scheduler runs it; `backup_active` turns false when done.
    pub fn backup(&self) -> Result<u64> {
        let (shared, _) = self.opened()?;
        shared.state.check_mutable()?;
        if self.config.backup_path.is_none() {
            return Err(Error::InvalidState("backup path is not configured".to_string()));
        }
        if shared.state.backup() != 0 {
            return Err(Error::InvalidState("a backup is already in progress".to_string()));
        }
        let bsn = shared.seq.next_bsn();
        shared.state.set_backup(bsn);
        tracing::info!(bsn, "Backup requested");
        Ok(bsn)
    }

    pub fn backup_active(&self) -> bool {
        self.state().map(|s| s.backup() != 0).unwrap_or(false)
    }

    /// Closes the current log file and starts a new one.
    pub fn rotate_log(&self) -> Result<()> {
        let (shared, _) = self.opened()?;
        shared.state.check_mutable()?;
        shared.log.rotate().map_err(|e| shared.state.escalate(e))
    }

    pub(crate) fn rotate_log_if_ready(&self) -> Result<bool> {
        let (shared, _) = self.opened()?;
        if shared.state.status() != Status::Online || !shared.log.rotate_ready() {
            return Ok(false);
        }
        shared.log.rotate().map_err(|e| shared.state.escalate(e))?;
        Ok(true)
    }

    /// Removes retired node files no reader holds and log files whose rows
    /// all live in node files. Returns the number of files removed.
    pub fn collect_garbage(&self) -> Result<usize> {
        let (shared, databases) = self.opened()?;
        shared.state.check_mutable()?;
        let mut removed = 0;
        for db in &databases {
            removed += db
                .tree()
                .collect_garbage()
                .map_err(|e| shared.state.malfunction(e))?;
        }
        removed += collect_log_garbage(&shared, &databases)?;
        Ok(removed)
    }

    /// Plans and runs at most one background task. Returns whether a task
    /// ran.
    pub fn step(&self) -> Result<bool> {
        let (shared, databases) = match self.opened() {
            Ok(opened) => opened,
            Err(_) => return Ok(false),
        };
        if shared.state.status() != Status::Online {
            return Ok(false);
        }

        let input = PlanInput {
            state: &shared.state,
            limits: &self.config.scheduler,
            databases: &databases,
            log: &shared.log,
            vlsn_min: shared.txm.vlsn_min(),
            lsn: shared.seq.lsn(),
            now: value::now(),
        };
        let Some(planned) = self.planner.plan(&input) else {
            return Ok(false);
        };
        tracing::debug!(task = planned.guard.class().name(), "Running task");

        match planned.task {
            Task::Compact { db, node } => {
                if let Some(stats) = db.compact_node(&node)? {
                    tracing::debug!(
                        db = db.name(),
                        node = node.id(),
                        rows = stats.rows,
                        successors = stats.successors,
                        "Node compacted"
                    );
                }
            }
            Task::NodeGc { db } => {
                db.tree()
                    .collect_garbage()
                    .map_err(|e| shared.state.malfunction(e))?;
            }
            Task::LogGc => {
                collect_log_garbage(&shared, &databases)?;
            }
            Task::Backup { bsn } => {
                let Some(root) = &self.config.backup_path else {
                    shared.state.finish_backup(bsn);
                    return Ok(true);
                };
                let result = backup::run(root, bsn, &shared, &databases);
                shared.state.finish_backup(bsn);
                if let Err(e) = result {
                    tracing::error!(bsn, error = %e, "Backup failed");
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    pub fn metrics(&self) -> Result<Metrics> {
        let (shared, databases) = self.opened()?;
        let mut metrics = Metrics {
            databases: databases.len(),
            transactions: shared.txm.count(),
            shadows: shared.txm.shadows(),
            log_files: shared.log.count(),
            log_records: shared.log.records(),
            lsn: shared.seq.lsn(),
            ..Default::default()
        };
        for db in &databases {
            metrics.nodes += db.tree().len();
            metrics.garbage_nodes += db.tree().garbage_len();
            metrics.memory_used += db.tree().used();
        }
        Ok(metrics)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Environment close failed");
        }
    }
}

/// Removes closed log files older than everything still held in memory.
/// Runs under the commit lock so no commit lands between the scan and the
/// removal.
fn collect_log_garbage(shared: &Shared, databases: &[Arc<Database>]) -> Result<usize> {
    let _commit = shared.seq.commit_lock()?;
    let lsn_min = databases.iter().filter_map(|db| db.tree().lsn_min_memory()).min();
    shared
        .log
        .collect_garbage(lsn_min)
        .map_err(|e| shared.state.escalate(e))
}
