//! Task planning.
//!
//! Each `step` asks the planner for one task. Classes are tried in priority
//! order (checkpoint, node gc, backup, expire, gc, compaction); a class is
//! skipped while it already runs at its concurrency limit. Within a class
//! databases are visited round-robin so one busy database cannot starve the
//! others.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::store::database::Database;
use crate::store::node::{Node, SPLIT};
use crate::store::state::{EnvState, TaskClass, TaskGuard};
use crate::wal::LogPool;

/// Work the planner hands to a worker.
pub enum Task {
    /// Compacts one node: for checkpoints, expiry, gc and memory pressure.
    Compact { db: Arc<Database>, node: Arc<Node> },
    /// Removes retired node files of a database.
    NodeGc { db: Arc<Database> },
    /// Removes log files fully persisted in node files.
    LogGc,
    Backup { bsn: u64 },
}

pub struct Planned<'a> {
    pub task: Task,
    /// Holds the class slot until the task finishes.
    pub guard: TaskGuard<'a>,
}

/// Snapshot of what the planner decides on.
pub struct PlanInput<'a> {
    pub state: &'a EnvState,
    pub limits: &'a SchedulerConfig,
    pub databases: &'a [Arc<Database>],
    pub log: &'a LogPool,
    /// Oldest snapshot any transaction reads at.
    pub vlsn_min: u64,
    pub lsn: u64,
    pub now: u32,
}

#[derive(Debug, Default)]
pub struct Planner {
    next: AtomicUsize,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan<'a>(&self, input: &PlanInput<'a>) -> Option<Planned<'a>> {
        for class in TaskClass::PRIORITY {
            let Some(guard) = input.state.try_start(class, limit(input.limits, class)) else {
                continue;
            };
            let task = match class {
                TaskClass::Checkpoint => self.checkpoint(input),
                TaskClass::NodeGc => self.node_gc(input),
                TaskClass::Backup => match input.state.backup() {
                    0 => None,
                    bsn => Some(Task::Backup { bsn }),
                },
                TaskClass::Expire => self.expire(input),
                TaskClass::Gc => {
                    // Versions a live snapshot can still read must survive,
                    // so gc waits until every snapshot is current.
                    if input.vlsn_min < input.lsn {
                        None
                    } else {
                        self.pick(input, |db, node| {
                            node.dup_percent() >= db.config().compaction.gc_percent.max(1)
                        })
                    }
                }
                TaskClass::Compaction => self.pick(input, |db, node| {
                    node.used() >= db.config().compaction.memory_threshold
                }),
            };
            if let Some(task) = task {
                return Some(Planned { task, guard });
            }
        }
        None
    }

    fn checkpoint(&self, input: &PlanInput<'_>) -> Option<Task> {
        let target = input.state.checkpoint();
        if target == 0 {
            return None;
        }
        let pending = |node: &Node| node.lsn_min_memory().is_some_and(|lsn| lsn <= target);
        if let Some(task) = self.pick(input, |_, node| pending(node)) {
            return Some(task);
        }

        // Nodes still being compacted count as pending.
        let busy = input
            .databases
            .iter()
            .filter_map(|db| db.tree().nodes().ok())
            .flatten()
            .any(|node| pending(&node));
        if !busy {
            input.state.set_checkpoint(0);
            tracing::info!(lsn = target, "Checkpoint complete");
        }
        None
    }

    fn node_gc(&self, input: &PlanInput<'_>) -> Option<Task> {
        if let Some(db) = self.visit(input.databases).find(|db| db.tree().garbage_ready()) {
            self.advance(input.databases, db);
            return Some(Task::NodeGc { db: Arc::clone(db) });
        }
        let lsn_min = input
            .databases
            .iter()
            .filter_map(|db| db.tree().lsn_min_memory())
            .min();
        (input.log.collectable(lsn_min) > 0).then_some(Task::LogGc)
    }

    /// Picks a node holding rows past its database's ttl. A database with
    /// none is not scanned again for one expire period.
    fn expire(&self, input: &PlanInput<'_>) -> Option<Task> {
        for db in self.visit(input.databases) {
            let Some(cutoff) = db.expire_cutoff() else { continue };
            let period = db.config().compaction.expire_period.as_secs();
            if u64::from(input.now.saturating_sub(db.expired_at())) < period {
                continue;
            }
            let Ok(nodes) = db.tree().nodes() else { continue };
            let expired = nodes
                .into_iter()
                .find(|node| idle(node) && node.ts_min().is_some_and(|ts| ts < cutoff));
            match expired {
                Some(node) => {
                    self.advance(input.databases, db);
                    return Some(Task::Compact {
                        db: Arc::clone(db),
                        node,
                    });
                }
                None => db.set_expired_at(input.now),
            }
        }
        None
    }

    /// First unlocked node matching `wanted`, visiting databases
    /// round-robin.
    fn pick<F>(&self, input: &PlanInput<'_>, mut wanted: F) -> Option<Task>
    where
        F: FnMut(&Database, &Node) -> bool,
    {
        for db in self.visit(input.databases) {
            let Ok(nodes) = db.tree().nodes() else { continue };
            if let Some(node) = nodes
                .into_iter()
                .find(|node| idle(node) && wanted(&**db, &**node))
            {
                self.advance(input.databases, db);
                return Some(Task::Compact {
                    db: Arc::clone(db),
                    node,
                });
            }
        }
        None
    }

    fn visit<'d>(&self, databases: &'d [Arc<Database>]) -> impl Iterator<Item = &'d Arc<Database>> {
        let n = databases.len();
        let start = if n == 0 { 0 } else { self.next.load(Ordering::Relaxed) % n };
        (0..n).map(move |i| &databases[(start + i) % n])
    }

    fn advance(&self, databases: &[Arc<Database>], picked: &Arc<Database>) {
        if let Some(i) = databases.iter().position(|db| Arc::ptr_eq(db, picked)) {
            self.next.store(i + 1, Ordering::Relaxed);
        }
    }
}

/// Neither held by a compaction nor already replaced by one.
fn idle(node: &Node) -> bool {
    !node.is_locked() && !node.has_flag(SPLIT)
}

fn limit(limits: &SchedulerConfig, class: TaskClass) -> usize {
    match class {
        TaskClass::Checkpoint => limits.checkpoint_limit,
        TaskClass::NodeGc => 1,
        TaskClass::Backup => limits.backup_limit,
        TaskClass::Expire => limits.expire_limit,
        TaskClass::Gc => limits.gc_limit,
        TaskClass::Compaction => limits.compaction_limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionConfig, DatabaseConfig, EnvConfig};
    use crate::encoding::Datum;
    use crate::store::Environment;
    use crate::tmpfs::TempDir;
    use crate::Result;

    fn key(k: &str) -> Vec<Datum> {
        vec![Datum::from(k)]
    }

    struct Fixture {
        env: Environment,
        databases: Vec<Arc<Database>>,
        _tmp: TempDir,
    }

    fn fixture(config: DatabaseConfig) -> Result<Fixture> {
        let tmp = TempDir::new()?;
        let env = Environment::new(EnvConfig::new(tmp.path()));
        env.add_database("a", config.clone())?;
        env.add_database("b", config)?;
        env.open()?;
        let databases = env.databases()?;
        Ok(Fixture {
            env,
            databases,
            _tmp: tmp,
        })
    }

    fn plan_class(f: &Fixture, limits: &SchedulerConfig) -> Option<(TaskClass, Task)> {
        let db = &f.databases[0];
        let shared = db.shared();
        let input = PlanInput {
            state: &shared.state,
            limits,
            databases: &f.databases,
            log: &shared.log,
            vlsn_min: shared.txm.vlsn_min(),
            lsn: shared.seq.lsn(),
            now: crate::store::value::now(),
        };
        Planner::new()
            .plan(&input)
            .map(|planned| (planned.guard.class(), planned.task))
    }

    #[test]
    fn test_idle_plans_nothing() -> Result<()> {
        let f = fixture(DatabaseConfig::default())?;
        assert!(plan_class(&f, &SchedulerConfig::default()).is_none());
        Ok(())
    }

    #[test]
    fn test_checkpoint_outranks_compaction() -> Result<()> {
        let config = DatabaseConfig::default()
            .compaction(CompactionConfig::default().memory_threshold(1));
        let f = fixture(config)?;
        f.databases[1].set(&key("k"), &key("v"))?;

        let (class, _) = plan_class(&f, &SchedulerConfig::default()).unwrap();
        assert_eq!(class, TaskClass::Compaction);

        f.env.checkpoint()?;
        let (class, task) = plan_class(&f, &SchedulerConfig::default()).unwrap();
        assert_eq!(class, TaskClass::Checkpoint);
        match task {
            Task::Compact { db, .. } => assert_eq!(db.name(), "b"),
            _ => panic!("expected a compaction"),
        }

        // A class at its limit is passed over.
        let limits = SchedulerConfig {
            checkpoint_limit: 0,
            compaction_limit: 0,
            ..SchedulerConfig::default()
        };
        assert!(plan_class(&f, &limits).is_none());
        Ok(())
    }

    #[test]
    fn test_checkpoint_completes_when_memory_is_flushed() -> Result<()> {
        let f = fixture(DatabaseConfig::default())?;
        f.databases[0].set(&key("k"), &key("v"))?;
        f.env.checkpoint()?;
        assert!(f.env.checkpointing());

        f.databases[0].compact()?;
        let planned = plan_class(&f, &SchedulerConfig::default());
        assert!(!f.env.checkpointing());
        // Retired node file is next.
        assert!(matches!(planned, Some((TaskClass::NodeGc, Task::NodeGc { .. }))));
        Ok(())
    }

    #[test]
    fn test_locked_node_is_skipped() -> Result<()> {
        let config = DatabaseConfig::default()
            .compaction(CompactionConfig::default().memory_threshold(1));
        let f = fixture(config)?;
        f.databases[0].set(&key("k"), &key("v"))?;

        let node = f.databases[0].tree().nodes()?[0].clone();
        assert!(node.lock());
        assert!(plan_class(&f, &SchedulerConfig::default()).is_none());
        node.unlock();
        assert!(plan_class(&f, &SchedulerConfig::default()).is_some());
        Ok(())
    }

    #[test]
    fn test_round_robin_across_databases() -> Result<()> {
        let config = DatabaseConfig::default()
            .compaction(CompactionConfig::default().memory_threshold(1));
        let f = fixture(config)?;
        for db in &f.databases {
            db.set(&key("k"), &key("v"))?;
        }

        let shared = f.databases[0].shared();
        let limits = SchedulerConfig::default();
        let planner = Planner::new();
        let input = PlanInput {
            state: &shared.state,
            limits: &limits,
            databases: &f.databases,
            log: &shared.log,
            vlsn_min: shared.txm.vlsn_min(),
            lsn: shared.seq.lsn(),
            now: crate::store::value::now(),
        };
        let names: Vec<String> = (0..4)
            .filter_map(|_| match planner.plan(&input)?.task {
                Task::Compact { db, .. } => Some(db.name().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "a", "b"]);
        Ok(())
    }
}
