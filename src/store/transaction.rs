//! Multi-statement transactions.

use std::collections::HashMap;
use std::sync::Arc;

use super::cursor::Cursor;
use super::database::Database;
use super::environment::Shared;
use super::iterator::Order;
use super::tree::Tree;
use super::txn::{Lookup, TxId, TxState};
use super::value::{self, Value};
use crate::encoding::Datum;
use crate::error::Result;
use crate::Error;

/// Commits transaction `id` of the manager in `shared`.
///
/// Under the commit lock: prepare against the trees `tree_of` resolves,
/// append every write to the log under one lsn, insert the rows into their
/// nodes and finally publish the lsn. `Lock` leaves the transaction intact
/// for a retry; `Rollback` has already rolled it back.
pub(crate) fn commit<'a, F>(shared: &Shared, id: u64, tree_of: F) -> Result<TxState>
where
    F: Fn(u32) -> Option<&'a Tree>,
{
    shared.state.check_mutable()?;
    let seq = &shared.seq;
    let _commit = seq.commit_lock()?;

    let state = shared.txm.prepare(id, |dsn, key, vlsn| match tree_of(dsn) {
        Some(tree) => tree.has_newer(key, vlsn),
        None => Ok(false),
    })?;
    match state {
        TxState::Lock => return Ok(TxState::Lock),
        TxState::Rollback => {
            shared.txm.rollback(id)?;
            return Ok(TxState::Rollback);
        }
        _ => {}
    }

    let writes = shared.txm.writes(id)?;
    if writes.is_empty() {
        shared.txm.commit(id, None)?;
        return Ok(TxState::Commit);
    }

    let lsn = seq.lsn() + 1;
    let timestamp = value::now();
    let rows: Vec<(u32, Arc<Value>)> = writes
        .iter()
        .map(|(dsn, row)| (*dsn, row.committed(lsn, timestamp)))
        .collect();

    let savepoint = shared
        .log
        .write(lsn, &rows)
        .map_err(|e| shared.state.malfunction(e))?;
    for (dsn, row) in &rows {
        let applied = tree_of(*dsn)
            .ok_or_else(|| Error::InvalidState(format!("database {} is not open", dsn)))
            .and_then(|tree| tree.set(Arc::clone(row)));
        if let Err(e) = applied {
            let e = match savepoint {
                Some(sp) => shared.log.rollback(sp, e),
                None => e,
            };
            return Err(shared.state.malfunction(e));
        }
    }
    shared.txm.commit(id, Some(lsn))?;

    tracing::debug!(tx = id, lsn, rows = rows.len(), "Commit applied");
    Ok(TxState::Commit)
}

/// A transaction spanning any number of databases of one environment.
///
/// Reads see the snapshot taken at begin plus the transaction's own writes.
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    shared: Arc<Shared>,
    tx: TxId,
    databases: HashMap<u32, Arc<Database>>,
    done: bool,
}

impl Transaction {
    pub(crate) fn begin(shared: Arc<Shared>, read_only: bool) -> Result<Self> {
        shared.state.check_online()?;
        let tx = shared.txm.begin(read_only, None)?;
        Ok(Self {
            shared,
            tx,
            databases: HashMap::new(),
            done: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.tx.id
    }

    /// Snapshot lsn.
    pub fn vlsn(&self) -> u64 {
        self.tx.vlsn
    }

    /// Manager state, `None` once committed or rolled back.
    pub fn state(&self) -> Option<TxState> {
        self.shared.txm.state(self.tx.id)
    }

    fn attach(&mut self, db: &Arc<Database>) -> Result<()> {
        if self.done {
            return Err(Error::InvalidState(format!(
                "transaction {} is finished",
                self.tx.id
            )));
        }
        if !Arc::ptr_eq(db.shared(), &self.shared) {
            return Err(Error::InvalidInput(format!(
                "database '{}' belongs to another environment",
                db.name()
            )));
        }
        self.databases
            .entry(db.dsn())
            .or_insert_with(|| Arc::clone(db));
        Ok(())
    }

    fn write(&mut self, db: &Arc<Database>, row: Value) -> Result<()> {
        self.shared.state.check_mutable()?;
        self.attach(db)?;
        self.shared.txm.set(self.tx.id, db.dsn(), row)
    }

    pub fn set(&mut self, db: &Arc<Database>, key: &[Datum], value: &[Datum]) -> Result<()> {
        let row = Value::set(db.encode_key(key)?, db.schema().encode_value(value)?);
        self.write(db, row)
    }

    pub fn delete(&mut self, db: &Arc<Database>, key: &[Datum]) -> Result<()> {
        let row = Value::delete(db.encode_key(key)?);
        self.write(db, row)
    }

    /// One upsert per key and transaction; a second one is rejected with
    /// `InvalidOperation`.
    pub fn upsert(&mut self, db: &Arc<Database>, key: &[Datum], delta: &[Datum]) -> Result<()> {
        let row = db.upsert_row(key, delta)?;
        self.write(db, row)
    }

    /// Reads `key` at the snapshot, seeing this transaction's own writes.
    /// The read is tracked: a concurrent commit of `key` makes this
    /// transaction roll back.
    pub fn get(&mut self, db: &Arc<Database>, key: &[Datum]) -> Result<Option<Vec<Datum>>> {
        self.shared.state.check_online()?;
        self.attach(db)?;
        let key = db.encode_key(key)?;
        let local = match self.shared.txm.get(self.tx.id, db.dsn(), &key)? {
            Lookup::Miss => None,
            Lookup::Deleted => return Ok(None),
            Lookup::Found(row) => Some(row),
        };
        let found = db.read(&key, self.tx.vlsn, local)?;
        found.map(|v| db.schema().decode_value(v.data())).transpose()
    }

    /// Iterates at the snapshot with this transaction's writes merged in.
    /// Keys read through a cursor are not tracked for conflicts.
    pub fn cursor(&self, db: &Arc<Database>, order: Order, key: Option<&[Datum]>) -> Result<Cursor> {
        self.shared.state.check_online()?;
        let local: Vec<Arc<Value>> = if self.done {
            Vec::new()
        } else {
            self.shared
                .txm
                .writes(self.tx.id)?
                .into_iter()
                .filter(|(dsn, _)| *dsn == db.dsn())
                .map(|(_, row)| row)
                .collect()
        };
        db.cursor_at(order, key, self.tx.vlsn, local)
    }

    /// Tries to commit. `Lock` means a concurrent transaction holds one of
    /// the keys; the transaction stays open and `commit` may be retried.
    pub fn commit(&mut self) -> Result<TxState> {
        if self.done {
            return Err(Error::InvalidState(format!(
                "transaction {} is finished",
                self.tx.id
            )));
        }
        let databases = &self.databases;
        let state = commit(&self.shared, self.tx.id, |dsn| {
            databases.get(&dsn).map(|db| db.tree())
        })?;
        if state != TxState::Lock {
            self.done = true;
        }
        Ok(state)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.shared.txm.rollback(self.tx.id)
    }

    /// Whether this transaction is part of a wait cycle and must give up.
    pub fn deadlock(&self) -> Result<bool> {
        self.shared.txm.deadlock(self.tx.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.shared.txm.rollback(self.tx.id) {
                tracing::warn!(tx = self.tx.id, error = %e, "Rollback on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, EnvConfig};
    use crate::store::Environment;
    use crate::tmpfs::TempDir;

    fn key(k: &str) -> Vec<Datum> {
        vec![Datum::from(k)]
    }

    fn env(dir: &TempDir) -> Result<(Environment, Arc<Database>)> {
        let env = Environment::new(EnvConfig::new(dir.path()));
        env.add_database("test", DatabaseConfig::default())?;
        env.open()?;
        let db = env.database("test")?;
        Ok((env, db))
    }

    #[test]
    fn test_read_your_writes() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = env(&tmp)?;
        db.set(&key("a"), &key("old"))?;

        let mut tx = env.begin()?;
        tx.set(&db, &key("a"), &key("new"))?;
        tx.set(&db, &key("b"), &key("b"))?;
        tx.delete(&db, &key("c"))?;
        assert_eq!(tx.get(&db, &key("a"))?, Some(key("new")));
        assert_eq!(tx.get(&db, &key("c"))?, None);
        assert_eq!(db.get(&key("a"))?, Some(key("old")));

        let keys: Vec<Vec<Datum>> = tx
            .cursor(&db, Order::Gte, None)?
            .map(|row| row.map(|(k, _)| k))
            .collect::<Result<_>>()?;
        assert_eq!(keys, vec![key("a"), key("b")]);

        assert_eq!(tx.commit()?, TxState::Commit);
        assert_eq!(db.get(&key("a"))?, Some(key("new")));
        assert_eq!(db.get(&key("b"))?, Some(key("b")));
        Ok(())
    }

    #[test]
    fn test_snapshot_isolation() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = env(&tmp)?;
        db.set(&key("k"), &key("v1"))?;

        let mut reader = env.begin_read_only()?;
        db.set(&key("k"), &key("v2"))?;
        db.set(&key("other"), &key("x"))?;

        assert_eq!(reader.get(&db, &key("k"))?, Some(key("v1")));
        assert_eq!(reader.get(&db, &key("other"))?, None);
        assert_eq!(reader.cursor(&db, Order::Gte, None)?.count(), 1);
        assert!(reader.set(&db, &key("k"), &key("v3")).is_err());
        assert_eq!(reader.commit()?, TxState::Commit);
        Ok(())
    }

    #[test]
    fn test_concurrent_get_then_set_conflict() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = env(&tmp)?;

        let mut t1 = env.begin()?;
        let mut t2 = env.begin()?;
        assert_eq!(t1.get(&db, &key("x"))?, None);
        assert_eq!(t2.get(&db, &key("x"))?, None);
        t1.set(&db, &key("x"), &key("t1"))?;
        t2.set(&db, &key("x"), &key("t2"))?;

        assert_eq!(t1.commit()?, TxState::Commit);
        assert_eq!(t2.commit()?, TxState::Rollback);
        assert_eq!(db.get(&key("x"))?, Some(key("t1")));
        assert!(t2.commit().is_err());
        Ok(())
    }

    #[test]
    fn test_lock_then_retry() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = env(&tmp)?;

        let mut t1 = env.begin()?;
        let mut t2 = env.begin()?;
        t1.set(&db, &key("x"), &key("t1"))?;
        t2.set(&db, &key("y"), &key("t2"))?;
        t2.set(&db, &key("x"), &key("t2"))?;

        assert_eq!(t2.commit()?, TxState::Lock);
        assert_eq!(t2.state(), Some(TxState::Lock));
        t1.rollback()?;
        assert_eq!(t2.commit()?, TxState::Commit);
        assert_eq!(db.get(&key("x"))?, Some(key("t2")));
        Ok(())
    }

    #[test]
    fn test_deadlock_detection() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = env(&tmp)?;

        let mut t1 = env.begin()?;
        let mut t2 = env.begin()?;
        t1.set(&db, &key("a"), &key("1"))?;
        t2.set(&db, &key("b"), &key("2"))?;
        t1.set(&db, &key("b"), &key("1"))?;
        t2.set(&db, &key("a"), &key("2"))?;

        assert_eq!(t1.commit()?, TxState::Lock);
        assert_eq!(t2.commit()?, TxState::Lock);
        assert!(t1.deadlock()?);
        assert!(t2.deadlock()?);

        t2.rollback()?;
        assert!(!t1.deadlock()?);
        assert_eq!(t1.commit()?, TxState::Commit);
        Ok(())
    }

    #[test]
    fn test_drop_rolls_back() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = env(&tmp)?;
        {
            let mut tx = env.begin()?;
            tx.set(&db, &key("x"), &key("lost"))?;
        }
        assert_eq!(db.get(&key("x"))?, None);
        db.set(&key("x"), &key("kept"))?;
        assert_eq!(db.get(&key("x"))?, Some(key("kept")));
        Ok(())
    }

    #[test]
    fn test_multi_database_commit() -> Result<()> {
        let tmp = TempDir::new()?;
        let env = Environment::new(EnvConfig::new(tmp.path()));
        env.add_database("left", DatabaseConfig::default())?;
        env.add_database("right", DatabaseConfig::default())?;
        env.open()?;
        let left = env.database("left")?;
        let right = env.database("right")?;

        let mut tx = env.begin()?;
        tx.set(&left, &key("k"), &key("l"))?;
        tx.set(&right, &key("k"), &key("r"))?;
        assert_eq!(tx.commit()?, TxState::Commit);

        assert_eq!(left.get(&key("k"))?, Some(key("l")));
        assert_eq!(right.get(&key("k"))?, Some(key("r")));
        Ok(())
    }
}
