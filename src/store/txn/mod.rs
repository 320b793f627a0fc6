//! Optimistic transaction manager.
//!
//! Every write or tracked read of a read-write transaction leaves a *shadow*
//! in a per-key chain, in arrival order. Nothing blocks: conflicts are found
//! at prepare time by looking at what sits ahead of each shadow.
//!
//! | nearest earlier write            | outcome    |
//! |----------------------------------|------------|
//! | none                             | validator  |
//! | committed after our snapshot     | `Rollback` |
//! | committed before our snapshot    | `Prepare`  |
//! | pending in a live transaction    | `Lock`     |
//!
//! Committing a transaction aborts every live transaction queued behind it
//! on any of its keys, so their next prepare rolls back. Committed shadows
//! are kept until no live transaction started before their commit.
//!
//! All state sits behind one mutex. Commit sequence numbers are assigned and
//! the commit lsn is published under it, so a transaction's snapshot lsn and
//! its snapshot csn always describe the same set of commits.

mod deadlock;
mod shadow;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use deadlock::WaitForGraph;
use shadow::{Predecessor, Shadow, ShadowIndex};

use crate::error::{Error, Result};
use crate::store::sequence::Sequence;
use crate::store::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Ready,
    /// Blocked behind a live writer; prepare may be retried.
    Lock,
    /// Lost a conflict; the transaction must be rolled back.
    Rollback,
    Prepare,
    Commit,
}

/// Result of a transaction-local point lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Not written by this transaction; read the tree.
    Miss,
    /// Written by this transaction (possibly an upsert delta).
    Found(Arc<Value>),
    /// Deleted by this transaction.
    Deleted,
}

/// Identity of a started transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxId {
    pub id: u64,
    /// Snapshot lsn.
    pub vlsn: u64,
}

#[derive(Debug)]
struct TxInfo {
    state: TxState,
    read_only: bool,
    vlsn: u64,
    /// Commits with a csn above this happened after the snapshot.
    csn: u64,
    aborted: bool,
    /// Touched keys in first-touch order.
    log: Vec<(u32, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct Inner {
    txs: BTreeMap<u64, TxInfo>,
    indexes: HashMap<u32, ShadowIndex>,
    csn: u64,
    /// Committed shadows awaiting release, in csn order.
    committed: VecDeque<(u64, u32, Vec<u8>)>,
}

impl Inner {
    fn tx(&self, id: u64) -> Result<&TxInfo> {
        self.txs
            .get(&id)
            .ok_or_else(|| Error::InvalidState(format!("transaction {} is not active", id)))
    }

    fn tx_mut(&mut self, id: u64) -> Result<&mut TxInfo> {
        self.txs
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidState(format!("transaction {} is not active", id)))
    }

    /// Removes every shadow of `id` and forgets the transaction.
    fn unlink(&mut self, id: u64) -> Option<TxInfo> {
        let tx = self.txs.remove(&id)?;
        for (dsn, key) in &tx.log {
            if let Some(index) = self.indexes.get_mut(dsn) {
                index.remove(key, id);
            }
        }
        Some(tx)
    }

    /// Releases committed shadows no live transaction can conflict with.
    fn release(&mut self) {
        let horizon = self.txs.values().map(|tx| tx.csn).min().unwrap_or(self.csn);
        while let Some((csn, _, _)) = self.committed.front() {
            if *csn > horizon {
                break;
            }
            if let Some((csn, dsn, key)) = self.committed.pop_front() {
                if let Some(index) = self.indexes.get_mut(&dsn) {
                    index.release(&key, csn);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct TxManager {
    seq: Arc<Sequence>,
    inner: Mutex<Inner>,
}

impl TxManager {
    pub fn new(seq: Arc<Sequence>) -> Self {
        Self {
            seq,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Starts a transaction reading at `vlsn`, or at the latest published
    /// commit.
    pub fn begin(&self, read_only: bool, vlsn: Option<u64>) -> Result<TxId> {
        let mut inner = self.inner.lock()?;
        let id = self.seq.next_tsn();
        let vlsn = vlsn.unwrap_or_else(|| self.seq.lsn());
        let csn = inner.csn;
        inner.txs.insert(
            id,
            TxInfo {
                state: TxState::Ready,
                read_only,
                vlsn,
                csn,
                aborted: false,
                log: Vec::new(),
            },
        );
        tracing::debug!(tx = id, vlsn, read_only, "Transaction started");
        Ok(TxId { id, vlsn })
    }

    /// Records a write. A second write to the same key replaces the first,
    /// except that two upserts of one key cannot be combined here.
    pub fn set(&self, id: u64, dsn: u32, value: Value) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let tx = inner.tx(id)?;
        if tx.read_only {
            return Err(Error::InvalidOperation(
                "write in a read-only transaction".to_string(),
            ));
        }
        if !matches!(tx.state, TxState::Ready | TxState::Lock) {
            return Err(Error::InvalidState(format!(
                "transaction {} is {:?}",
                id, tx.state
            )));
        }

        let value = Arc::new(value);
        let index = inner.indexes.entry(dsn).or_default();
        if let Some(own) = index.own_mut(value.key(), id) {
            if own.value.is_upsert() && value.is_upsert() {
                return Err(Error::InvalidOperation(
                    "key already upserted in this transaction".to_string(),
                ));
            }
            own.value = value;
            return Ok(());
        }

        let key = value.key().to_vec();
        index.push(Shadow::new(id, value));
        inner.tx_mut(id)?.log.push((dsn, key));
        Ok(())
    }

    /// Looks `key` up in the transaction's own writes. On a miss a read
    /// marker is left so that a concurrent commit of the key is detected.
    pub fn get(&self, id: u64, dsn: u32, key: &[u8]) -> Result<Lookup> {
        let mut inner = self.inner.lock()?;
        let read_only = inner.tx(id)?.read_only;
        if read_only {
            return Ok(Lookup::Miss);
        }

        let index = inner.indexes.entry(dsn).or_default();
        if let Some(own) = index.own(key, id) {
            return Ok(if own.is_read() {
                Lookup::Miss
            } else if own.value.is_delete() {
                Lookup::Deleted
            } else {
                Lookup::Found(Arc::clone(&own.value))
            });
        }

        index.push(Shadow::new(id, Arc::new(Value::read_marker(key.to_vec()))));
        inner.tx_mut(id)?.log.push((dsn, key.to_vec()));
        Ok(Lookup::Miss)
    }

    /// Decides whether the transaction may commit.
    ///
    /// `validate(dsn, key, vlsn)` must report whether a version of `key`
    /// newer than `vlsn` has been committed; it is consulted for keys no
    /// concurrent transaction has touched.
    pub fn prepare<F>(&self, id: u64, mut validate: F) -> Result<TxState>
    where
        F: FnMut(u32, &[u8], u64) -> Result<bool>,
    {
        let mut inner = self.inner.lock()?;
        let tx = inner.tx(id)?;
        match tx.state {
            TxState::Ready | TxState::Lock => {}
            TxState::Prepare => return Ok(TxState::Prepare),
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot prepare transaction {} in state {:?}",
                    id, state
                )))
            }
        }

        let state = if tx.aborted {
            TxState::Rollback
        } else if tx.read_only {
            TxState::Prepare
        } else {
            let mut state = TxState::Prepare;
            for (dsn, key) in &tx.log {
                let Some(index) = inner.indexes.get(dsn) else {
                    continue;
                };
                let reading = index.own(key, id).map(|s| s.is_read()).unwrap_or(false);
                let outcome = match index.predecessor(key, id) {
                    Predecessor::Committed(csn) if csn > tx.csn => TxState::Rollback,
                    Predecessor::Committed(_) => TxState::Prepare,
                    Predecessor::Pending(_) if reading => TxState::Prepare,
                    Predecessor::Pending(_) => TxState::Lock,
                    Predecessor::None => {
                        if validate(*dsn, key, tx.vlsn)? {
                            TxState::Rollback
                        } else {
                            TxState::Prepare
                        }
                    }
                };
                match outcome {
                    TxState::Rollback => {
                        state = TxState::Rollback;
                        break;
                    }
                    TxState::Lock => state = TxState::Lock,
                    _ => {}
                }
            }
            state
        };

        inner.tx_mut(id)?.state = state;
        tracing::debug!(tx = id, ?state, "Transaction prepared");
        Ok(state)
    }

    /// Writes of a transaction in first-touch order, read markers excluded.
    pub fn writes(&self, id: u64) -> Result<Vec<(u32, Arc<Value>)>> {
        let inner = self.inner.lock()?;
        let tx = inner.tx(id)?;
        Ok(tx
            .log
            .iter()
            .filter_map(|(dsn, key)| {
                let own = inner.indexes.get(dsn)?.own(key, id)?;
                (!own.is_read()).then(|| (*dsn, Arc::clone(&own.value)))
            })
            .collect())
    }

    /// Finishes a prepared transaction whose rows are already in the tree
    /// and publishes `lsn` as the newest visible commit.
    pub fn commit(&self, id: u64, lsn: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let state = inner.tx(id)?.state;
        if state != TxState::Prepare {
            return Err(Error::InvalidState(format!(
                "cannot commit transaction {} in state {:?}",
                id, state
            )));
        }

        let tx = inner
            .txs
            .remove(&id)
            .ok_or_else(|| Error::InvalidState(format!("transaction {} is not active", id)))?;
        inner.csn += 1;
        let csn = inner.csn;

        let mut victims = Vec::new();
        for (dsn, key) in tx.log {
            if let Some(index) = inner.indexes.get_mut(&dsn) {
                victims.extend(index.commit(&key, id, csn));
                inner.committed.push_back((csn, dsn, key));
            }
        }
        for victim in victims {
            if let Some(other) = inner.txs.get_mut(&victim) {
                other.aborted = true;
            }
        }
        if let Some(lsn) = lsn {
            self.seq.publish_lsn(lsn);
        }
        inner.release();

        tracing::debug!(tx = id, csn, "Transaction committed");
        Ok(())
    }

    pub fn rollback(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.unlink(id).is_some() {
            inner.release();
            tracing::debug!(tx = id, "Transaction rolled back");
        }
        Ok(())
    }

    /// Whether the transaction waits, directly or through others, on a
    /// transaction that waits on it.
    pub fn deadlock(&self, id: u64) -> Result<bool> {
        let inner = self.inner.lock()?;
        let mut graph = WaitForGraph::default();
        for (&waiter, tx) in &inner.txs {
            for (dsn, key) in &tx.log {
                if let Some(index) = inner.indexes.get(dsn) {
                    for holder in index.blockers(key, waiter) {
                        graph.add_wait(waiter, holder);
                    }
                }
            }
        }
        Ok(graph.has_cycle_through(id))
    }

    pub fn state(&self, id: u64) -> Option<TxState> {
        self.inner.lock().ok()?.txs.get(&id).map(|tx| tx.state)
    }

    /// Oldest snapshot any live transaction reads at.
    pub fn vlsn_min(&self) -> u64 {
        let lsn = self.seq.lsn();
        self.inner
            .lock()
            .map(|inner| inner.txs.values().map(|tx| tx.vlsn).min().unwrap_or(lsn))
            .unwrap_or(0)
    }

    /// Live transactions.
    pub fn count(&self) -> usize {
        self.inner.lock().map(|inner| inner.txs.len()).unwrap_or(0)
    }

    /// Shadows still linked, committed ones included.
    pub fn shadows(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.indexes.values().map(|i| i.len()).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TxManager {
        TxManager::new(Arc::new(Sequence::new()))
    }

    fn set(key: &str, data: &str) -> Value {
        Value::set(key.as_bytes().to_vec(), data.as_bytes().to_vec())
    }

    fn no_conflict(_: u32, _: &[u8], _: u64) -> Result<bool> {
        Ok(false)
    }

    #[test]
    fn test_read_your_writes() -> Result<()> {
        let txm = manager();
        let tx = txm.begin(false, None)?;
        assert!(matches!(txm.get(tx.id, 1, b"a")?, Lookup::Miss));

        txm.set(tx.id, 1, set("a", "1"))?;
        match txm.get(tx.id, 1, b"a")? {
            Lookup::Found(v) => assert_eq!(v.data(), b"1"),
            other => panic!("unexpected {:?}", other),
        }
        txm.set(tx.id, 1, Value::delete(b"a".to_vec()))?;
        assert!(matches!(txm.get(tx.id, 1, b"a")?, Lookup::Deleted));
        assert!(matches!(txm.get(tx.id, 2, b"a")?, Lookup::Miss));

        assert_eq!(txm.writes(tx.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_double_upsert_rejected() -> Result<()> {
        let txm = manager();
        let tx = txm.begin(false, None)?;
        txm.set(tx.id, 1, Value::upsert(b"k".to_vec(), b"a".to_vec()))?;
        assert!(matches!(
            txm.set(tx.id, 1, Value::upsert(b"k".to_vec(), b"b".to_vec())),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_read_only_rejects_writes() -> Result<()> {
        let txm = manager();
        let tx = txm.begin(true, None)?;
        assert!(matches!(
            txm.set(tx.id, 1, set("a", "1")),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(txm.prepare(tx.id, no_conflict)?, TxState::Prepare);
        txm.commit(tx.id, None)?;
        assert_eq!(txm.count(), 0);
        Ok(())
    }

    #[test]
    fn test_read_then_write_conflict() -> Result<()> {
        let txm = manager();
        let t1 = txm.begin(false, None)?;
        let t2 = txm.begin(false, None)?;
        txm.get(t1.id, 1, b"x")?;
        txm.get(t2.id, 1, b"x")?;
        txm.set(t1.id, 1, set("x", "1"))?;
        txm.set(t2.id, 1, set("x", "2"))?;

        assert_eq!(txm.prepare(t1.id, no_conflict)?, TxState::Prepare);
        assert_eq!(txm.prepare(t2.id, no_conflict)?, TxState::Lock);
        txm.commit(t1.id, Some(1))?;

        assert_eq!(txm.prepare(t2.id, no_conflict)?, TxState::Rollback);
        txm.rollback(t2.id)?;
        assert_eq!(txm.count(), 0);
        assert_eq!(txm.shadows(), 0);
        Ok(())
    }

    #[test]
    fn test_commit_after_snapshot_rolls_back_writer() -> Result<()> {
        let txm = manager();
        let t1 = txm.begin(false, None)?;
        let t2 = txm.begin(false, None)?;
        txm.set(t1.id, 1, set("x", "1"))?;
        assert_eq!(txm.prepare(t1.id, no_conflict)?, TxState::Prepare);
        txm.commit(t1.id, Some(1))?;

        // t2 started before t1 committed, so its write is stale.
        txm.set(t2.id, 1, set("x", "2"))?;
        assert_eq!(txm.prepare(t2.id, no_conflict)?, TxState::Rollback);
        txm.rollback(t2.id)?;

        let t3 = txm.begin(false, None)?;
        assert_eq!(t3.vlsn, 1);
        txm.set(t3.id, 1, set("x", "3"))?;
        assert_eq!(txm.prepare(t3.id, no_conflict)?, TxState::Prepare);
        Ok(())
    }

    #[test]
    fn test_validator_consulted_without_concurrency() -> Result<()> {
        let txm = manager();
        let tx = txm.begin(false, Some(5))?;
        txm.get(tx.id, 1, b"x")?;
        let state = txm.prepare(tx.id, |dsn, key, vlsn| {
            assert_eq!((dsn, key, vlsn), (1, &b"x"[..], 5));
            Ok(true)
        })?;
        assert_eq!(state, TxState::Rollback);
        Ok(())
    }

    #[test]
    fn test_concurrent_reads_do_not_lock() -> Result<()> {
        let txm = manager();
        let t1 = txm.begin(false, None)?;
        let t2 = txm.begin(false, None)?;
        txm.set(t1.id, 1, set("x", "1"))?;
        txm.get(t2.id, 1, b"x")?;
        assert_eq!(txm.prepare(t2.id, no_conflict)?, TxState::Prepare);
        txm.commit(t2.id, None)?;
        assert_eq!(txm.prepare(t1.id, no_conflict)?, TxState::Prepare);
        Ok(())
    }

    #[test]
    fn test_deadlock_detection() -> Result<()> {
        let txm = manager();
        let t1 = txm.begin(false, None)?;
        let t2 = txm.begin(false, None)?;
        txm.set(t1.id, 1, set("a", "1"))?;
        txm.set(t2.id, 1, set("b", "2"))?;
        assert!(!txm.deadlock(t1.id)?);

        txm.set(t1.id, 1, set("b", "1"))?;
        assert!(!txm.deadlock(t1.id)?);
        txm.set(t2.id, 1, set("a", "2"))?;
        assert!(txm.deadlock(t1.id)?);
        assert!(txm.deadlock(t2.id)?);

        txm.rollback(t2.id)?;
        assert!(!txm.deadlock(t1.id)?);
        Ok(())
    }

    #[test]
    fn test_vlsn_min_tracks_oldest_snapshot() -> Result<()> {
        let seq = Arc::new(Sequence::new());
        let txm = TxManager::new(Arc::clone(&seq));
        seq.publish_lsn(3);
        assert_eq!(txm.vlsn_min(), 3);
        let old = txm.begin(true, None)?;
        seq.publish_lsn(9);
        let _new = txm.begin(true, None)?;
        assert_eq!(txm.vlsn_min(), 3);
        txm.rollback(old.id)?;
        assert_eq!(txm.vlsn_min(), 9);
        Ok(())
    }
}
