//! In-memory version index using a concurrent skip list.
//!
//! Each node owns one or two of these (the active `i0` and, while a
//! compaction runs, the frozen `i1`). Entries are keyed by `(key, lsn)` with
//! the lsn descending, so all versions of one key sit next to each other,
//! newest first: that contiguous run *is* the version chain.
//!
//! # Crossbeam SkipMap
//!
//! `crossbeam-skiplist::SkipMap` lets readers iterate without locks while a
//! writer inserts, which is what the two-generation rotation relies on:
//! writers only touch the active index, compaction only reads the frozen one.
//!
//! Iterators own an `Arc<Memtable>` and re-seek the skip list for every key
//! run, so they carry no borrow and can outlive the node lock that produced
//! them.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use super::iterator::Order;
use super::value::Value;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionKey {
    key: Vec<u8>,
    lsn: u64,
}

impl VersionKey {
    /// Sorts before every version of `key`.
    fn head(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            lsn: u64::MAX,
        }
    }

    /// Sorts after every version of `key`.
    fn tail(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            lsn: 0,
        }
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.lsn.cmp(&self.lsn))
    }
}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<VersionKey, Arc<Value>>,
    used: AtomicUsize,
    rows: AtomicUsize,
    dups: AtomicUsize,
    lsn_min: AtomicU64,
    lsn_max: AtomicU64,
    timestamp_min: AtomicU64,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            used: AtomicUsize::new(0),
            rows: AtomicUsize::new(0),
            dups: AtomicUsize::new(0),
            lsn_min: AtomicU64::new(u64::MAX),
            lsn_max: AtomicU64::new(0),
            timestamp_min: AtomicU64::new(u64::MAX),
        }
    }

    /// Inserts a committed version. A version with the same lsn replaces
    /// the old one; otherwise it joins the key's chain and the previous head
    /// becomes a duplicate.
    pub fn set(&self, value: Arc<Value>) {
        let key = value.key();
        let had_chain = self
            .data
            .range(VersionKey::head(key)..=VersionKey::tail(key))
            .next()
            .is_some();
        let lsn = value.lsn();

        self.used.fetch_add(value.size(), Ordering::SeqCst);
        self.rows.fetch_add(1, Ordering::SeqCst);
        if had_chain {
            self.dups.fetch_add(1, Ordering::SeqCst);
        }
        self.lsn_min.fetch_min(lsn, Ordering::SeqCst);
        self.lsn_max.fetch_max(lsn, Ordering::SeqCst);
        self.timestamp_min
            .fetch_min(value.timestamp() as u64, Ordering::SeqCst);

        self.data.insert(
            VersionKey {
                key: key.to_vec(),
                lsn,
            },
            value,
        );
    }

    /// Newest version of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Arc<Value>> {
        self.data
            .range(VersionKey::head(key)..=VersionKey::tail(key))
            .next()
            .map(|entry| entry.value().clone())
    }

    /// All versions of `key`, newest first.
    pub fn chain(&self, key: &[u8]) -> Vec<Arc<Value>> {
        self.data
            .range(VersionKey::head(key)..=VersionKey::tail(key))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every version in key order, used to hand writes over to new nodes.
    pub fn values(&self) -> impl Iterator<Item = Arc<Value>> + '_ {
        self.data.iter().map(|entry| entry.value().clone())
    }

    pub fn iter(self: &Arc<Self>, order: Order, key: Option<&[u8]>) -> MemtableIter {
        MemtableIter::new(Arc::clone(self), order, key)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of stored versions
    pub fn len(&self) -> usize {
        self.rows.load(Ordering::SeqCst)
    }

    /// Number of versions that shadowed an older one
    pub fn dups(&self) -> usize {
        self.dups.load(Ordering::SeqCst)
    }

    /// Approximate bytes used
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn lsn_min(&self) -> Option<u64> {
        match self.lsn_min.load(Ordering::SeqCst) {
            u64::MAX => None,
            lsn => Some(lsn),
        }
    }

    pub fn lsn_max(&self) -> u64 {
        self.lsn_max.load(Ordering::SeqCst)
    }

    pub fn timestamp_min(&self) -> Option<u32> {
        match self.timestamp_min.load(Ordering::SeqCst) {
            u64::MAX => None,
            ts => Some(ts as u32),
        }
    }
}

/// Owning iterator over a memtable, yielding whole key runs newest first in
/// either direction.
pub struct MemtableIter {
    memtable: Arc<Memtable>,
    forward: bool,
    cursor: Bound<VersionKey>,
    pending: VecDeque<Arc<Value>>,
}

impl MemtableIter {
    fn new(memtable: Arc<Memtable>, order: Order, key: Option<&[u8]>) -> Self {
        let cursor = match (order, key) {
            (_, None) => Bound::Unbounded,
            (Order::Gte, Some(k)) => Bound::Included(VersionKey::head(k)),
            (Order::Gt, Some(k)) => Bound::Excluded(VersionKey::tail(k)),
            (Order::Lte, Some(k)) => Bound::Included(VersionKey::tail(k)),
            (Order::Lt, Some(k)) => Bound::Excluded(VersionKey::head(k)),
        };
        Self {
            memtable,
            forward: order.is_forward(),
            cursor,
            pending: VecDeque::new(),
        }
    }

    fn next_run(&mut self) -> bool {
        let found = if self.forward {
            self.memtable
                .data
                .range((self.cursor.clone(), Bound::Unbounded))
                .next()
                .map(|entry| entry.key().key.clone())
        } else {
            self.memtable
                .data
                .range((Bound::Unbounded, self.cursor.clone()))
                .next_back()
                .map(|entry| entry.key().key.clone())
        };
        let Some(key) = found else {
            return false;
        };

        self.pending.extend(self.memtable.chain(&key));
        self.cursor = if self.forward {
            Bound::Excluded(VersionKey::tail(&key))
        } else {
            Bound::Excluded(VersionKey::head(&key))
        };
        true
    }
}

impl Iterator for MemtableIter {
    type Item = Result<Arc<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Some(Ok(value));
            }
            if !self.next_run() {
                return None;
            }
        }
    }
}
