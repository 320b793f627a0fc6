use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;

/// Engine-wide sequence counters.
///
/// `lsn` is the last *published* commit: a commit reserves `lsn() + 1` while
/// holding the commit lock and publishes it with [`Sequence::publish_lsn`]
/// only after its rows are in the memory index.
///
/// The commit lock also orders node rotation against commits, so every row
/// of one lsn lands in the same memory generation of a node.
#[derive(Debug, Default)]
pub struct Sequence {
    commit: Mutex<()>,
    lsn: AtomicU64,
    tsn: AtomicU64,
    nsn: AtomicU64,
    bsn: AtomicU64,
    dsn: AtomicU64,
    lfsn: AtomicU64,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_lock(&self) -> Result<MutexGuard<'_, ()>> {
        Ok(self.commit.lock()?)
    }

    pub fn lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    pub fn publish_lsn(&self, lsn: u64) {
        self.lsn.fetch_max(lsn, Ordering::SeqCst);
    }

    /// Transaction id
    pub fn next_tsn(&self) -> u64 {
        self.tsn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Node id
    pub fn next_nsn(&self) -> u64 {
        self.nsn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Backup id
    pub fn next_bsn(&self) -> u64 {
        self.bsn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Database id
    pub fn next_dsn(&self) -> u32 {
        (self.dsn.fetch_add(1, Ordering::SeqCst) + 1) as u32
    }

    /// Log file id
    pub fn next_lfsn(&self) -> u64 {
        self.lfsn.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn bsn(&self) -> u64 {
        self.bsn.load(Ordering::SeqCst)
    }

    /// Raise counters to at least the values observed on disk.
    pub fn observe_nsn(&self, nsn: u64) {
        self.nsn.fetch_max(nsn, Ordering::SeqCst);
    }

    pub fn observe_bsn(&self, bsn: u64) {
        self.bsn.fetch_max(bsn, Ordering::SeqCst);
    }

    pub fn observe_dsn(&self, dsn: u32) {
        self.dsn.fetch_max(dsn as u64, Ordering::SeqCst);
    }

    pub fn observe_lfsn(&self, lfsn: u64) {
        self.lfsn.fetch_max(lfsn, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent_and_monotonic() {
        let seq = Sequence::new();
        assert_eq!(seq.next_tsn(), 1);
        assert_eq!(seq.next_tsn(), 2);
        assert_eq!(seq.next_nsn(), 1);
        assert_eq!(seq.next_dsn(), 1);
        assert_eq!(seq.lsn(), 0);

        seq.publish_lsn(10);
        seq.publish_lsn(5);
        assert_eq!(seq.lsn(), 10);

        seq.observe_nsn(40);
        assert_eq!(seq.next_nsn(), 41);
        seq.observe_lfsn(3);
        assert_eq!(seq.next_lfsn(), 4);
    }
}
