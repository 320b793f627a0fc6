//! Versioned values.
//!
//! A [`Value`] is one version of one key: the comparable key, the encoded
//! value fields, the commit lsn, a flag byte and a wall-clock timestamp used
//! for expiry. Values are immutable once built and shared as `Arc<Value>`
//! between the transaction shadows, the memory index, the WAL writer and the
//! iterators; dropping the last reference frees it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Row is a tombstone.
pub const DELETE: u8 = 0x01;
/// Row is a delta to be folded by the upsert combinator.
pub const UPSERT: u8 = 0x02;
/// Row is not the newest version of its key within its page or chain.
pub const DUP: u8 = 0x04;
/// Transaction read marker; never stored.
pub const GET: u8 = 0x08;

/// Flags that are persisted with a row.
pub const STORED_FLAGS: u8 = DELETE | UPSERT | DUP;

/// Fixed per-row bookkeeping counted towards memory usage.
pub const ROW_OVERHEAD: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    key: Vec<u8>,
    data: Vec<u8>,
    lsn: u64,
    flags: u8,
    timestamp: u32,
}

impl Value {
    pub fn new(key: Vec<u8>, data: Vec<u8>, lsn: u64, flags: u8, timestamp: u32) -> Self {
        Self {
            key,
            data,
            lsn,
            flags,
            timestamp,
        }
    }

    pub fn set(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self::new(key, data, 0, 0, 0)
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self::new(key, Vec::new(), 0, DELETE, 0)
    }

    pub fn upsert(key: Vec<u8>, delta: Vec<u8>) -> Self {
        Self::new(key, delta, 0, UPSERT, 0)
    }

    /// A read marker for the transaction manager.
    pub fn read_marker(key: Vec<u8>) -> Self {
        Self::new(key, Vec::new(), 0, GET, 0)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn is_delete(&self) -> bool {
        self.flags & DELETE != 0
    }

    pub fn is_upsert(&self) -> bool {
        self.flags & UPSERT != 0
    }

    pub fn is_dup(&self) -> bool {
        self.flags & DUP != 0
    }

    pub fn is_read_marker(&self) -> bool {
        self.flags & GET != 0
    }

    /// Approximate memory footprint.
    pub fn size(&self) -> usize {
        self.key.len() + self.data.len() + ROW_OVERHEAD
    }

    /// Copy stamped with the commit lsn and timestamp.
    pub fn committed(&self, lsn: u64, timestamp: u32) -> Arc<Value> {
        Arc::new(Self {
            key: self.key.clone(),
            data: self.data.clone(),
            lsn,
            flags: self.flags & (DELETE | UPSERT),
            timestamp,
        })
    }

    /// Copy with a different flag byte.
    pub fn with_flags(&self, flags: u8) -> Value {
        Self {
            flags,
            ..self.clone()
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.key, self.data)
    }
}

/// Seconds since the Unix epoch, saturating into `u32`.
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let v = Value::set(b"k".to_vec(), b"v".to_vec());
        assert!(!v.is_delete() && !v.is_upsert() && !v.is_dup());

        let d = Value::delete(b"k".to_vec());
        assert!(d.is_delete());

        let u = Value::upsert(b"k".to_vec(), b"+1".to_vec());
        assert!(u.is_upsert());

        let g = Value::read_marker(b"k".to_vec());
        assert!(g.is_read_marker());
    }

    #[test]
    fn test_committed_strips_transient_flags() {
        let v = Value::set(b"k".to_vec(), b"v".to_vec()).with_flags(DUP | GET);
        let c = v.committed(7, 100);
        assert_eq!(c.lsn(), 7);
        assert_eq!(c.timestamp(), 100);
        assert_eq!(c.flags(), 0);

        let u = Value::upsert(b"k".to_vec(), b"d".to_vec()).committed(8, 0);
        assert!(u.is_upsert());
    }
}
