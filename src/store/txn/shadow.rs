use std::collections::BTreeMap;
use std::sync::Arc;

use crate::store::value::Value;

/// One transaction's pending write (or read marker) for a key.
#[derive(Debug, Clone)]
pub(crate) struct Shadow {
    pub tx: u64,
    pub value: Arc<Value>,
    /// Commit sequence, set once the owning transaction commits.
    pub csn: Option<u64>,
}

impl Shadow {
    pub fn new(tx: u64, value: Arc<Value>) -> Self {
        Self {
            tx,
            value,
            csn: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.csn.is_some()
    }

    pub fn is_read(&self) -> bool {
        self.value.is_read_marker()
    }
}

/// Outcome of looking at the writers that touched a key before a given
/// shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Predecessor {
    /// Nobody wrote the key earlier in the chain.
    None,
    /// The nearest earlier write is committed with this csn.
    Committed(u64),
    /// The nearest earlier write belongs to a live transaction.
    Pending(u64),
}

/// Per-key chains of concurrent shadows for one database, oldest first.
#[derive(Debug, Default)]
pub(crate) struct ShadowIndex {
    chains: BTreeMap<Vec<u8>, Vec<Shadow>>,
}

impl ShadowIndex {
    pub fn position(&self, key: &[u8], tx: u64) -> Option<usize> {
        self.chains
            .get(key)?
            .iter()
            .position(|s| s.tx == tx && !s.is_committed())
    }

    pub fn own(&self, key: &[u8], tx: u64) -> Option<&Shadow> {
        let pos = self.position(key, tx)?;
        self.chains.get(key).map(|chain| &chain[pos])
    }

    pub fn own_mut(&mut self, key: &[u8], tx: u64) -> Option<&mut Shadow> {
        let pos = self.position(key, tx)?;
        self.chains.get_mut(key).map(|chain| &mut chain[pos])
    }

    pub fn push(&mut self, shadow: Shadow) {
        self.chains
            .entry(shadow.value.key().to_vec())
            .or_default()
            .push(shadow);
    }

    /// Nearest write before `tx`'s shadow, read markers skipped.
    pub fn predecessor(&self, key: &[u8], tx: u64) -> Predecessor {
        let (Some(chain), Some(pos)) = (self.chains.get(key), self.position(key, tx)) else {
            return Predecessor::None;
        };
        chain[..pos]
            .iter()
            .rev()
            .find(|s| !s.is_read())
            .map(|s| match s.csn {
                Some(csn) => Predecessor::Committed(csn),
                None => Predecessor::Pending(s.tx),
            })
            .unwrap_or(Predecessor::None)
    }

    /// Unlinks `tx`'s uncommitted shadow.
    pub fn remove(&mut self, key: &[u8], tx: u64) -> Option<Shadow> {
        let pos = self.position(key, tx)?;
        let chain = self.chains.get_mut(key)?;
        let shadow = chain.remove(pos);
        if chain.is_empty() {
            self.chains.remove(key);
        }
        Some(shadow)
    }

    /// Stamps `tx`'s shadow with `csn` and returns the transactions that
    /// touched the key after it: they read or wrote a version that is now
    /// stale.
    pub fn commit(&mut self, key: &[u8], tx: u64, csn: u64) -> Vec<u64> {
        let Some(pos) = self.position(key, tx) else {
            return Vec::new();
        };
        let Some(chain) = self.chains.get_mut(key) else {
            return Vec::new();
        };
        chain[pos].csn = Some(csn);
        chain[pos + 1..]
            .iter()
            .filter(|s| !s.is_committed() && s.tx != tx)
            .map(|s| s.tx)
            .collect()
    }

    /// Drops committed shadows of `key` stamped at or before `csn`.
    pub fn release(&mut self, key: &[u8], csn: u64) {
        if let Some(chain) = self.chains.get_mut(key) {
            chain.retain(|s| s.csn.map_or(true, |c| c > csn));
            if chain.is_empty() {
                self.chains.remove(key);
            }
        }
    }

    /// Live transactions holding a pending write to `key` ahead of `tx`.
    pub fn blockers(&self, key: &[u8], tx: u64) -> Vec<u64> {
        let (Some(chain), Some(pos)) = (self.chains.get(key), self.position(key, tx)) else {
            return Vec::new();
        };
        if chain[pos].is_read() {
            return Vec::new();
        }
        chain[..pos]
            .iter()
            .filter(|s| !s.is_committed() && !s.is_read())
            .map(|s| s.tx)
            .collect()
    }

    /// Shadows across all chains.
    pub fn len(&self) -> usize {
        self.chains.values().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(tx: u64, key: &str) -> Shadow {
        Shadow::new(tx, Arc::new(Value::set(key.as_bytes().to_vec(), b"v".to_vec())))
    }

    fn read(tx: u64, key: &str) -> Shadow {
        Shadow::new(tx, Arc::new(Value::read_marker(key.as_bytes().to_vec())))
    }

    #[test]
    fn test_predecessor_skips_reads() {
        let mut index = ShadowIndex::default();
        index.push(write(1, "x"));
        index.push(read(2, "x"));
        index.push(write(3, "x"));

        assert_eq!(index.predecessor(b"x", 1), Predecessor::None);
        assert_eq!(index.predecessor(b"x", 3), Predecessor::Pending(1));
        assert_eq!(index.blockers(b"x", 3), vec![1]);
        assert!(index.blockers(b"x", 2).is_empty());

        assert_eq!(index.commit(b"x", 1, 7), vec![2, 3]);
        assert_eq!(index.predecessor(b"x", 3), Predecessor::Committed(7));
        assert!(index.blockers(b"x", 3).is_empty());
    }

    #[test]
    fn test_remove_and_release() {
        let mut index = ShadowIndex::default();
        index.push(write(1, "x"));
        index.push(write(2, "x"));
        assert_eq!(index.len(), 2);

        assert!(index.remove(b"x", 2).is_some());
        assert!(index.remove(b"x", 2).is_none());
        index.commit(b"x", 1, 4);
        assert!(index.own(b"x", 1).is_none());

        index.release(b"x", 3);
        assert_eq!(index.len(), 1);
        index.release(b"x", 4);
        assert!(index.is_empty());
    }
}
