use std::sync::Arc;

use super::{MergeIterator, Upsert, UpsertStack};
use crate::error::Result;
use crate::store::value::Value;

/// Compaction-side view of a merge: for each key, the versions that must
/// survive into the new node file, newest first.
///
/// Every version newer than `vlsn` (the oldest snapshot still open) is kept.
/// Of the remaining versions only the newest survives: an upsert is folded
/// into a plain value, a delete is dropped unless `save_delete`, anything
/// older is garbage. Rows whose timestamp is older than the expire cutoff
/// are dropped outright.
pub struct WriteIterator<'a> {
    merge: MergeIterator<'a>,
    vlsn: u64,
    upsert: Option<Arc<dyn Upsert>>,
    stack: UpsertStack,
    save_delete: bool,
    expire_before: Option<u32>,
}

impl<'a> WriteIterator<'a> {
    pub fn new(merge: MergeIterator<'a>, vlsn: u64) -> Self {
        Self {
            merge,
            vlsn,
            upsert: None,
            stack: UpsertStack::new(),
            save_delete: false,
            expire_before: None,
        }
    }

    pub fn upsert(mut self, upsert: Option<Arc<dyn Upsert>>) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn save_delete(mut self, save: bool) -> Self {
        self.save_delete = save;
        self
    }

    /// Drop rows stamped before `timestamp`.
    pub fn expire_before(mut self, timestamp: Option<u32>) -> Self {
        self.expire_before = timestamp;
        self
    }

    fn compact(&mut self, run: Vec<Arc<Value>>) -> Result<Vec<Arc<Value>>> {
        let run: Vec<Arc<Value>> = match self.expire_before {
            Some(cutoff) => run.into_iter().filter(|v| v.timestamp() >= cutoff).collect(),
            None => run,
        };

        let mut out = Vec::with_capacity(run.len());
        for (i, version) in run.iter().enumerate() {
            if version.lsn() > self.vlsn {
                out.push(Arc::clone(version));
                continue;
            }
            match &self.upsert {
                Some(upsert) if version.is_upsert() => {
                    out.push(self.stack.fold(upsert.as_ref(), &run[i..])?);
                }
                _ if version.is_delete() && !self.save_delete => {}
                _ => out.push(Arc::clone(version)),
            }
            break;
        }
        Ok(out)
    }
}

impl Iterator for WriteIterator<'_> {
    type Item = Result<Vec<Arc<Value>>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let run = match self.merge.next_run()? {
                Ok(run) => run,
                Err(e) => return Some(Err(e)),
            };
            match self.compact(run) {
                Ok(out) if out.is_empty() => continue,
                Ok(out) => return Some(Ok(out)),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
