use std::sync::Arc;

use super::{MergeIterator, Upsert, UpsertStack};
use crate::error::Result;
use crate::store::value::Value;

/// Resolves merged version runs into the single version visible at a
/// snapshot.
///
/// Versions newer than `vlsn` are skipped (transaction-local writes carry
/// lsn 0 and are always visible). An upsert at the head of the visible chain
/// is folded with the combinator; deletes are hidden unless `save_delete`.
pub struct ReadIterator<'a> {
    merge: MergeIterator<'a>,
    vlsn: u64,
    upsert: Option<Arc<dyn Upsert>>,
    stack: UpsertStack,
    save_delete: bool,
}

impl<'a> ReadIterator<'a> {
    pub fn new(merge: MergeIterator<'a>, vlsn: u64) -> Self {
        Self {
            merge,
            vlsn,
            upsert: None,
            stack: UpsertStack::new(),
            save_delete: false,
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

    fn resolve(&mut self, run: Vec<Arc<Value>>) -> Result<Option<Arc<Value>>> {
        let vlsn = self.vlsn;
        let visible: Vec<Arc<Value>> = run.into_iter().filter(|v| v.lsn() <= vlsn).collect();
        let Some(head) = visible.first() else {
            return Ok(None);
        };

        let value = match &self.upsert {
            Some(upsert) if head.is_upsert() => self.stack.fold(upsert.as_ref(), &visible)?,
            _ => Arc::clone(head),
        };
        if value.is_delete() && !self.save_delete {
            return Ok(None);
        }
        Ok(Some(value))
    }
}

impl Iterator for ReadIterator<'_> {
    type Item = Result<Arc<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let run = match self.merge.next_run()? {
                Ok(run) => run,
                Err(e) => return Some(Err(e)),
            };
            match self.resolve(run) {
                Ok(Some(value)) => return Some(Ok(value)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
