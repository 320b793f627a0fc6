use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use super::{Order, Source};
use crate::error::{Error, Result};
use crate::store::value::Value;

/// One merged version. `dup` is set when an earlier output already carried
/// the same key, i.e. this version is shadowed within the current run.
#[derive(Debug, Clone)]
pub struct Merged {
    pub value: Arc<Value>,
    pub dup: bool,
}

struct HeapEntry<'a> {
    value: Arc<Value>,
    source: usize,
    forward: bool,
    iterator: Source<'a>,
}

impl std::fmt::Debug for HeapEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.value.key())
            .field("lsn", &self.value.lsn())
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.value.key() == other.value.key() && self.source == other.source
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap pops the greatest entry: the key first in iteration order wins,
// ties go to the lower source index.
impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = if self.forward {
            self.value.key().cmp(other.value.key())
        } else {
            other.value.key().cmp(self.value.key())
        };
        match by_key {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(),
        }
    }
}

/// K-way merge of sorted version streams.
///
/// Sources are given in priority order (transaction writes, active index,
/// frozen index, disk). All versions of a key are emitted back to back:
/// first every version from the highest-priority source holding the key,
/// then the next source, and so on. Since each source is itself newest
/// first, a run is ordered newest to oldest.
#[derive(Debug)]
pub struct MergeIterator<'a> {
    heap: BinaryHeap<HeapEntry<'a>>,
    forward: bool,
    last_key: Option<Vec<u8>>,
    peeked: Option<Merged>,
    error: Option<Error>,
}

impl<'a> MergeIterator<'a> {
    pub fn new(order: Order, sources: Vec<Source<'a>>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            forward: order.is_forward(),
            last_key: None,
            peeked: None,
            error: None,
        };
        for (source, iterator) in sources.into_iter().enumerate() {
            merge.advance(source, iterator);
        }
        merge
    }

    fn advance(&mut self, source: usize, mut iterator: Source<'a>) {
        match iterator.next() {
            Some(Ok(value)) => self.heap.push(HeapEntry {
                value,
                source,
                forward: self.forward,
                iterator,
            }),
            Some(Err(e)) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
            None => {}
        }
    }

    fn pop(&mut self) -> Option<Result<Merged>> {
        if let Some(e) = self.error.take() {
            return Some(Err(e));
        }
        let entry = self.heap.pop()?;
        let HeapEntry {
            value,
            source,
            iterator,
            ..
        } = entry;
        self.advance(source, iterator);

        let dup = self.last_key.as_deref() == Some(value.key());
        if !dup {
            self.last_key = Some(value.key().to_vec());
        }
        Some(Ok(Merged { value, dup }))
    }

    /// All versions of the next key, newest first.
    pub fn next_run(&mut self) -> Option<Result<Vec<Arc<Value>>>> {
        let first = match self.next()? {
            Ok(merged) => merged,
            Err(e) => return Some(Err(e)),
        };
        let mut run = vec![first.value];
        loop {
            match self.next() {
                Some(Ok(merged)) if merged.dup => run.push(merged.value),
                Some(Ok(merged)) => {
                    self.peeked = Some(merged);
                    break;
                }
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        Some(Ok(run))
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Merged>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(merged) = self.peeked.take() {
            return Some(Ok(merged));
        }
        self.pop()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn source(rows: &[(&str, u64)]) -> Source<'static> {
        let values: Vec<Result<Arc<Value>>> = rows
            .iter()
            .map(|(k, lsn)| {
                Ok(Arc::new(Value::new(
                    k.as_bytes().to_vec(),
                    format!("{}@{}", k, lsn).into_bytes(),
                    *lsn,
                    0,
                    0,
                )))
            })
            .collect();
        Box::new(values.into_iter())
    }

    fn keys(merge: MergeIterator) -> Vec<(String, u64, bool)> {
        merge
            .map(|m| {
                let m = m.unwrap();
                (
                    String::from_utf8(m.value.key().to_vec()).unwrap(),
                    m.value.lsn(),
                    m.dup,
                )
            })
            .collect()
    }

    #[test]
    fn test_merge_forward_groups_keys_by_priority() {
        let merge = MergeIterator::new(
            Order::Gte,
            vec![
                source(&[("b", 9)]),
                source(&[("a", 5), ("b", 6), ("c", 4)]),
                source(&[("a", 1), ("b", 2)]),
            ],
        );
        assert_eq!(
            keys(merge),
            vec![
                ("a".into(), 5, false),
                ("a".into(), 1, true),
                ("b".into(), 9, false),
                ("b".into(), 6, true),
                ("b".into(), 2, true),
                ("c".into(), 4, false),
            ]
        );
    }

    #[test]
    fn test_merge_backward() {
        let merge = MergeIterator::new(
            Order::Lte,
            vec![
                source(&[("c", 7), ("a", 8)]),
                source(&[("b", 3), ("a", 2)]),
            ],
        );
        assert_eq!(
            keys(merge),
            vec![
                ("c".into(), 7, false),
                ("b".into(), 3, false),
                ("a".into(), 8, false),
                ("a".into(), 2, true),
            ]
        );
    }

    #[test]
    fn test_next_run() {
        let mut merge = MergeIterator::new(
            Order::Gte,
            vec![
                source(&[("a", 5), ("a", 4), ("b", 1)]),
                source(&[("a", 2)]),
            ],
        );
        let run = merge.next_run().unwrap().unwrap();
        assert_eq!(run.iter().map(|v| v.lsn()).collect::<Vec<_>>(), vec![5, 4, 2]);
        let run = merge.next_run().unwrap().unwrap();
        assert_eq!(run.len(), 1);
        assert_eq!(run[0].key(), b"b");
        assert!(merge.next_run().is_none());
    }

    #[test]
    fn test_merge_error_propagation() {
        let failing: Source<'static> = Box::new(
            vec![Err(Error::InvalidData("bad page".to_string()))].into_iter(),
        );
        let mut merge = MergeIterator::new(Order::Gte, vec![source(&[("a", 1)]), failing]);
        assert!(merge.next().unwrap().is_err());
    }
}
