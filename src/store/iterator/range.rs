//! Key-range filtering for resolved version streams.

use std::ops::Bound;
use std::sync::Arc;

use crate::error::Result;
use crate::store::value::Value;

/// Wraps an iterator and yields only values whose key lies in `[start, end]`
/// with the given bounds. Iteration stops as soon as a key passes the end
/// bound in the iteration direction.
pub struct RangeFilter<I>
where
    I: Iterator<Item = Result<Arc<Value>>>,
{
    inner: I,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    forward: bool,
    done: bool,
}

impl<I> RangeFilter<I>
where
    I: Iterator<Item = Result<Arc<Value>>>,
{
    /// `start` and `end` are given in iteration order: for a backward scan
    /// `start` is the upper key.
    pub fn new(inner: I, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>, forward: bool) -> Self {
        Self {
            inner,
            start,
            end,
            forward,
            done: false,
        }
    }

    fn before_start(&self, key: &[u8]) -> bool {
        match (&self.start, self.forward) {
            (Bound::Included(s), true) => key < s.as_slice(),
            (Bound::Excluded(s), true) => key <= s.as_slice(),
            (Bound::Included(s), false) => key > s.as_slice(),
            (Bound::Excluded(s), false) => key >= s.as_slice(),
            (Bound::Unbounded, _) => false,
        }
    }

    fn beyond_end(&self, key: &[u8]) -> bool {
        match (&self.end, self.forward) {
            (Bound::Included(e), true) => key > e.as_slice(),
            (Bound::Excluded(e), true) => key >= e.as_slice(),
            (Bound::Included(e), false) => key < e.as_slice(),
            (Bound::Excluded(e), false) => key <= e.as_slice(),
            (Bound::Unbounded, _) => false,
        }
    }
}

impl<I> Iterator for RangeFilter<I>
where
    I: Iterator<Item = Result<Arc<Value>>>,
{
    type Item = Result<Arc<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next()? {
                Ok(value) => {
                    if self.beyond_end(value.key()) {
                        self.done = true;
                        return None;
                    }
                    if !self.before_start(value.key()) {
                        return Some(Ok(value));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn values(keys: &[&str]) -> Vec<Result<Arc<Value>>> {
        keys.iter()
            .map(|k| Ok(Arc::new(Value::set(k.as_bytes().to_vec(), Vec::new()))))
            .collect()
    }

    fn keys<I: Iterator<Item = Result<Arc<Value>>>>(filter: RangeFilter<I>) -> Vec<String> {
        filter
            .map(|v| String::from_utf8(v.unwrap().key().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_range_filter_inclusive() {
        let data = values(&["key_005", "key_010", "key_015", "key_020", "key_025"]);
        let filtered = RangeFilter::new(
            data.into_iter(),
            Bound::Included(b"key_010".to_vec()),
            Bound::Included(b"key_020".to_vec()),
            true,
        );
        assert_eq!(keys(filtered), vec!["key_010", "key_015", "key_020"]);
    }

    #[test]
    fn test_range_filter_exclusive() {
        let data = values(&["key_005", "key_010", "key_015", "key_020", "key_025"]);
        let filtered = RangeFilter::new(
            data.into_iter(),
            Bound::Included(b"key_010".to_vec()),
            Bound::Excluded(b"key_020".to_vec()),
            true,
        );
        assert_eq!(keys(filtered), vec!["key_010", "key_015"]);
    }

    #[test]
    fn test_range_filter_backward() {
        let data = values(&["key_025", "key_020", "key_015", "key_010", "key_005"]);
        let filtered = RangeFilter::new(
            data.into_iter(),
            Bound::Included(b"key_020".to_vec()),
            Bound::Excluded(b"key_010".to_vec()),
            false,
        );
        assert_eq!(keys(filtered), vec!["key_020", "key_015"]);
    }

    #[test]
    fn test_range_filter_error_propagation() {
        let data = vec![
            Ok(Arc::new(Value::set(b"key_005".to_vec(), Vec::new()))),
            Err(Error::InvalidData("test error".to_string())),
            Ok(Arc::new(Value::set(b"key_015".to_vec(), Vec::new()))),
        ];
        let mut filtered = RangeFilter::new(
            data.into_iter(),
            Bound::Unbounded,
            Bound::Included(b"key_020".to_vec()),
            true,
        );
        assert!(filtered.next().unwrap().is_ok());
        assert!(filtered.next().unwrap().is_err());
    }
}
