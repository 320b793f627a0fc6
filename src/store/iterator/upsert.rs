use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::value::Value;

/// Folds an upsert delta into the value it updates.
pub trait Upsert: Send + Sync {
    /// `old` is `None` when the key has no live base version.
    fn apply(&self, key: &[u8], old: Option<&[u8]>, delta: &[u8]) -> Result<Vec<u8>>;
}

/// Reusable stack for folding a chain of upsert deltas.
///
/// Deltas are collected newest first until a base version (a plain set, a
/// delete or the end of the chain) and then applied oldest to newest.
#[derive(Debug, Default)]
pub struct UpsertStack {
    deltas: Vec<Arc<Value>>,
}

impl UpsertStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `versions` (newest first) into one plain value carrying the lsn
    /// and timestamp of the newest version.
    pub fn fold<'v, I>(&mut self, upsert: &dyn Upsert, versions: I) -> Result<Arc<Value>>
    where
        I: IntoIterator<Item = &'v Arc<Value>>,
    {
        self.deltas.clear();
        let mut base: Option<&Arc<Value>> = None;
        for version in versions {
            if version.is_upsert() {
                self.deltas.push(Arc::clone(version));
            } else {
                base = Some(version);
                break;
            }
        }

        let head = match self.deltas.first() {
            Some(head) => Arc::clone(head),
            None => {
                return base.cloned().ok_or_else(|| {
                    Error::InvalidState("upsert fold over an empty chain".to_string())
                })
            }
        };

        let mut current: Option<Vec<u8>> = match base {
            Some(v) if !v.is_delete() => Some(v.data().to_vec()),
            _ => None,
        };
        for delta in self.deltas.iter().rev() {
            current = Some(upsert.apply(head.key(), current.as_deref(), delta.data())?);
        }
        self.deltas.clear();

        Ok(Arc::new(Value::new(
            head.key().to_vec(),
            current.unwrap_or_default(),
            head.lsn(),
            0,
            head.timestamp(),
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Appends the delta to the old value.
    pub(crate) struct Concat;

    impl Upsert for Concat {
        fn apply(&self, _key: &[u8], old: Option<&[u8]>, delta: &[u8]) -> Result<Vec<u8>> {
            let mut out = old.map(|o| o.to_vec()).unwrap_or_default();
            out.extend_from_slice(delta);
            Ok(out)
        }
    }

    fn version(data: &str, lsn: u64, flags: u8) -> Arc<Value> {
        Arc::new(Value::new(b"k".to_vec(), data.as_bytes().to_vec(), lsn, flags, lsn as u32))
    }

    #[test]
    fn test_fold_applies_oldest_first() {
        use crate::store::value::UPSERT;

        let chain = vec![
            version("c", 4, UPSERT),
            version("b", 3, UPSERT),
            version("a", 2, 0),
            version("zzz", 1, 0),
        ];
        let folded = UpsertStack::new().fold(&Concat, &chain).unwrap();
        assert_eq!(folded.data(), b"abc");
        assert_eq!(folded.lsn(), 4);
        assert!(!folded.is_upsert());
    }

    #[test]
    fn test_fold_over_delete_starts_empty() {
        use crate::store::value::{DELETE, UPSERT};

        let chain = vec![version("x", 3, UPSERT), version("", 2, DELETE), version("old", 1, 0)];
        let folded = UpsertStack::new().fold(&Concat, &chain).unwrap();
        assert_eq!(folded.data(), b"x");
    }

    #[test]
    fn test_fold_without_deltas_returns_base() {
        let chain = vec![version("a", 1, 0)];
        let folded = UpsertStack::new().fold(&Concat, &chain).unwrap();
        assert_eq!(folded.data(), b"a");
        assert!(UpsertStack::new().fold(&Concat, &Vec::<Arc<Value>>::new()).is_err());
    }
}
