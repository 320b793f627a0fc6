//! The merge iterator stack.
//!
//! Every read and every compaction goes through the same pipeline:
//!
//! ```text
//!  tx writes ─┐
//!  i0 (active)┤                 ┌─► ReadIterator  ─► get / cursor / range
//!  i1 (frozen)┼─► MergeIterator ┤
//!  disk pages ┘                 └─► WriteIterator ─► page builder (compaction)
//! ```
//!
//! Each source yields versions ordered by key in the iteration direction and,
//! within one key, newest first. Sources are listed in priority order, so the
//! merge can group all versions of a key into one run with the winning
//! version first.

pub mod merge;
pub mod range;
pub mod read;
pub mod upsert;
pub mod write;

pub use merge::{Merged, MergeIterator};
pub use range::RangeFilter;
pub use read::ReadIterator;
pub use upsert::{Upsert, UpsertStack};
pub use write::WriteIterator;

use std::sync::Arc;

use super::value::Value;
use crate::error::Result;

/// A sorted stream of versions.
pub type Source<'a> = Box<dyn Iterator<Item = Result<Arc<Value>>> + Send + 'a>;

/// Start position and direction of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Gte,
    Gt,
    Lte,
    Lt,
}

impl Order {
    pub fn is_forward(&self) -> bool {
        matches!(self, Order::Gte | Order::Gt)
    }

    /// Parses the binding-style operators `>=`, `>`, `<=`, `<`.
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            ">=" => Some(Order::Gte),
            ">" => Some(Order::Gt),
            "<=" => Some(Order::Lte),
            "<" => Some(Order::Lt),
            _ => None,
        }
    }

    /// Whether `candidate` lies at or past the start position `key`.
    pub fn admits(&self, candidate: &[u8], key: &[u8]) -> bool {
        match self {
            Order::Gte => candidate >= key,
            Order::Gt => candidate > key,
            Order::Lte => candidate <= key,
            Order::Lt => candidate < key,
        }
    }

    /// Compares two keys in iteration order.
    pub fn cmp_keys(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        if self.is_forward() {
            a.cmp(b)
        } else {
            b.cmp(a)
        }
    }
}
