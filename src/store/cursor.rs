use std::sync::Arc;

use super::database::Database;
use super::value::Value;
use crate::encoding::Datum;
use crate::error::Result;

/// Resolved rows in iteration order.
pub(crate) type Rows = Box<dyn Iterator<Item = Result<Arc<Value>>> + Send>;

/// Iterator over decoded `(key, value)` rows of one database.
///
/// A cursor reads at the snapshot it was opened with and keeps the nodes it
/// started from alive, so compaction running meanwhile does not affect it.
pub struct Cursor {
    db: Arc<Database>,
    rows: Rows,
}

impl Cursor {
    pub(crate) fn new(db: Arc<Database>, rows: Rows) -> Self {
        Self { db, rows }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

impl Iterator for Cursor {
    type Item = Result<(Vec<Datum>, Vec<Datum>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = match self.rows.next()? {
            Ok(row) => row,
            Err(e) => return Some(Err(self.db.shared().state.escalate(e))),
        };
        Some(self.db.decode_row(&row))
    }
}
