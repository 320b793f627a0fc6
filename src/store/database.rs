//! Database handle.
//!
//! A database is one key space with its own schema, node tree and scheme
//! file under `<env>/<name>/`. Every call on [`Database`] runs as an
//! implicit single-statement transaction; use
//! [`Environment::begin`](super::Environment::begin) to group statements.

use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::compaction::{self, CompactionParams, CompactionStats};
use super::cursor::{Cursor, Rows};
use super::environment::Shared;
use super::iterator::{MergeIterator, Order, RangeFilter, ReadIterator, Source, Upsert};
use super::node::Node;
use super::scheme::Scheme;
use super::transaction;
use super::tree::Tree;
use super::txn::TxState;
use super::value::{self, Value};
use crate::config::{DatabaseConfig, UpsertFn};
use crate::encoding::{Datum, Schema};
use crate::error::Result;
use crate::Error;

/// Runs the user combinator over decoded value fields.
struct SchemaUpsert {
    schema: Schema,
    combine: UpsertFn,
}

impl Upsert for SchemaUpsert {
    fn apply(&self, _key: &[u8], old: Option<&[u8]>, delta: &[u8]) -> Result<Vec<u8>> {
        let old = old.map(|o| self.schema.decode_value(o)).transpose()?;
        let delta = self.schema.decode_value(delta)?;
        let folded = (self.combine)(old.as_deref(), &delta);
        self.schema.encode_value(&folded)
    }
}

pub struct Database {
    name: String,
    dsn: u32,
    config: DatabaseConfig,
    scheme: Scheme,
    tree: Tree,
    upsert: Option<Arc<dyn Upsert>>,
    shared: Arc<Shared>,
    /// Last completed expire pass, in seconds.
    expired_at: AtomicU32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("dsn", &self.dsn)
            .field("nodes", &self.tree.len())
            .finish()
    }
}

impl Database {
    /// `config` is the configured one; options recorded in `scheme` win.
    pub(crate) fn new(
        name: String,
        mut config: DatabaseConfig,
        scheme: Scheme,
        tree: Tree,
        shared: Arc<Shared>,
    ) -> Self {
        config.compression = scheme.compression.clone();
        config.compaction.node_size = scheme.node_size;
        config.compaction.page_size = scheme.page_size;
        config.expire = scheme.expire();

        let upsert = config.upsert.clone().map(|combine| {
            Arc::new(SchemaUpsert {
                schema: scheme.schema.clone(),
                combine,
            }) as Arc<dyn Upsert>
        });
        Self {
            name,
            dsn: scheme.dsn,
            config,
            scheme,
            tree,
            upsert,
            shared,
            expired_at: AtomicU32::new(value::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database id, as written into log frames.
    pub fn dsn(&self) -> u32 {
        self.dsn
    }

    pub fn schema(&self) -> &Schema {
        &self.scheme.schema
    }

    /// Effective configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub(crate) fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn set(&self, key: &[Datum], value: &[Datum]) -> Result<()> {
        let row = Value::set(self.encode_key(key)?, self.schema().encode_value(value)?);
        self.write(row)
    }

    pub fn delete(&self, key: &[Datum]) -> Result<()> {
        self.write(Value::delete(self.encode_key(key)?))
    }

    /// Writes `delta` to be folded into the current value by the configured
    /// combinator. Without a combinator this is a plain set.
    pub fn upsert(&self, key: &[Datum], delta: &[Datum]) -> Result<()> {
        self.write(self.upsert_row(key, delta)?)
    }

    pub fn get(&self, key: &[Datum]) -> Result<Option<Vec<Datum>>> {
        self.shared.state.check_online()?;
        let key = self.encode_key(key)?;
        let found = self.read(&key, self.shared.seq.lsn(), None)?;
        found.map(|v| self.schema().decode_value(v.data())).transpose()
    }

    pub fn contains(&self, key: &[Datum]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Point lookups at one shared snapshot.
    pub fn multi_get(&self, keys: &[Vec<Datum>]) -> Result<Vec<Option<Vec<Datum>>>> {
        self.shared.state.check_online()?;
        let vlsn = self.shared.seq.lsn();
        keys.iter()
            .map(|key| {
                let found = self.read(&self.encode_key(key)?, vlsn, None)?;
                found.map(|v| self.schema().decode_value(v.data())).transpose()
            })
            .collect()
    }

    /// Live keys at the latest snapshot.
    pub fn count(&self) -> Result<u64> {
        self.shared.state.check_online()?;
        let mut count = 0;
        for row in self.scan(Order::Gte, None, self.shared.seq.lsn(), Vec::new())? {
            row.map_err(|e| self.shared.state.escalate(e))?;
            count += 1;
        }
        Ok(count)
    }

    /// Iterates from `key` (or the first key in `order`) at the latest
    /// snapshot.
    pub fn cursor(self: &Arc<Self>, order: Order, key: Option<&[Datum]>) -> Result<Cursor> {
        self.shared.state.check_online()?;
        self.cursor_at(order, key, self.shared.seq.lsn(), Vec::new())
    }

    /// Rows with keys between `start` and `stop`, both included.
    ///
    /// The walk goes from `start` towards `stop`, ascending or descending
    /// depending on which is larger; `reverse` walks from `stop` to `start`.
    pub fn range(self: &Arc<Self>, start: &[Datum], stop: &[Datum], reverse: bool) -> Result<Cursor> {
        self.shared.state.check_online()?;
        let start = self.encode_key(start)?;
        let stop = self.encode_key(stop)?;
        let ascending = start <= stop;
        let forward = ascending != reverse;
        let (lo, hi) = if ascending { (start, stop) } else { (stop, start) };
        let (order, from, to) = if forward {
            (Order::Gte, lo, hi)
        } else {
            (Order::Lte, hi, lo)
        };

        let rows = self.scan(order, Some(from.clone()), self.shared.seq.lsn(), Vec::new())?;
        let rows = RangeFilter::new(rows, Bound::Included(from), Bound::Included(to), forward);
        Ok(Cursor::new(Arc::clone(self), Box::new(rows)))
    }

    /// Compacts every node now. Returns the number of nodes compacted.
    pub fn compact(&self) -> Result<usize> {
        self.shared.state.check_mutable()?;
        let mut compacted = 0;
        for node in self.tree.nodes()? {
            if self.compact_node(&node)?.is_some() {
                compacted += 1;
            }
        }
        Ok(compacted)
    }

    /// Compacts one node; a failure leaves the engine malfunctioned.
    pub(crate) fn compact_node(&self, node: &Arc<Node>) -> Result<Option<CompactionStats>> {
        compaction::compact_node(&self.tree, node, &self.shared.seq, &self.compaction_params())
            .map_err(|e| self.shared.state.malfunction(e))
    }

    fn compaction_params(&self) -> CompactionParams {
        CompactionParams {
            vlsn: self.shared.txm.vlsn_min(),
            node_size: self.config.compaction.node_size,
            page_size: self.config.compaction.page_size,
            upsert: self.upsert.clone(),
            expire_before: self.expire_cutoff(),
        }
    }

    /// Rows stamped before this time have expired.
    pub(crate) fn expire_cutoff(&self) -> Option<u32> {
        self.config
            .expire
            .map(|ttl| value::now().saturating_sub(ttl.as_secs().min(u32::MAX as u64) as u32))
    }

    pub(crate) fn expired_at(&self) -> u32 {
        self.expired_at.load(Ordering::SeqCst)
    }

    pub(crate) fn set_expired_at(&self, now: u32) {
        self.expired_at.store(now, Ordering::SeqCst);
    }

    pub(crate) fn encode_key(&self, key: &[Datum]) -> Result<Vec<u8>> {
        self.schema().encode_key(key)
    }

    pub(crate) fn upsert_row(&self, key: &[Datum], delta: &[Datum]) -> Result<Value> {
        let key = self.encode_key(key)?;
        let delta = self.schema().encode_value(delta)?;
        Ok(match self.upsert {
            Some(_) => Value::upsert(key, delta),
            None => Value::set(key, delta),
        })
    }

    pub(crate) fn decode_row(&self, row: &Value) -> Result<(Vec<Datum>, Vec<Datum>)> {
        Ok((
            self.schema().decode_key(row.key())?,
            self.schema().decode_value(row.data())?,
        ))
    }

    /// The version of `key` visible at `vlsn`, with `local` (an uncommitted
    /// write of the reading transaction) on top.
    pub(crate) fn read(
        &self,
        key: &[u8],
        vlsn: u64,
        local: Option<Arc<Value>>,
    ) -> Result<Option<Arc<Value>>> {
        let mut chain: Vec<Arc<Value>> = local.into_iter().collect();
        chain.extend(self.tree.get(key).map_err(|e| self.shared.state.escalate(e))?);

        let source: Source<'static> = Box::new(chain.into_iter().map(Ok));
        let merge = MergeIterator::new(Order::Gte, vec![source]);
        ReadIterator::new(merge, vlsn)
            .upsert(self.upsert.clone())
            .next()
            .transpose()
    }

    pub(crate) fn cursor_at(
        self: &Arc<Self>,
        order: Order,
        key: Option<&[Datum]>,
        vlsn: u64,
        local: Vec<Arc<Value>>,
    ) -> Result<Cursor> {
        let start = key.map(|k| self.encode_key(k)).transpose()?;
        let rows = self.scan(order, start, vlsn, local)?;
        Ok(Cursor::new(Arc::clone(self), rows))
    }

    /// Resolved rows visible at `vlsn` from `start` on, merged with the
    /// reading transaction's own writes.
    fn scan(
        &self,
        order: Order,
        start: Option<Vec<u8>>,
        vlsn: u64,
        mut local: Vec<Arc<Value>>,
    ) -> Result<Rows> {
        local.sort_by(|a, b| order.cmp_keys(a.key(), b.key()));
        if let Some(start) = &start {
            local.retain(|v| order.admits(v.key(), start));
        }
        let tree = self
            .tree
            .iter(order, start.as_deref())
            .map_err(|e| self.shared.state.escalate(e))?;

        let sources: Vec<Source<'static>> = vec![Box::new(local.into_iter().map(Ok)), Box::new(tree)];
        let read = ReadIterator::new(MergeIterator::new(order, sources), vlsn)
            .upsert(self.upsert.clone());
        let rows: Rows = match start {
            Some(start) => Box::new(read.filter(move |row| match row {
                Ok(v) => order.admits(v.key(), &start),
                Err(_) => true,
            })),
            None => Box::new(read),
        };
        Ok(rows)
    }

    /// Commits `row` as a transaction of its own.
    fn write(&self, row: Value) -> Result<()> {
        self.shared.state.check_mutable()?;
        let tx = self.shared.txm.begin(false, None)?;
        if let Err(e) = self.shared.txm.set(tx.id, self.dsn, row) {
            self.shared.txm.rollback(tx.id)?;
            return Err(e);
        }

        let state = transaction::commit(&self.shared, tx.id, |dsn| {
            (dsn == self.dsn).then_some(&self.tree)
        });
        match state {
            Ok(TxState::Commit) => Ok(()),
            Ok(state) => {
                self.shared.txm.rollback(tx.id)?;
                Err(Error::Conflict(format!(
                    "write to '{}' lost a conflict ({:?})",
                    self.name, state
                )))
            }
            Err(e) => {
                self.shared.txm.rollback(tx.id)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionConfig, EnvConfig};
    use crate::encoding::schema::KEY_SIZE_MAX;
    use crate::encoding::FieldType;
    use crate::store::{Environment, Status};
    use crate::tmpfs::TempDir;

    fn key(k: &str) -> Vec<Datum> {
        vec![Datum::from(k)]
    }

    fn open(dir: &TempDir, config: DatabaseConfig) -> Result<(Environment, Arc<Database>)> {
        let env = Environment::new(EnvConfig::new(dir.path()));
        env.add_database("test", config)?;
        env.open()?;
        let db = env.database("test")?;
        Ok((env, db))
    }

    fn strings(cursor: Cursor) -> Result<Vec<String>> {
        cursor
            .map(|row| {
                let (key, _) = row?;
                Ok(key[0].as_str().unwrap_or_default().to_string())
            })
            .collect()
    }

    #[test]
    fn test_set_get_delete() -> Result<()> {
        let tmp = TempDir::new()?;
        let (_env, db) = open(&tmp, DatabaseConfig::default())?;

        db.set(&key("a"), &key("1"))?;
        assert_eq!(db.get(&key("a"))?, Some(key("1")));
        assert!(db.contains(&key("a"))?);
        assert_eq!(db.get(&key("b"))?, None);

        db.set(&key("a"), &key("2"))?;
        assert_eq!(db.get(&key("a"))?, Some(key("2")));

        db.delete(&key("a"))?;
        assert_eq!(db.get(&key("a"))?, None);
        assert_eq!(db.count()?, 0);
        Ok(())
    }

    #[test]
    fn test_typed_schema() -> Result<()> {
        let tmp = TempDir::new()?;
        let schema = Schema::new()
            .key("id", FieldType::U32)
            .value("name", FieldType::String)
            .value("score", FieldType::U64);
        let (_env, db) = open(&tmp, DatabaseConfig::new(schema))?;

        for id in [30u32, 2, 100] {
            db.set(&[Datum::from(id)], &[Datum::from(format!("user{}", id)), Datum::from(id as u64 * 10)])?;
        }
        assert_eq!(
            db.get(&[Datum::from(2u32)])?,
            Some(vec![Datum::from("user2"), Datum::from(20u64)])
        );

        let ids: Vec<Datum> = db
            .cursor(Order::Gte, None)?
            .map(|row| row.map(|(k, _)| k[0].clone()))
            .collect::<Result<_>>()?;
        assert_eq!(ids, vec![Datum::from(2u32), Datum::from(30u32), Datum::from(100u32)]);

        assert!(db.set(&[Datum::from("x")], &[Datum::from("y"), Datum::from(1u64)]).is_err());
        Ok(())
    }

    #[test]
    fn test_cursor_orders() -> Result<()> {
        let tmp = TempDir::new()?;
        let (_env, db) = open(&tmp, DatabaseConfig::default())?;
        for k in ["a", "b", "c", "d"] {
            db.set(&key(k), &key(k))?;
        }

        assert_eq!(strings(db.cursor(Order::Gte, Some(&key("b")))?)?, ["b", "c", "d"]);
        assert_eq!(strings(db.cursor(Order::Gt, Some(&key("b")))?)?, ["c", "d"]);
        assert_eq!(strings(db.cursor(Order::Lte, Some(&key("c")))?)?, ["c", "b", "a"]);
        assert_eq!(strings(db.cursor(Order::Lt, Some(&key("c")))?)?, ["b", "a"]);
        assert_eq!(strings(db.cursor(Order::Lt, None)?)?, ["d", "c", "b", "a"]);
        Ok(())
    }

    #[test]
    fn test_range_directions() -> Result<()> {
        let tmp = TempDir::new()?;
        let (_env, db) = open(&tmp, DatabaseConfig::default())?;
        for k in ["a", "b", "c", "d", "e"] {
            db.set(&key(k), &key(k))?;
        }

        assert_eq!(strings(db.range(&key("b"), &key("d"), false)?)?, ["b", "c", "d"]);
        assert_eq!(strings(db.range(&key("d"), &key("b"), false)?)?, ["d", "c", "b"]);
        assert_eq!(strings(db.range(&key("b"), &key("d"), true)?)?, ["d", "c", "b"]);
        assert_eq!(strings(db.range(&key("bb"), &key("z"), false)?)?, ["c", "d", "e"]);
        Ok(())
    }

    #[test]
    fn test_multi_get_and_count() -> Result<()> {
        let tmp = TempDir::new()?;
        let (_env, db) = open(&tmp, DatabaseConfig::default())?;
        db.set(&key("a"), &key("1"))?;
        db.set(&key("c"), &key("3"))?;

        let found = db.multi_get(&[key("a"), key("b"), key("c")])?;
        assert_eq!(found, vec![Some(key("1")), None, Some(key("3"))]);
        assert_eq!(db.count()?, 2);
        Ok(())
    }

    #[test]
    fn test_upsert_with_combinator() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = DatabaseConfig::default().upsert(|old: Option<&[Datum]>, delta: &[Datum]| {
            let mut out = old
                .and_then(|o| o[0].as_str())
                .unwrap_or_default()
                .to_string();
            out.push_str(delta[0].as_str().unwrap_or_default());
            vec![Datum::from(out)]
        });
        let (_env, db) = open(&tmp, config)?;

        db.upsert(&key("k"), &key("a"))?;
        db.upsert(&key("k"), &key("b"))?;
        assert_eq!(db.get(&key("k"))?, Some(key("ab")));

        db.compact()?;
        db.upsert(&key("k"), &key("c"))?;
        assert_eq!(db.get(&key("k"))?, Some(key("abc")));
        Ok(())
    }

    #[test]
    fn test_upsert_without_combinator_overwrites() -> Result<()> {
        let tmp = TempDir::new()?;
        let (_env, db) = open(&tmp, DatabaseConfig::default())?;
        db.set(&key("k"), &key("a"))?;
        db.upsert(&key("k"), &key("b"))?;
        assert_eq!(db.get(&key("k"))?, Some(key("b")));
        Ok(())
    }

    #[test]
    fn test_compact_keeps_data_readable() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = DatabaseConfig::default().compaction(
            CompactionConfig::default()
                .node_size(16 * 1024)
                .page_size(1024),
        );
        let (_env, db) = open(&tmp, config)?;
        for i in 0..2000 {
            db.set(&key(&format!("key{:05}", i)), &key("value"))?;
        }
        assert_eq!(db.compact()?, 1);
        assert!(db.tree().len() > 1);
        assert_eq!(db.count()?, 2000);
        assert_eq!(db.get(&key("key01234"))?, Some(key("value")));
        Ok(())
    }

    #[test]
    fn test_single_statement_conflict() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = open(&tmp, DatabaseConfig::default())?;

        let mut tx = env.begin()?;
        tx.set(&db, &key("x"), &key("tx"))?;
        assert!(matches!(db.set(&key("x"), &key("single")), Err(Error::Conflict(_))));

        assert_eq!(tx.commit()?, TxState::Commit);
        assert_eq!(db.get(&key("x"))?, Some(key("tx")));
        db.set(&key("x"), &key("single"))?;
        assert_eq!(db.get(&key("x"))?, Some(key("single")));
        Ok(())
    }

    #[test]
    fn test_oversized_key_is_rejected() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = open(&tmp, DatabaseConfig::default())?;
        let lsn = db.shared().seq.lsn();

        let long = key(&"x".repeat(KEY_SIZE_MAX));
        assert!(matches!(db.set(&long, &key("1")), Err(Error::InvalidInput(_))));
        assert!(matches!(db.upsert(&long, &key("1")), Err(Error::InvalidInput(_))));
        let mut tx = env.begin()?;
        assert!(matches!(tx.set(&db, &long, &key("1")), Err(Error::InvalidInput(_))));
        tx.rollback()?;

        assert_eq!(db.shared().seq.lsn(), lsn);
        db.set(&key("a"), &key("1"))?;
        db.compact()?;
        assert_eq!(env.status(), Status::Online);
        assert_eq!(db.get(&key("a"))?, Some(key("1")));
        Ok(())
    }

    #[test]
    fn test_compacting_a_replaced_node_is_a_no_op() -> Result<()> {
        let tmp = TempDir::new()?;
        let (env, db) = open(&tmp, DatabaseConfig::default())?;
        db.set(&key("a"), &key("1"))?;

        let stale = db.tree().nodes()?[0].clone();
        assert_eq!(db.compact()?, 1);
        assert!(db.compact_node(&stale)?.is_none());
        assert_eq!(env.status(), Status::Online);
        db.set(&key("b"), &key("2"))?;
        assert_eq!(db.count()?, 2);
        Ok(())
    }
}
