//! Node compaction.
//!
//! Compaction folds a node's frozen in-memory generation into its file and
//! writes the result as one or more successor nodes:
//!
//! 1. lock the node and rotate its active generation into `frozen`
//! 2. merge `frozen` with the node file and pass the stream through a
//!    [`WriteIterator`] at the oldest open snapshot
//! 3. cut pages at `page_size` and node files at `node_size`, always between
//!    keys, writing each file as `<parent>.<id>.db.incomplete`
//! 4. rename every finished file to `.db.seal`
//! 5. swap the node for its successors in the tree, which renames the old
//!    file to `.db.gc` and each successor to `<id>.db`
//!
//! An empty result removes the node; if it was the last one, an empty
//! bootstrap node takes its place. Every successor records the highest lsn
//! folded into it so log replay can skip rows already on disk.

use std::path::PathBuf;
use std::sync::Arc;

use super::memtable::Memtable;
use super::iterator::{MergeIterator, Order, Source, Upsert, WriteIterator};
use super::node::{Node, NodeName, SPLIT};
use super::sequence::Sequence;
use super::sstable::{NodeWriter, PageBuilder};
use super::tree::Tree;
use crate::error::Result;

/// Inputs of one compaction run.
#[derive(Clone)]
pub struct CompactionParams {
    /// Oldest snapshot any open transaction can still read at.
    pub vlsn: u64,
    /// File size at which the output is split into another node.
    pub node_size: u64,
    /// Uncompressed size at which a page is closed.
    pub page_size: u32,
    pub upsert: Option<Arc<dyn Upsert>>,
    /// Rows stamped before this time are dropped.
    pub expire_before: Option<u32>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    pub node: u64,
    pub successors: usize,
    pub keys: u64,
    pub rows: u64,
    pub pages: u64,
    pub bytes: u64,
}

/// A successor file being written.
struct Output {
    id: u64,
    writer: NodeWriter,
    page: PageBuilder,
}

/// Compacts `node` into its successors.
///
/// Returns `Ok(None)` when another compaction already holds the node or has
/// already replaced it. On
/// failure before the tree swap, partial files are removed and the node is
/// restored to its previous state.
pub fn compact_node(
    tree: &Tree,
    node: &Arc<Node>,
    seq: &Sequence,
    params: &CompactionParams,
) -> Result<Option<CompactionStats>> {
    if !node.lock() {
        return Ok(None);
    }
    // Only the lock holder replaces a node, so a node taken from an older
    // tree snapshot shows SPLIT here once someone else compacted it.
    if node.has_flag(SPLIT) {
        node.unlock();
        return Ok(None);
    }
    let rotated = seq.commit_lock().and_then(|_commit| node.rotate());
    let frozen = match rotated {
        Ok(frozen) => frozen,
        Err(e) => {
            node.unlock();
            return Err(e);
        }
    };
    let lsn_max = node.lsn_max().max(frozen.lsn_max());

    tracing::debug!(
        node = node.id(),
        rows = frozen.len(),
        vlsn = params.vlsn,
        "Starting node compaction"
    );

    let mut created = Vec::new();
    let (successors, stats) =
        match write_successors(tree, node, seq, params, &frozen, lsn_max, &mut created) {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(node = node.id(), error = %e, "Compaction failed");
                for path in &created {
                    // Recovery removes whatever is left by name.
                    if let Err(rm) = std::fs::remove_file(path) {
                        tracing::warn!(path = %path.display(), error = %rm, "Failed to remove partial node");
                    }
                }
                let restored = node.unrotate();
                node.unlock();
                restored?;
                return Err(e);
            }
        };

    // Past this point the tree may already point at the successors, so a
    // failure is left for recovery to reconcile by file name.
    let result = tree.replace(node, successors, || {
        tree.create_empty_node(node.id(), seq.next_nsn(), lsn_max)
    });
    node.unlock();
    if let Err(e) = result {
        tracing::error!(node = node.id(), error = %e, "Node swap failed");
        return Err(e);
    }

    tracing::info!(
        node = stats.node,
        successors = stats.successors,
        keys = stats.keys,
        rows = stats.rows,
        bytes = stats.bytes,
        "Compaction finished"
    );
    Ok(Some(stats))
}

fn write_successors(
    tree: &Tree,
    node: &Arc<Node>,
    seq: &Sequence,
    params: &CompactionParams,
    frozen: &Arc<Memtable>,
    lsn_max: u64,
    created: &mut Vec<PathBuf>,
) -> Result<(Vec<Arc<Node>>, CompactionStats)> {
    let compression = tree.options().compression;
    let sources: Vec<Source<'static>> = vec![
        Box::new(frozen.iter(Order::Gte, None)),
        Box::new(node.file().iter(Order::Gte, None)),
    ];
    let merge = MergeIterator::new(Order::Gte, sources);
    let rows = WriteIterator::new(merge, params.vlsn)
        .upsert(params.upsert.clone())
        .expire_before(params.expire_before);

    let mut stats = CompactionStats {
        node: node.id(),
        ..Default::default()
    };
    let mut finished: Vec<(u64, PathBuf)> = Vec::new();
    let mut output: Option<Output> = None;

    for run in rows {
        let run = run?;

        let split = output.as_ref().is_some_and(|out| {
            out.writer.size() + out.page.size() as u64 >= params.node_size
        });
        if split {
            if let Some(out) = output.take() {
                finished.push(seal(tree, node.id(), out, lsn_max, &mut stats)?);
            }
        }
        if let Some(out) = output.as_mut() {
            if out.page.size() >= params.page_size as usize {
                let page = std::mem::replace(&mut out.page, PageBuilder::new(compression));
                out.writer.add_page(page.finish()?)?;
                stats.pages += 1;
            }
        }
        if output.is_none() {
            let id = seq.next_nsn();
            let path = NodeName::Incomplete {
                parent: node.id(),
                id,
            }
            .path(tree.dir());
            let writer = NodeWriter::create(&path)?;
            created.push(path);
            output = Some(Output {
                id,
                writer,
                page: PageBuilder::new(compression),
            });
        }

        if let Some(out) = output.as_mut() {
            stats.keys += 1;
            for version in &run {
                out.page.add(version)?;
                stats.rows += 1;
            }
        }
    }
    if let Some(out) = output.take() {
        finished.push(seal(tree, node.id(), out, lsn_max, &mut stats)?);
    }

    let mut successors = Vec::with_capacity(finished.len());
    for (id, path) in finished {
        created.push(path.clone());
        successors.push(Arc::new(tree.open_node(id, path)?));
    }
    stats.successors = successors.len();
    Ok((successors, stats))
}

/// Closes the last page, writes the index and renames the file to `.seal`.
fn seal(
    tree: &Tree,
    parent: u64,
    mut out: Output,
    lsn_max: u64,
    stats: &mut CompactionStats,
) -> Result<(u64, PathBuf)> {
    let page = std::mem::replace(&mut out.page, PageBuilder::new(tree.options().compression));
    if !page.is_empty() || out.writer.size() == 0 {
        out.writer.add_page(page.finish()?)?;
        stats.pages += 1;
    }
    stats.bytes += out.writer.size();
    out.writer.finish(lsn_max)?;

    let id = out.id;
    let incomplete = NodeName::Incomplete { parent, id }.path(tree.dir());
    let seal = NodeName::Seal { parent, id }.path(tree.dir());
    std::fs::rename(&incomplete, &seal)?;
    Ok((id, seal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::compression::Compression;
    use crate::store::iterator::upsert::tests::Concat;
    use crate::store::tree::TreeOptions;
    use crate::store::value::{Value, DELETE, UPSERT};
    use crate::tmpfs::TempDir;

    fn setup(dir: &std::path::Path, compression: Compression) -> Result<(Tree, Sequence)> {
        let tree = Tree::new(
            dir.to_path_buf(),
            TreeOptions {
                compression,
                mmap: true,
                verify: true,
            },
        );
        let seq = Sequence::new();
        let node = tree.create_empty_node(0, seq.next_nsn(), 0)?;
        tree.load(vec![node])?;
        Ok((tree, seq))
    }

    fn params(vlsn: u64) -> CompactionParams {
        CompactionParams {
            vlsn,
            node_size: 64 * 1024 * 1024,
            page_size: 64 * 1024,
            upsert: None,
            expire_before: None,
        }
    }

    fn put(tree: &Tree, key: &str, data: &str, lsn: u64, flags: u8) -> Result<()> {
        tree.set(Arc::new(Value::new(
            key.as_bytes().to_vec(),
            data.as_bytes().to_vec(),
            lsn,
            flags,
            1,
        )))
    }

    fn scan(tree: &Tree) -> Result<Vec<(Vec<u8>, u64)>> {
        tree.iter(Order::Gte, None)?
            .map(|v| v.map(|v| (v.key().to_vec(), v.lsn())))
            .collect()
    }

    fn files(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_compaction_moves_memory_to_disk() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::Lz4)?;
        put(&tree, "a", "1", 1, 0)?;
        put(&tree, "b", "2", 2, 0)?;
        put(&tree, "a", "3", 3, 0)?;

        let node = tree.route(b"a")?;
        let stats = compact_node(&tree, &node, &seq, &params(10))?.unwrap();
        assert_eq!(stats.successors, 1);
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.rows, 2);

        let successor = tree.route(b"a")?;
        assert_ne!(successor.id(), node.id());
        assert_eq!(successor.lsn_max(), 3);
        assert!(successor.active()?.is_empty());
        assert_eq!(scan(&tree)?, vec![(b"a".to_vec(), 3), (b"b".to_vec(), 2)]);

        drop(node);
        tree.collect_garbage()?;
        assert_eq!(files(tmp.path()), vec![format!("{}.db", successor.id())]);
        Ok(())
    }

    #[test]
    fn test_compaction_keeps_versions_above_snapshot() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::None)?;
        put(&tree, "k", "1", 1, 0)?;
        put(&tree, "k", "2", 2, 0)?;
        put(&tree, "k", "3", 3, 0)?;

        let node = tree.route(b"k")?;
        compact_node(&tree, &node, &seq, &params(2))?;
        let chain = tree.get(b"k")?;
        assert_eq!(chain.iter().map(|v| v.lsn()).collect::<Vec<_>>(), vec![3, 2]);
        assert!(chain[1].is_dup());
        Ok(())
    }

    #[test]
    fn test_compaction_splits_large_node() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::None)?;
        for i in 0..10_000u64 {
            put(&tree, &format!("key{:06}", i), "value", i + 1, 0)?;
        }

        let node = tree.route(b"key")?;
        let mut p = params(u64::MAX);
        p.node_size = 64 * 1024;
        p.page_size = 4 * 1024;
        let stats = compact_node(&tree, &node, &seq, &p)?.unwrap();
        assert!(stats.successors > 1);
        assert_eq!(tree.len(), stats.successors);

        let nodes = tree.nodes()?;
        for pair in nodes.windows(2) {
            let left = pair[0].file().index().max_key().unwrap().to_vec();
            let right = pair[1].min_key().unwrap().to_vec();
            assert!(left < right);
        }

        let keys: Vec<Vec<u8>> = scan(&tree)?.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 10_000);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(key, format!("key{:06}", i).as_bytes());
        }
        for i in [0u64, 4_999, 9_999] {
            let key = format!("key{:06}", i);
            assert_eq!(tree.get(key.as_bytes())?[0].lsn(), i + 1);
        }
        Ok(())
    }

    #[test]
    fn test_compaction_drops_deleted_keys() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::None)?;
        put(&tree, "k", "v", 1, 0)?;
        put(&tree, "k", "", 2, DELETE)?;

        let node = tree.route(b"k")?;
        let stats = compact_node(&tree, &node, &seq, &params(5))?.unwrap();
        // Last node emptied: a bootstrap node replaces it.
        assert_eq!(stats.successors, 0);
        assert_eq!(tree.len(), 1);
        let bootstrap = tree.route(b"k")?;
        assert_eq!(bootstrap.lsn_max(), 2);
        assert!(scan(&tree)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_compaction_folds_upserts() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::Zstd)?;
        put(&tree, "k", "a", 1, 0)?;
        put(&tree, "k", "b", 2, UPSERT)?;
        put(&tree, "k", "c", 3, UPSERT)?;

        let node = tree.route(b"k")?;
        let mut p = params(10);
        p.upsert = Some(Arc::new(Concat));
        compact_node(&tree, &node, &seq, &p)?;

        let chain = tree.get(b"k")?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].data(), b"abc");
        assert!(!chain[0].is_upsert());
        Ok(())
    }

    #[test]
    fn test_compaction_after_undone_rotation() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::None)?;
        put(&tree, "a", "1", 1, 0)?;

        let node = tree.route(b"a")?;
        assert!(node.lock());
        let frozen = node.rotate()?;
        put(&tree, "b", "2", 2, 0)?;
        node.unrotate()?;
        node.unlock();
        assert_eq!(frozen.len(), 2);

        compact_node(&tree, &node, &seq, &params(10))?;
        put(&tree, "c", "3", 3, 0)?;
        let keys: Vec<Vec<u8>> = scan(&tree)?.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_locked_node_is_skipped() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::None)?;
        let node = tree.route(b"a")?;
        assert!(node.lock());
        assert!(compact_node(&tree, &node, &seq, &params(1))?.is_none());
        node.unlock();
        Ok(())
    }

    #[test]
    fn test_replaced_node_is_skipped() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::None)?;
        put(&tree, "a", "1", 1, 0)?;

        let stale = tree.route(b"a")?;
        assert!(compact_node(&tree, &stale, &seq, &params(10))?.is_some());
        assert!(compact_node(&tree, &stale, &seq, &params(10))?.is_none());
        assert!(!stale.is_locked());

        put(&tree, "b", "2", 2, 0)?;
        let keys: Vec<Vec<u8>> = scan(&tree)?.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_concurrent_compactions_of_one_snapshot() -> Result<()> {
        let tmp = TempDir::new()?;
        let (tree, seq) = setup(tmp.path(), Compression::None)?;
        for i in 0..2_000u64 {
            put(&tree, &format!("key{:05}", i), "value", i + 1, 0)?;
        }
        let mut p = params(u64::MAX);
        p.node_size = 16 * 1024;
        p.page_size = 2 * 1024;
        compact_node(&tree, &tree.route(b"key")?, &seq, &p)?;
        for i in 0..2_000u64 {
            put(&tree, &format!("key{:05}", i), "newer", i + 3_000, 0)?;
        }

        let snapshot = tree.nodes()?;
        let compacted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| -> Result<usize> {
                        let mut n = 0;
                        for node in &snapshot {
                            if compact_node(&tree, node, &seq, &p)?.is_some() {
                                n += 1;
                            }
                        }
                        Ok(n)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum::<Result<usize>>()
        })?;

        // Every node of the snapshot is compacted exactly once.
        assert_eq!(compacted, snapshot.len());
        let rows = scan(&tree)?;
        assert_eq!(rows.len(), 2_000);
        assert!(rows.iter().all(|(_, lsn)| *lsn >= 3_000));
        Ok(())
    }
}
