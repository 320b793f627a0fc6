//! The per-database node tree.
//!
//! Nodes partition the key space into contiguous, disjoint ranges. Each node
//! is stored under its routing key: the first node under the empty key, every
//! other one under the smallest key of its file when it was created. A key
//! belongs to the node with the greatest routing key not above it.
//!
//! The map is guarded by one `RwLock`. Writers and readers take it shared
//! for the duration of a routing decision; compaction takes it exclusively
//! only to swap a node for its successors.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use super::compression::Compression;
use super::iterator::{MergeIterator, Order};
use super::node::{Node, NodeName};
use super::sstable::{NodeFile, NodeWriter, PageBuilder};
use super::value::Value;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct TreeOptions {
    pub compression: Compression,
    pub mmap: bool,
    pub verify: bool,
}

#[derive(Debug)]
pub struct Tree {
    dir: PathBuf,
    options: TreeOptions,
    nodes: RwLock<BTreeMap<Vec<u8>, Arc<Node>>>,
    garbage: Mutex<Vec<Arc<Node>>>,
}

fn route<'a>(nodes: &'a BTreeMap<Vec<u8>, Arc<Node>>, key: &[u8]) -> Option<(&'a Vec<u8>, &'a Arc<Node>)> {
    nodes
        .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
        .next_back()
        .or_else(|| nodes.iter().next())
}

impl Tree {
    pub fn new(dir: PathBuf, options: TreeOptions) -> Self {
        Self {
            dir,
            options,
            nodes: RwLock::new(BTreeMap::new()),
            garbage: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> TreeOptions {
        self.options
    }

    pub fn open_node(&self, id: u64, path: PathBuf) -> Result<Node> {
        let file = NodeFile::open(
            &path,
            self.options.compression,
            self.options.mmap,
            self.options.verify,
        )?;
        Ok(Node::new(id, path, file))
    }

    /// Writes a node file holding one empty page and opens it under its
    /// final name.
    pub fn create_empty_node(&self, parent: u64, id: u64, lsn_max: u64) -> Result<Arc<Node>> {
        let incomplete = NodeName::Incomplete { parent, id }.path(&self.dir);
        let seal = NodeName::Seal { parent, id }.path(&self.dir);
        let live = NodeName::Live { id }.path(&self.dir);

        let mut writer = NodeWriter::create(&incomplete)?;
        writer.add_page(PageBuilder::new(self.options.compression).finish()?)?;
        writer.finish(lsn_max)?;
        std::fs::rename(&incomplete, &seal)?;
        std::fs::rename(&seal, &live)?;

        tracing::debug!(node = id, dir = %self.dir.display(), "Created empty node");
        Ok(Arc::new(self.open_node(id, live)?))
    }

    /// Installs nodes found on disk. The node with the smallest key takes
    /// the empty routing key.
    pub fn load(&self, nodes: Vec<Arc<Node>>) -> Result<()> {
        let mut map = self.nodes.write()?;
        let mut sorted: Vec<(Vec<u8>, Arc<Node>)> = nodes
            .into_iter()
            .map(|n| (n.min_key().map(|k| k.to_vec()).unwrap_or_default(), n))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        for (i, (key, node)) in sorted.into_iter().enumerate() {
            let key = if i == 0 { Vec::new() } else { key };
            if map.insert(key, Arc::clone(&node)).is_some() {
                return Err(Error::IndexCorruption(format!(
                    "node {} overlaps another node",
                    node.id()
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().map(|n| n.is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    /// Snapshot of the nodes in key order.
    pub fn nodes(&self) -> Result<Vec<Arc<Node>>> {
        Ok(self.nodes.read()?.values().cloned().collect())
    }

    pub fn route(&self, key: &[u8]) -> Result<Arc<Node>> {
        let nodes = self.nodes.read()?;
        route(&nodes, key)
            .map(|(_, node)| Arc::clone(node))
            .ok_or_else(|| Error::InvalidState("tree has no nodes".to_string()))
    }

    /// Inserts a committed version into the owning node's active index.
    pub fn set(&self, value: Arc<Value>) -> Result<()> {
        let nodes = self.nodes.read()?;
        let (_, node) = route(&nodes, value.key())
            .ok_or_else(|| Error::InvalidState("tree has no nodes".to_string()))?;
        node.set(value)
    }

    /// Every version of `key`, newest first.
    pub fn get(&self, key: &[u8]) -> Result<Vec<Arc<Value>>> {
        self.route(key)?.get(key)
    }

    /// Whether a version of `key` newer than `vlsn` has been committed.
    pub fn has_newer(&self, key: &[u8], vlsn: u64) -> Result<bool> {
        Ok(self
            .get(key)?
            .first()
            .map(|v| v.lsn() > vlsn)
            .unwrap_or(false))
    }

    pub fn iter(&self, order: Order, key: Option<&[u8]>) -> Result<TreeIter> {
        let map = self.nodes.read()?;
        let start = key.and_then(|k| route(&map, k).map(|(rk, _)| rk.clone()));
        let nodes: Vec<Arc<Node>> = match (order.is_forward(), start) {
            (true, Some(start)) => map.range(start..).map(|(_, n)| Arc::clone(n)).collect(),
            (true, None) => map.values().cloned().collect(),
            (false, Some(start)) => map.range(..=start).rev().map(|(_, n)| Arc::clone(n)).collect(),
            (false, None) => map.values().rev().cloned().collect(),
        };
        Ok(TreeIter {
            nodes,
            pos: 0,
            order,
            seek: key.map(|k| k.to_vec()),
            current: None,
        })
    }

    /// Swaps `old` for its compaction successors.
    ///
    /// The first successor inherits the old routing key, the others are keyed
    /// by their smallest key. Writes that reached the old node's active index
    /// during compaction are routed into the successors. If the tree would be
    /// left without nodes, `bootstrap` supplies an empty one.
    ///
    /// Files are renamed after the swap: the old file to `.db.gc` first, then
    /// every sealed successor to its final name.
    pub fn replace<F>(&self, old: &Arc<Node>, successors: Vec<Arc<Node>>, bootstrap: F) -> Result<()>
    where
        F: FnOnce() -> Result<Arc<Node>>,
    {
        let mut installed = successors.clone();
        {
            let mut map = self.nodes.write()?;
            let old_key = map
                .iter()
                .find(|(_, n)| Arc::ptr_eq(n, old))
                .map(|(k, _)| k.clone())
                .ok_or_else(|| {
                    Error::InvalidState(format!("node {} is not in the tree", old.id()))
                })?;
            map.remove(&old_key);

            if successors.is_empty() {
                if map.is_empty() {
                    let node = bootstrap()?;
                    installed.push(Arc::clone(&node));
                    map.insert(Vec::new(), node);
                } else if old_key.is_empty() {
                    let first_key = map.keys().next().cloned();
                    if let Some(first) = first_key.and_then(|k| map.remove(&k)) {
                        map.insert(Vec::new(), first);
                    }
                }
            } else {
                for (i, node) in successors.iter().enumerate() {
                    let key = if i == 0 {
                        old_key.clone()
                    } else {
                        node.min_key().map(|k| k.to_vec()).unwrap_or_default()
                    };
                    map.insert(key, Arc::clone(node));
                }
            }

            for value in old.active()?.values() {
                if let Some((_, node)) = route(&map, value.key()) {
                    node.set(value)?;
                }
            }
            old.mark_split();
        }

        old.rename(NodeName::Gc { id: old.id() }.path(&self.dir))?;
        for node in &installed {
            let live = NodeName::Live { id: node.id() }.path(&self.dir);
            if node.path() != live {
                node.rename(live)?;
            }
        }
        self.garbage.lock()?.push(Arc::clone(old));

        tracing::debug!(
            node = old.id(),
            successors = installed.len(),
            "Replaced node"
        );
        Ok(())
    }

    /// Unlinks replaced node files nobody reads any more.
    pub fn collect_garbage(&self) -> Result<usize> {
        let mut garbage = self.garbage.lock()?;
        let pending = std::mem::take(&mut *garbage);
        let mut removed = 0;
        let mut result = Ok(());
        for node in pending {
            if result.is_err() || Arc::strong_count(&node) > 1 {
                garbage.push(node);
                continue;
            }
            match std::fs::remove_file(node.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed += 1,
                Err(e) => {
                    garbage.push(node);
                    result = Err(e);
                }
            }
        }
        result?;
        Ok(removed)
    }

    pub fn garbage_len(&self) -> usize {
        self.garbage.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether a replaced node has no readers left and can be unlinked.
    pub fn garbage_ready(&self) -> bool {
        self.garbage
            .lock()
            .map(|g| g.iter().any(|node| Arc::strong_count(node) == 1))
            .unwrap_or(false)
    }

    /// Bytes held in memory by all nodes.
    pub fn used(&self) -> usize {
        self.nodes
            .read()
            .map(|n| n.values().map(|node| node.used()).sum())
            .unwrap_or(0)
    }

    /// Oldest lsn any node still holds only in memory.
    pub fn lsn_min_memory(&self) -> Option<u64> {
        self.nodes
            .read()
            .ok()?
            .values()
            .filter_map(|node| node.lsn_min_memory())
            .min()
    }
}

/// Concatenates the per-node merges of a tree snapshot in key order.
pub struct TreeIter {
    nodes: Vec<Arc<Node>>,
    pos: usize,
    order: Order,
    seek: Option<Vec<u8>>,
    current: Option<MergeIterator<'static>>,
}

impl Iterator for TreeIter {
    type Item = Result<Arc<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(Ok(merged)) => return Some(Ok(merged.value)),
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.current = None,
                }
            }
            let node = self.nodes.get(self.pos)?;
            self.pos += 1;
            let seek = self.seek.take();
            match node.sources(self.order, seek.as_deref()) {
                Ok(sources) => self.current = Some(MergeIterator::new(self.order, sources)),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn options() -> TreeOptions {
        TreeOptions {
            compression: Compression::None,
            mmap: true,
            verify: true,
        }
    }

    fn value(key: &str, lsn: u64) -> Arc<Value> {
        Arc::new(Value::new(key.as_bytes().to_vec(), b"v".to_vec(), lsn, 0, 0))
    }

    fn keys(iter: TreeIter) -> Vec<String> {
        iter.map(|v| String::from_utf8(v.unwrap().key().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_single_node_routing() -> Result<()> {
        let tmp = TempDir::new()?;
        let tree = Tree::new(tmp.path().to_path_buf(), options());
        let node = tree.create_empty_node(0, 1, 0)?;
        tree.load(vec![node])?;

        tree.set(value("b", 1))?;
        tree.set(value("a", 2))?;
        assert_eq!(tree.route(b"zzz")?.id(), 1);
        assert!(tree.has_newer(b"a", 1)?);
        assert!(!tree.has_newer(b"a", 2)?);
        assert_eq!(keys(tree.iter(Order::Gte, None)?), vec!["a", "b"]);
        assert_eq!(keys(tree.iter(Order::Lt, Some(b"b"))?), vec!["a"]);
        assert_eq!(tree.lsn_min_memory(), Some(1));
        Ok(())
    }

    #[test]
    fn test_replace_with_no_successors_bootstraps() -> Result<()> {
        let tmp = TempDir::new()?;
        let tree = Tree::new(tmp.path().to_path_buf(), options());
        let old = tree.create_empty_node(0, 1, 0)?;
        tree.load(vec![Arc::clone(&old)])?;
        old.set(value("late", 9))?;

        tree.replace(&old, Vec::new(), || tree.create_empty_node(1, 2, 9))?;
        assert_eq!(tree.len(), 1);
        let node = tree.route(b"late")?;
        assert_eq!(node.id(), 2);
        assert_eq!(node.get(b"late")?.len(), 1);
        assert!(NodeName::Gc { id: 1 }.path(tmp.path()).exists());

        assert_eq!(tree.collect_garbage()?, 0);
        drop(old);
        assert_eq!(tree.collect_garbage()?, 1);
        assert!(!NodeName::Gc { id: 1 }.path(tmp.path()).exists());
        Ok(())
    }
}
