//! Tree nodes.
//!
//! A node owns one immutable node file and two generations of in-memory
//! index: `active` receives every committed write routed to the node, and
//! `frozen` holds the generation a running compaction is merging into new
//! files. Readers always consult active, then frozen, then the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use super::iterator::{Order, Source};
use super::memtable::Memtable;
use super::sstable::NodeFile;
use super::value::Value;
use crate::error::{Error, Result};

/// Node is held by a compaction.
pub const LOCK: u8 = 0x01;
/// The active generation has been rotated out into `frozen`.
pub const ROTATE: u8 = 0x02;
/// Node has been replaced in the tree and waits for its readers.
pub const SPLIT: u8 = 0x04;

/// Node file names by lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeName {
    /// `<id>.db`
    Live { id: u64 },
    /// `<parent>.<id>.db.incomplete`
    Incomplete { parent: u64, id: u64 },
    /// `<parent>.<id>.db.seal`
    Seal { parent: u64, id: u64 },
    /// `<id>.db.gc`
    Gc { id: u64 },
}

impl NodeName {
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(stem) = name.strip_suffix(".db.incomplete") {
            let (parent, id) = parse_pair(stem)?;
            return Some(NodeName::Incomplete { parent, id });
        }
        if let Some(stem) = name.strip_suffix(".db.seal") {
            let (parent, id) = parse_pair(stem)?;
            return Some(NodeName::Seal { parent, id });
        }
        if let Some(stem) = name.strip_suffix(".db.gc") {
            return stem.parse().ok().map(|id| NodeName::Gc { id });
        }
        if let Some(stem) = name.strip_suffix(".db") {
            return stem.parse().ok().map(|id| NodeName::Live { id });
        }
        None
    }

    pub fn id(&self) -> u64 {
        match *self {
            NodeName::Live { id }
            | NodeName::Incomplete { id, .. }
            | NodeName::Seal { id, .. }
            | NodeName::Gc { id } => id,
        }
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.to_string())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeName::Live { id } => write!(f, "{}.db", id),
            NodeName::Incomplete { parent, id } => write!(f, "{}.{}.db.incomplete", parent, id),
            NodeName::Seal { parent, id } => write!(f, "{}.{}.db.seal", parent, id),
            NodeName::Gc { id } => write!(f, "{}.db.gc", id),
        }
    }
}

fn parse_pair(stem: &str) -> Option<(u64, u64)> {
    let (parent, id) = stem.split_once('.')?;
    Some((parent.parse().ok()?, id.parse().ok()?))
}

#[derive(Debug)]
struct Generations {
    active: Arc<Memtable>,
    frozen: Option<Arc<Memtable>>,
}

pub struct Node {
    id: u64,
    path: RwLock<PathBuf>,
    file: Arc<NodeFile>,
    generations: RwLock<Generations>,
    flags: AtomicU8,
    backup: AtomicU64,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("flags", &self.flags.load(Ordering::SeqCst))
            .field("file", &self.file)
            .finish()
    }
}

impl Node {
    pub fn new(id: u64, path: PathBuf, file: NodeFile) -> Self {
        Self {
            id,
            path: RwLock::new(path),
            file: Arc::new(file),
            generations: RwLock::new(Generations {
                active: Arc::new(Memtable::new()),
                frozen: None,
            }),
            flags: AtomicU8::new(0),
            backup: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> PathBuf {
        self.path
            .read()
            .map(|p| p.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Renames the node file; the open handle keeps working.
    pub fn rename(&self, to: PathBuf) -> Result<()> {
        let mut path = self.path.write()?;
        std::fs::rename(&*path, &to)?;
        *path = to;
        Ok(())
    }

    pub fn file(&self) -> &Arc<NodeFile> {
        &self.file
    }

    /// Smallest key on disk, `None` for an empty node file.
    pub fn min_key(&self) -> Option<&[u8]> {
        self.file.index().min_key()
    }

    /// Highest lsn already persisted in the node file.
    pub fn lsn_max(&self) -> u64 {
        self.file.index().header().lsn_max
    }

    pub fn set(&self, value: Arc<Value>) -> Result<()> {
        self.generations.read()?.active.set(value);
        Ok(())
    }

    pub fn active(&self) -> Result<Arc<Memtable>> {
        Ok(Arc::clone(&self.generations.read()?.active))
    }

    pub fn frozen(&self) -> Result<Option<Arc<Memtable>>> {
        Ok(self.generations.read()?.frozen.clone())
    }

    /// Every version of `key` held by this node, newest first.
    pub fn get(&self, key: &[u8]) -> Result<Vec<Arc<Value>>> {
        let (active, frozen) = {
            let g = self.generations.read()?;
            (Arc::clone(&g.active), g.frozen.clone())
        };
        let mut chain = active.chain(key);
        if let Some(frozen) = frozen {
            chain.extend(frozen.chain(key));
        }
        chain.extend(self.file.get(key)?);
        Ok(chain)
    }

    /// Sorted sources in priority order: active, frozen, file.
    pub fn sources(&self, order: Order, key: Option<&[u8]>) -> Result<Vec<Source<'static>>> {
        let (active, frozen) = {
            let g = self.generations.read()?;
            (Arc::clone(&g.active), g.frozen.clone())
        };
        let mut sources: Vec<Source<'static>> = Vec::with_capacity(3);
        sources.push(Box::new(active.iter(order, key)));
        if let Some(frozen) = frozen {
            sources.push(Box::new(frozen.iter(order, key)));
        }
        sources.push(Box::new(self.file.iter(order, key)));
        Ok(sources)
    }

    /// Takes the compaction lock. Returns false if another compaction holds
    /// it.
    pub fn lock(&self) -> bool {
        self.flags.fetch_or(LOCK, Ordering::SeqCst) & LOCK == 0
    }

    pub fn unlock(&self) {
        self.flags.fetch_and(!LOCK, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.has_flag(LOCK)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    pub fn mark_split(&self) {
        self.flags.fetch_or(SPLIT, Ordering::SeqCst);
    }

    /// Freezes the active generation and starts a new one.
    pub fn rotate(&self) -> Result<Arc<Memtable>> {
        let mut g = self.generations.write()?;
        if g.frozen.is_some() {
            return Err(Error::InvalidState(format!(
                "node {} is already rotated",
                self.id
            )));
        }
        let frozen = std::mem::replace(&mut g.active, Arc::new(Memtable::new()));
        g.frozen = Some(Arc::clone(&frozen));
        self.flags.fetch_or(ROTATE, Ordering::SeqCst);
        Ok(frozen)
    }

    /// Undoes a rotation after a failed compaction: writes that arrived since
    /// are folded back into the frozen generation, which becomes active.
    pub fn unrotate(&self) -> Result<()> {
        let mut g = self.generations.write()?;
        if let Some(frozen) = g.frozen.take() {
            for value in g.active.values() {
                frozen.set(value);
            }
            g.active = frozen;
        }
        self.flags.fetch_and(!ROTATE, Ordering::SeqCst);
        Ok(())
    }

    /// Bytes held in memory across both generations.
    pub fn used(&self) -> usize {
        self.generations
            .read()
            .map(|g| g.active.used() + g.frozen.as_ref().map(|f| f.used()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Oldest lsn still only in memory.
    pub fn lsn_min_memory(&self) -> Option<u64> {
        let g = self.generations.read().ok()?;
        let frozen = g.frozen.as_ref().and_then(|f| f.lsn_min());
        match (g.active.lsn_min(), frozen) {
            (Some(a), Some(f)) => Some(a.min(f)),
            (a, f) => a.or(f),
        }
    }

    /// Oldest row timestamp across memory and disk.
    pub fn ts_min(&self) -> Option<u32> {
        let header = self.file.index().header();
        let disk = (header.keys > 0).then_some(header.ts_min);
        let memory = self
            .generations
            .read()
            .ok()
            .and_then(|g| {
                let frozen = g.frozen.as_ref().and_then(|f| f.timestamp_min());
                match (g.active.timestamp_min(), frozen) {
                    (Some(a), Some(f)) => Some(a.min(f)),
                    (a, f) => a.or(f),
                }
            });
        match (disk, memory) {
            (Some(d), Some(m)) => Some(d.min(m)),
            (d, m) => d.or(m),
        }
    }

    /// Percentage of rows that are shadowed versions.
    pub fn dup_percent(&self) -> u32 {
        let header = self.file.index().header();
        let (mem_rows, mem_dups) = self
            .generations
            .read()
            .map(|g| (g.active.len() as u64, g.active.dups() as u64))
            .unwrap_or((0, 0));
        let rows = header.keys + header.dup_keys + mem_rows;
        if rows == 0 {
            return 0;
        }
        ((header.dup_keys + mem_dups) * 100 / rows) as u32
    }

    pub fn backup(&self) -> u64 {
        self.backup.load(Ordering::SeqCst)
    }

    pub fn set_backup(&self, bsn: u64) {
        self.backup.fetch_max(bsn, Ordering::SeqCst);
    }
}
