//! Node files: the immutable on-disk half of a tree node.
//!
//! ## Node File Layout
//!
//! ```text
//! +-------------------+
//! | Page 0            |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Page N-1          |
//! +-------------------+
//! | padding           |  ← up to NODE_ALIGN
//! +-------------------+
//! | Index             |
//! +-------------------+
//! | Index Offset (u64)|
//! | Magic (u32)       |
//! +-------------------+
//! ```
//!
//! A file is written once by [`NodeWriter`] and then only read through
//! [`NodeFile`], either from a read-only memory map or with positional reads
//! on the open handle. The handle stays valid across renames, so a node can
//! keep serving readers while compaction moves its file around.

use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use memmap2::Mmap;

use super::index::{Index, IndexBuilder};
use super::page::{BuiltPage, Page, PageIter};
use crate::error::{Error, Result};
use crate::store::compression::Compression;
use crate::store::iterator::Order;
use crate::store::value::Value;

pub const NODE_MAGIC: u32 = 0x5344_4e31;
pub const NODE_ALIGN: u64 = 64;
const FOOTER_SIZE: u64 = 12;

/// Writes pages sequentially, then the index and footer.
pub struct NodeWriter {
    file: File,
    offset: u64,
    index: IndexBuilder,
}

impl NodeWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            file,
            offset: 0,
            index: IndexBuilder::new(),
        })
    }

    pub fn add_page(&mut self, page: BuiltPage) -> Result<()> {
        self.file
            .write_all(&page.bytes)
            .map_err(|e| Error::WriteError("node page", e))?;
        self.index.add(self.offset, &page);
        self.offset += page.bytes.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Writes the index and footer and syncs the file. `lsn_max` is the
    /// highest lsn of every input folded into this file.
    pub fn finish(mut self, lsn_max: u64) -> Result<Index> {
        let pad = (NODE_ALIGN - self.offset % NODE_ALIGN) % NODE_ALIGN;
        if pad > 0 {
            self.file
                .write_all(&vec![0u8; pad as usize])
                .map_err(|e| Error::WriteError("node padding", e))?;
        }
        let index_offset = self.offset + pad;

        let mut index = self.index.finish(index_offset, lsn_max, NODE_ALIGN as u32);
        let mut tail = index.encode()?;
        tail.write_u64::<BigEndian>(index_offset)?;
        tail.write_u32::<BigEndian>(NODE_MAGIC)?;
        self.file
            .write_all(&tail)
            .map_err(|e| Error::WriteError("node index", e))?;
        self.file.sync_all()?;
        Ok(index)
    }
}

/// Read-only view of a finished node file.
pub struct NodeFile {
    file: File,
    map: Option<Mmap>,
    index: Index,
    compression: Compression,
    verify: bool,
    size: u64,
}

impl std::fmt::Debug for NodeFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeFile")
            .field("pages", &self.index.count())
            .field("size", &self.size)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

impl NodeFile {
    pub fn open(path: &Path, compression: Compression, mmap: bool, verify: bool) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE {
            return Err(Error::IndexCorruption(format!(
                "node file {} too short",
                path.display()
            )));
        }

        // Safety: node files are never modified after they are sealed and the
        // map is read-only.
        let map = if mmap {
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };

        let mut node = Self {
            file,
            map,
            index: Index::default(),
            compression,
            verify,
            size,
        };

        let footer = node.read_at(size - FOOTER_SIZE, FOOTER_SIZE as usize)?;
        let index_offset = BigEndian::read_u64(&footer[..8]);
        let magic = BigEndian::read_u32(&footer[8..12]);
        if magic != NODE_MAGIC {
            return Err(Error::InvalidHeader);
        }
        if index_offset > size - FOOTER_SIZE {
            return Err(Error::IndexCorruption("index offset past end".to_string()));
        }

        let raw = node.read_at(index_offset, (size - FOOTER_SIZE - index_offset) as usize)?;
        let index = Index::decode(&raw)?;
        if index.header().offset != index_offset {
            return Err(Error::IndexCorruption(format!(
                "index offset mismatch: {} != {}",
                index.header().offset,
                index_offset
            )));
        }
        node.index = index;
        Ok(node)
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        let end = offset as usize + len;
        match &self.map {
            Some(map) => {
                if end > map.len() {
                    return Err(Error::IndexCorruption("read past end of node".to_string()));
                }
                Ok(Cow::Borrowed(&map[offset as usize..end]))
            }
            None => {
                let mut buf = vec![0u8; len];
                self.file
                    .read_exact_at(&mut buf, offset)
                    .map_err(|e| Error::ReadError("node file", e))?;
                Ok(Cow::Owned(buf))
            }
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn read_page(&self, pos: usize) -> Result<Arc<Page>> {
        let entry = self
            .index
            .page(pos)
            .ok_or_else(|| Error::IndexCorruption(format!("no page {}", pos)))?;
        let raw = self.read_at(entry.offset, entry.disk_size())?;
        Ok(Arc::new(Page::decode(&raw, self.compression, self.verify)?))
    }

    /// Every version of `key` in this file, newest first.
    pub fn get(&self, key: &[u8]) -> Result<Vec<Arc<Value>>> {
        match self.index.route(key) {
            Some(pos) if self.index.pages()[pos].min_key.as_slice() <= key => {
                self.read_page(pos)?.chain(key)
            }
            _ => Ok(Vec::new()),
        }
    }

    pub fn iter(self: &Arc<Self>, order: Order, key: Option<&[u8]>) -> NodeFileIter {
        NodeFileIter::new(Arc::clone(self), order, key)
    }

    /// Copies the whole file through the open handle.
    pub fn copy_to(&self, path: &Path) -> Result<()> {
        let data = self.read_at(0, self.size as usize)?;
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        out.write_all(&data)
            .map_err(|e| Error::WriteError("node copy", e))?;
        out.sync_all()?;
        Ok(())
    }
}

/// Iterates a node file page by page, loading each page only when the
/// previous one is exhausted.
pub struct NodeFileIter {
    file: Arc<NodeFile>,
    order: Order,
    seek: Option<Vec<u8>>,
    next_page: Option<usize>,
    current: Option<PageIter>,
}

impl NodeFileIter {
    fn new(file: Arc<NodeFile>, order: Order, key: Option<&[u8]>) -> Self {
        let count = file.index.count();
        let next_page = match key {
            Some(key) => file.index.search(order, key),
            None if count == 0 => None,
            None if order.is_forward() => Some(0),
            None => Some(count - 1),
        };
        Self {
            file,
            order,
            seek: key.map(|k| k.to_vec()),
            next_page,
            current: None,
        }
    }

    fn load(&mut self, pos: usize) -> Result<()> {
        self.next_page = if self.order.is_forward() {
            (pos + 1 < self.file.index.count()).then_some(pos + 1)
        } else {
            pos.checked_sub(1)
        };
        let page = self.file.read_page(pos)?;
        let seek = self.seek.take();
        self.current = Some(page.iter(self.order, seek.as_deref())?);
        Ok(())
    }
}

impl Iterator for NodeFileIter {
    type Item = Result<Arc<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            let pos = self.next_page?;
            if let Err(e) = self.load(pos) {
                self.next_page = None;
                return Some(Err(e));
            }
        }
    }
}
