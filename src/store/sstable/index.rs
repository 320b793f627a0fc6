//! Node-level page directory.
//!
//! The index is written after the last page of a node file and loaded fully
//! into memory on open. It maps every page to its offset, sizes, key range
//! and lsn range, and carries node-wide totals used by the scheduler.
//!
//! ```text
//! +--------------------------+
//! | IndexHeader (100 bytes)  |
//! +--------------------------+
//! | PageEntry 0              |
//! | ...                      |
//! | PageEntry N-1            |
//! +--------------------------+
//! ```

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::page::BuiltPage;
use crate::checksum::Hasher;
use crate::error::{Error, Result};
use crate::store::iterator::Order;

pub const INDEX_HEADER_SIZE: usize = 100;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 2;

/// Zero padding that fills the header out to `INDEX_HEADER_SIZE`.
const RESERVED: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexHeader {
    pub crc: u32,
    pub major: u16,
    pub minor: u16,
    /// File offset of the index itself.
    pub offset: u64,
    /// Size of the page entry records.
    pub size: u32,
    /// Largest uncompressed page body.
    pub size_vmax: u32,
    pub count: u32,
    pub keys: u64,
    pub total: u64,
    pub total_origin: u64,
    pub ts_min: u32,
    pub lsn_min: u64,
    /// Highest lsn folded into this file, including rows compacted away.
    pub lsn_max: u64,
    pub dup_keys: u64,
    pub dup_lsn_min: u64,
    pub align: u32,
}

impl IndexHeader {
    fn encode_fields(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u16::<BigEndian>(self.major)?;
        out.write_u16::<BigEndian>(self.minor)?;
        out.write_u64::<BigEndian>(self.offset)?;
        out.write_u32::<BigEndian>(self.size)?;
        out.write_u32::<BigEndian>(self.size_vmax)?;
        out.write_u32::<BigEndian>(self.count)?;
        out.write_u64::<BigEndian>(self.keys)?;
        out.write_u64::<BigEndian>(self.total)?;
        out.write_u64::<BigEndian>(self.total_origin)?;
        out.write_u32::<BigEndian>(self.ts_min)?;
        out.write_u64::<BigEndian>(self.lsn_min)?;
        out.write_u64::<BigEndian>(self.lsn_max)?;
        out.write_u64::<BigEndian>(self.dup_keys)?;
        out.write_u64::<BigEndian>(self.dup_lsn_min)?;
        out.write_u32::<BigEndian>(self.align)?;
        out.extend_from_slice(&[0u8; RESERVED]);
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        Ok(Self {
            crc: cursor.read_u32::<BigEndian>()?,
            major: cursor.read_u16::<BigEndian>()?,
            minor: cursor.read_u16::<BigEndian>()?,
            offset: cursor.read_u64::<BigEndian>()?,
            size: cursor.read_u32::<BigEndian>()?,
            size_vmax: cursor.read_u32::<BigEndian>()?,
            count: cursor.read_u32::<BigEndian>()?,
            keys: cursor.read_u64::<BigEndian>()?,
            total: cursor.read_u64::<BigEndian>()?,
            total_origin: cursor.read_u64::<BigEndian>()?,
            ts_min: cursor.read_u32::<BigEndian>()?,
            lsn_min: cursor.read_u64::<BigEndian>()?,
            lsn_max: cursor.read_u64::<BigEndian>()?,
            dup_keys: cursor.read_u64::<BigEndian>()?,
            dup_lsn_min: cursor.read_u64::<BigEndian>()?,
            align: cursor.read_u32::<BigEndian>()?,
        })
    }
}

/// Directory entry for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEntry {
    pub offset: u64,
    pub size: u32,
    pub size_origin: u32,
    pub lsn_min: u64,
    pub lsn_max: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl PageEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u64::<BigEndian>(self.offset)?;
        out.write_u32::<BigEndian>(self.size)?;
        out.write_u32::<BigEndian>(self.size_origin)?;
        out.write_u64::<BigEndian>(self.lsn_min)?;
        out.write_u64::<BigEndian>(self.lsn_max)?;
        out.write_u16::<BigEndian>(self.min_key.len() as u16)?;
        out.extend_from_slice(&self.min_key);
        out.write_u16::<BigEndian>(self.max_key.len() as u16)?;
        out.extend_from_slice(&self.max_key);
        Ok(())
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let offset = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u32::<BigEndian>()?;
        let size_origin = cursor.read_u32::<BigEndian>()?;
        let lsn_min = cursor.read_u64::<BigEndian>()?;
        let lsn_max = cursor.read_u64::<BigEndian>()?;
        let min_key = read_key(cursor)?;
        let max_key = read_key(cursor)?;
        Ok(Self {
            offset,
            size,
            size_origin,
            lsn_min,
            lsn_max,
            min_key,
            max_key,
        })
    }

    /// Total bytes of the page on disk, header included.
    pub fn disk_size(&self) -> usize {
        super::page::PAGE_HEADER_SIZE + self.size as usize
    }
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let start = cursor.position() as usize;
    let data: &[u8] = *cursor.get_ref();
    if start + len > data.len() {
        return Err(Error::IndexCorruption("page key out of bounds".to_string()));
    }
    cursor.set_position((start + len) as u64);
    Ok(data[start..start + len].to_vec())
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    header: IndexHeader,
    pages: Vec<PageEntry>,
}

impl Index {
    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn pages(&self) -> &[PageEntry] {
        &self.pages
    }

    pub fn count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, pos: usize) -> Option<&PageEntry> {
        self.pages.get(pos)
    }

    /// Smallest key in the node, if it has any row.
    pub fn min_key(&self) -> Option<&[u8]> {
        self.pages
            .iter()
            .find(|p| p.size_origin > 0)
            .map(|p| p.min_key.as_slice())
    }

    pub fn max_key(&self) -> Option<&[u8]> {
        self.pages
            .iter()
            .rev()
            .find(|p| p.size_origin > 0)
            .map(|p| p.max_key.as_slice())
    }

    /// Page that would hold `key`: the first page whose max key is not below
    /// it. Pages never split a key, so this is the only candidate.
    pub fn route(&self, key: &[u8]) -> Option<usize> {
        let pos = self.pages.partition_point(|p| p.max_key.as_slice() < key);
        (pos < self.pages.len()).then_some(pos)
    }

    /// First page to visit for an iteration starting at `key` in `order`.
    ///
    /// Exact boundary keys move towards the neighbour for the strict orders:
    /// `Gt` on a page's max key starts at the next page, `Lt` on a page's min
    /// key starts at the previous one.
    pub fn search(&self, order: Order, key: &[u8]) -> Option<usize> {
        let count = self.pages.len();
        if count == 0 {
            return None;
        }
        match order {
            Order::Gte => self.route(key),
            Order::Gt => {
                let pos = self.pages.partition_point(|p| p.max_key.as_slice() <= key);
                (pos < count).then_some(pos)
            }
            Order::Lte => {
                let pos = self.pages.partition_point(|p| p.min_key.as_slice() <= key);
                pos.checked_sub(1)
            }
            Order::Lt => {
                let pos = self.pages.partition_point(|p| p.min_key.as_slice() < key);
                pos.checked_sub(1)
            }
        }
    }

    pub fn encode(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for page in &self.pages {
            page.encode(&mut body)?;
        }
        self.header.size = body.len() as u32;
        self.header.count = self.pages.len() as u32;

        let mut fields = Vec::with_capacity(INDEX_HEADER_SIZE - 4);
        self.header.encode_fields(&mut fields)?;
        let mut hasher = Hasher::new();
        hasher.write(&fields);
        hasher.write(&body);
        self.header.crc = hasher.finish();

        let mut out = Vec::with_capacity(INDEX_HEADER_SIZE + body.len());
        out.write_u32::<BigEndian>(self.header.crc)?;
        out.extend_from_slice(&fields);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_HEADER_SIZE {
            return Err(Error::IndexCorruption(format!(
                "index truncated: {} bytes",
                data.len()
            )));
        }
        let header = IndexHeader::decode(&data[..INDEX_HEADER_SIZE])?;
        if header.major != VERSION_MAJOR {
            return Err(Error::UnsupportedVersion(header.major as u32));
        }
        let end = INDEX_HEADER_SIZE + header.size as usize;
        if data.len() < end {
            return Err(Error::IndexCorruption("index body truncated".to_string()));
        }

        let mut hasher = Hasher::new();
        hasher.write(&data[4..end]);
        if hasher.finish() != header.crc {
            return Err(Error::ChecksumMismatch);
        }

        let body = &data[INDEX_HEADER_SIZE..end];
        let mut cursor = Cursor::new(body);
        let mut pages = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            pages.push(PageEntry::decode(&mut cursor)?);
        }
        Ok(Self { header, pages })
    }
}

/// Accumulates page entries and node totals while a node file is written.
#[derive(Debug)]
pub struct IndexBuilder {
    index: Index,
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self {
            index: Index {
                header: IndexHeader {
                    major: VERSION_MAJOR,
                    minor: VERSION_MINOR,
                    ts_min: u32::MAX,
                    lsn_min: u64::MAX,
                    dup_lsn_min: u64::MAX,
                    ..Default::default()
                },
                pages: Vec::new(),
            },
        }
    }

    pub fn add(&mut self, offset: u64, page: &BuiltPage) {
        let h = &mut self.index.header;
        let p = &page.header;
        h.size_vmax = h.size_vmax.max(p.size_origin);
        h.keys += (p.count - p.count_dup) as u64;
        h.total += p.size as u64;
        h.total_origin += p.size_origin as u64;
        if p.count > 0 {
            h.ts_min = h.ts_min.min(p.ts_min);
            h.lsn_min = h.lsn_min.min(p.lsn_min);
        }
        h.lsn_max = h.lsn_max.max(p.lsn_max);
        h.dup_keys += p.count_dup as u64;
        if p.count_dup > 0 {
            h.dup_lsn_min = h.dup_lsn_min.min(p.lsn_dup_min);
        }

        self.index.pages.push(PageEntry {
            offset,
            size: p.size,
            size_origin: p.size_origin,
            lsn_min: p.lsn_min,
            lsn_max: p.lsn_max,
            min_key: page.min_key.clone(),
            max_key: page.max_key.clone(),
        });
    }

    pub fn finish(mut self, offset: u64, lsn_max: u64, align: u32) -> Index {
        let h = &mut self.index.header;
        h.offset = offset;
        h.align = align;
        h.lsn_max = h.lsn_max.max(lsn_max);
        if h.ts_min == u32::MAX {
            h.ts_min = 0;
        }
        if h.lsn_min == u64::MAX {
            h.lsn_min = 0;
        }
        if h.dup_lsn_min == u64::MAX {
            h.dup_lsn_min = 0;
        }
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::compression::Compression;
    use crate::store::sstable::page::PageBuilder;
    use crate::store::value::Value;

    fn page(keys: &[(&str, u64)]) -> BuiltPage {
        let mut builder = PageBuilder::new(Compression::None);
        for (k, lsn) in keys {
            builder
                .add(&Value::new(k.as_bytes().to_vec(), b"v".to_vec(), *lsn, 0, 10))
                .unwrap();
        }
        builder.finish().unwrap()
    }

    fn sample() -> Index {
        let mut builder = IndexBuilder::new();
        let mut offset = 0;
        for built in [
            page(&[("b", 1), ("d", 2)]),
            page(&[("f", 3), ("f", 1), ("h", 4)]),
            page(&[("j", 5)]),
        ] {
            builder.add(offset, &built);
            offset += built.bytes.len() as u64;
        }
        builder.finish(offset, 9, 64)
    }

    #[test]
    fn test_index_encode_decode() {
        let mut index = sample();
        let bytes = index.encode().unwrap();
        let decoded = Index::decode(&bytes).unwrap();

        assert_eq!(bytes.len(), INDEX_HEADER_SIZE + index.header().size as usize);
        assert_eq!(decoded.header(), index.header());
        assert_eq!(decoded.pages(), index.pages());
        assert_eq!(decoded.header().keys, 5);
        assert_eq!(decoded.header().dup_keys, 1);
        assert_eq!(decoded.header().lsn_max, 9);
        assert_eq!(decoded.header().lsn_min, 1);
        assert_eq!(decoded.min_key(), Some(&b"b"[..]));
        assert_eq!(decoded.max_key(), Some(&b"j"[..]));
    }

    #[test]
    fn test_index_corruption_detected() {
        let mut index = sample();
        let mut bytes = index.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert!(matches!(Index::decode(&bytes), Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_search_boundaries() {
        let index = sample();
        assert_eq!(index.search(Order::Gte, b"a"), Some(0));
        assert_eq!(index.search(Order::Gte, b"d"), Some(0));
        assert_eq!(index.search(Order::Gt, b"d"), Some(1));
        assert_eq!(index.search(Order::Gte, b"e"), Some(1));
        assert_eq!(index.search(Order::Gt, b"j"), None);

        assert_eq!(index.search(Order::Lte, b"f"), Some(1));
        assert_eq!(index.search(Order::Lt, b"f"), Some(0));
        assert_eq!(index.search(Order::Lte, b"e"), Some(0));
        assert_eq!(index.search(Order::Lt, b"b"), None);
        assert_eq!(index.search(Order::Lte, b"z"), Some(2));
    }
}
