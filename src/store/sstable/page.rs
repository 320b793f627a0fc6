//! Pages: the unit of node file I/O and compression.
//!
//! ```text
//! +----------------------+
//! | header (60 bytes)    |  never compressed
//! +----------------------+
//! | offset table (u32*n) |  \
//! +----------------------+   > body, optionally compressed as a whole
//! | rows                 |  /
//! +----------------------+
//! ```
//!
//! Row format:
//! ```text
//! +--------+--------+-------+------------+-------------+-----+-------+
//! |flags:u8|lsn:u64 |ts:u32 |key_len:u16 |value_len:u32| key | value |
//! +--------+--------+-------+------------+-------------+-----+-------+
//! ```
//!
//! Rows are sorted by key and, within a key, newest first. Every row but the
//! first of its key carries `DUP`, so a duplicate run can be walked in both
//! directions from any member without comparing keys.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::checksum::crc32c;
use crate::encoding::schema::KEY_SIZE_MAX;
use crate::error::{Error, Result};
use crate::store::compression::Compression;
use crate::store::iterator::Order;
use crate::store::value::{Value, DUP, STORED_FLAGS};

pub const PAGE_HEADER_SIZE: usize = 60;
const ROW_HEADER_SIZE: usize = 1 + 8 + 4 + 2 + 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageHeader {
    pub crc: u32,
    pub crc_data: u32,
    pub count: u32,
    pub count_dup: u32,
    pub size_origin: u32,
    pub size: u32,
    pub lsn_min: u64,
    pub lsn_max: u64,
    pub lsn_dup_min: u64,
    pub ts_min: u32,
}

impl PageHeader {
    fn encode_fields(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u32::<BigEndian>(self.crc_data)?;
        out.write_u32::<BigEndian>(self.count)?;
        out.write_u32::<BigEndian>(self.count_dup)?;
        out.write_u32::<BigEndian>(self.size_origin)?;
        out.write_u32::<BigEndian>(self.size)?;
        out.write_u64::<BigEndian>(self.lsn_min)?;
        out.write_u64::<BigEndian>(self.lsn_max)?;
        out.write_u64::<BigEndian>(self.lsn_dup_min)?;
        out.write_u32::<BigEndian>(self.ts_min)?;
        out.extend_from_slice(&[0u8; 8]);
        Ok(())
    }

    /// Serialises the header, computing its checksum over every field after
    /// the checksum itself.
    pub fn encode(&mut self) -> Result<Vec<u8>> {
        let mut fields = Vec::with_capacity(PAGE_HEADER_SIZE - 4);
        self.encode_fields(&mut fields)?;
        self.crc = crc32c(&fields);

        let mut out = Vec::with_capacity(PAGE_HEADER_SIZE);
        out.write_u32::<BigEndian>(self.crc)?;
        out.extend_from_slice(&fields);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(Error::IndexCorruption(format!(
                "page header truncated: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(&data[..PAGE_HEADER_SIZE]);
        let header = Self {
            crc: cursor.read_u32::<BigEndian>()?,
            crc_data: cursor.read_u32::<BigEndian>()?,
            count: cursor.read_u32::<BigEndian>()?,
            count_dup: cursor.read_u32::<BigEndian>()?,
            size_origin: cursor.read_u32::<BigEndian>()?,
            size: cursor.read_u32::<BigEndian>()?,
            lsn_min: cursor.read_u64::<BigEndian>()?,
            lsn_max: cursor.read_u64::<BigEndian>()?,
            lsn_dup_min: cursor.read_u64::<BigEndian>()?,
            ts_min: cursor.read_u32::<BigEndian>()?,
        };
        Ok(header)
    }

    fn verify(&self, raw: &[u8]) -> Result<()> {
        if crc32c(&raw[4..PAGE_HEADER_SIZE]) != self.crc {
            return Err(Error::ChecksumMismatch);
        }
        Ok(())
    }
}

/// A finished page ready to be appended to a node file.
#[derive(Debug)]
pub struct BuiltPage {
    pub header: PageHeader,
    pub bytes: Vec<u8>,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

/// Accumulates rows for one page. Rows must be added in page order.
#[derive(Debug)]
pub struct PageBuilder {
    compression: Compression,
    offsets: Vec<u32>,
    rows: Vec<u8>,
    count_dup: u32,
    lsn_min: u64,
    lsn_max: u64,
    lsn_dup_min: u64,
    ts_min: u32,
    min_key: Vec<u8>,
    last_key: Vec<u8>,
}

impl PageBuilder {
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            offsets: Vec::new(),
            rows: Vec::new(),
            count_dup: 0,
            lsn_min: u64::MAX,
            lsn_max: 0,
            lsn_dup_min: u64::MAX,
            ts_min: u32::MAX,
            min_key: Vec::new(),
            last_key: Vec::new(),
        }
    }

    /// Appends one row. Consecutive rows with the same key form a chain:
    /// every row after the first is stored with `DUP`.
    pub fn add(&mut self, value: &Value) -> Result<()> {
        let key = value.key();
        if key.len() > KEY_SIZE_MAX {
            return Err(Error::InvalidInput(format!(
                "key of {} bytes exceeds the row format",
                key.len()
            )));
        }
        let dup = !self.offsets.is_empty() && self.last_key == key;
        if !self.offsets.is_empty() && !dup && key < self.last_key.as_slice() {
            return Err(Error::InvalidState("page rows out of order".to_string()));
        }

        let flags = (value.flags() & STORED_FLAGS & !DUP) | if dup { DUP } else { 0 };
        self.offsets.push(self.rows.len() as u32);
        self.rows.write_u8(flags)?;
        self.rows.write_u64::<BigEndian>(value.lsn())?;
        self.rows.write_u32::<BigEndian>(value.timestamp())?;
        self.rows.write_u16::<BigEndian>(key.len() as u16)?;
        self.rows.write_u32::<BigEndian>(value.data().len() as u32)?;
        self.rows.extend_from_slice(key);
        self.rows.extend_from_slice(value.data());

        if self.offsets.len() == 1 {
            self.min_key = key.to_vec();
        }
        if dup {
            self.count_dup += 1;
            self.lsn_dup_min = self.lsn_dup_min.min(value.lsn());
        } else {
            self.last_key = key.to_vec();
        }
        self.lsn_min = self.lsn_min.min(value.lsn());
        self.lsn_max = self.lsn_max.max(value.lsn());
        self.ts_min = self.ts_min.min(value.timestamp());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    /// Uncompressed body size so far.
    pub fn size(&self) -> usize {
        self.offsets.len() * 4 + self.rows.len()
    }

    pub fn finish(self) -> Result<BuiltPage> {
        let mut body = Vec::with_capacity(self.size());
        for offset in &self.offsets {
            body.write_u32::<BigEndian>(*offset)?;
        }
        body.extend_from_slice(&self.rows);

        let crc_data = crc32c(&body);
        let stored = if self.offsets.is_empty() {
            Vec::new()
        } else {
            self.compression.compress(&body)?
        };
        let empty = self.offsets.is_empty();

        let mut header = PageHeader {
            crc: 0,
            crc_data,
            count: self.offsets.len() as u32,
            count_dup: self.count_dup,
            size_origin: body.len() as u32,
            size: stored.len() as u32,
            lsn_min: if empty { 0 } else { self.lsn_min },
            lsn_max: self.lsn_max,
            lsn_dup_min: if self.count_dup == 0 { 0 } else { self.lsn_dup_min },
            ts_min: if empty { 0 } else { self.ts_min },
        };
        let mut bytes = header.encode()?;
        bytes.extend_from_slice(&stored);

        Ok(BuiltPage {
            header,
            bytes,
            min_key: self.min_key,
            max_key: self.last_key,
        })
    }
}

/// One decoded row borrowed from a page body.
#[derive(Debug)]
pub struct Row<'a> {
    pub flags: u8,
    pub lsn: u64,
    pub timestamp: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl Row<'_> {
    pub fn is_dup(&self) -> bool {
        self.flags & DUP != 0
    }

    pub fn to_value(&self) -> Arc<Value> {
        Arc::new(Value::new(
            self.key.to_vec(),
            self.value.to_vec(),
            self.lsn,
            self.flags,
            self.timestamp,
        ))
    }
}

/// A decoded, decompressed page.
#[derive(Debug)]
pub struct Page {
    header: PageHeader,
    body: Vec<u8>,
}

impl Page {
    /// Decodes a page from its on-disk bytes. With `verify` set both
    /// checksums are checked.
    pub fn decode(raw: &[u8], compression: Compression, verify: bool) -> Result<Self> {
        let header = PageHeader::decode(raw)?;
        if verify {
            header.verify(raw)?;
        }
        let end = PAGE_HEADER_SIZE + header.size as usize;
        if raw.len() < end {
            return Err(Error::IndexCorruption(format!(
                "page body truncated: {} < {}",
                raw.len(),
                end
            )));
        }
        let body = match header.size_origin {
            0 => Vec::new(),
            size => compression.decompress(&raw[PAGE_HEADER_SIZE..end], size as usize)?,
        };
        if verify && crc32c(&body) != header.crc_data {
            return Err(Error::ChecksumMismatch);
        }
        if body.len() < header.count as usize * 4 {
            return Err(Error::IndexCorruption("page offset table truncated".to_string()));
        }
        Ok(Self { header, body })
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn count(&self) -> usize {
        self.header.count as usize
    }

    pub fn row(&self, pos: usize) -> Result<Row<'_>> {
        if pos >= self.count() {
            return Err(Error::IndexCorruption(format!(
                "row {} out of {}",
                pos,
                self.count()
            )));
        }
        let table = self.count() * 4;
        let at = pos * 4;
        let offset = (&self.body[at..at + 4]).read_u32::<BigEndian>()? as usize;
        let start = table + offset;
        if start + ROW_HEADER_SIZE > self.body.len() {
            return Err(Error::IndexCorruption("row header out of bounds".to_string()));
        }

        let mut cursor = Cursor::new(&self.body[start..start + ROW_HEADER_SIZE]);
        let flags = cursor.read_u8()?;
        let lsn = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_u32::<BigEndian>()?;
        let key_len = cursor.read_u16::<BigEndian>()? as usize;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;

        let key_start = start + ROW_HEADER_SIZE;
        let value_start = key_start + key_len;
        let end = value_start + value_len;
        if end > self.body.len() {
            return Err(Error::IndexCorruption("row data out of bounds".to_string()));
        }
        Ok(Row {
            flags,
            lsn,
            timestamp,
            key: &self.body[key_start..value_start],
            value: &self.body[value_start..end],
        })
    }

    fn key_at(&self, pos: usize) -> Result<&[u8]> {
        Ok(self.row(pos)?.key)
    }

    /// First position whose key does not satisfy `pred`; `pred` must be
    /// true for a prefix of the rows.
    fn partition_point<F>(&self, pred: F) -> Result<usize>
    where
        F: Fn(&[u8]) -> bool,
    {
        let (mut low, mut high) = (0, self.count());
        while low < high {
            let mid = low + (high - low) / 2;
            if pred(self.key_at(mid)?) {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    /// Walks back from any member of a duplicate run to its head.
    pub fn chain_head(&self, mut pos: usize) -> Result<usize> {
        while pos > 0 && self.row(pos)?.is_dup() {
            pos -= 1;
        }
        Ok(pos)
    }

    /// Position just past the duplicate run starting at `pos`.
    pub fn chain_next(&self, mut pos: usize) -> Result<usize> {
        pos += 1;
        while pos < self.count() && self.row(pos)?.is_dup() {
            pos += 1;
        }
        Ok(pos)
    }

    /// Head of the first run in iteration order matching `order` and `key`.
    pub fn search(&self, order: Order, key: &[u8]) -> Result<Option<usize>> {
        let pos = match order {
            Order::Gte => self.partition_point(|k| k < key)?,
            Order::Gt => self.partition_point(|k| k <= key)?,
            Order::Lte => match self.partition_point(|k| k <= key)? {
                0 => return Ok(None),
                n => self.chain_head(n - 1)?,
            },
            Order::Lt => match self.partition_point(|k| k < key)? {
                0 => return Ok(None),
                n => self.chain_head(n - 1)?,
            },
        };
        Ok((pos < self.count()).then_some(pos))
    }

    /// Every version of `key` stored in this page, newest first.
    pub fn chain(&self, key: &[u8]) -> Result<Vec<Arc<Value>>> {
        let mut out = Vec::new();
        let Some(head) = self.search(Order::Gte, key)? else {
            return Ok(out);
        };
        if self.key_at(head)? != key {
            return Ok(out);
        }
        let end = self.chain_next(head)?;
        for pos in head..end {
            out.push(self.row(pos)?.to_value());
        }
        Ok(out)
    }

    pub fn iter(self: &Arc<Self>, order: Order, key: Option<&[u8]>) -> Result<PageIter> {
        PageIter::new(Arc::clone(self), order, key)
    }
}

/// Iterates a page run by run in either direction; within a run the rows are
/// always yielded newest first.
#[derive(Debug)]
pub struct PageIter {
    page: Arc<Page>,
    forward: bool,
    pos: usize,
    end: usize,
    head: usize,
    done: bool,
}

impl PageIter {
    fn new(page: Arc<Page>, order: Order, key: Option<&[u8]>) -> Result<Self> {
        let forward = order.is_forward();
        let count = page.count();
        let start = match key {
            Some(key) => page.search(order, key)?,
            None if count == 0 => None,
            None if forward => Some(0),
            None => Some(page.chain_head(count - 1)?),
        };
        let mut iter = Self {
            page,
            forward,
            pos: 0,
            end: 0,
            head: 0,
            done: start.is_none(),
        };
        if let Some(head) = start {
            iter.head = head;
            iter.pos = head;
            iter.end = if forward { count } else { iter.page.chain_next(head)? };
        }
        Ok(iter)
    }

    fn step(&mut self) -> Result<Option<Arc<Value>>> {
        if self.done {
            return Ok(None);
        }
        if self.pos >= self.end {
            if self.forward || self.head == 0 {
                self.done = true;
                return Ok(None);
            }
            let last = self.head - 1;
            self.head = self.page.chain_head(last)?;
            self.pos = self.head;
            self.end = last + 1;
        }
        let value = self.page.row(self.pos)?.to_value();
        self.pos += 1;
        Ok(Some(value))
    }
}

impl Iterator for PageIter {
    type Item = Result<Arc<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
