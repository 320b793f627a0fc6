//! One log file: header, then a stream of frames.
//!
//! ```text
//! +------------------+
//! | Header (12B)     |  magic u64, major u16, minor u16
//! +------------------+
//! | Frame            |  crc u32 | lsn u64 | dsn u32 | size u32 | flags u8
//! | Payload          |  ts u32 | key_len u32 | key | value
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! A commit of more than one row is preceded by a `BEGIN` frame whose size
//! field holds the row count. Each frame crc covers the previous frame's crc,
//! the rest of its own header and its payload, so a damaged frame also
//! breaks every frame after it.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use super::header::{Header, HEADER_SIZE};
use crate::checksum::Hasher;
use crate::error::Result;
use crate::store::value::{Value, STORED_FLAGS};
use crate::Error;

pub const FRAME_SIZE: usize = 21;
/// Frame opens a multi-row commit.
pub const BEGIN: u8 = 0x80;

/// File name for log file `lfsn`.
pub fn log_name(lfsn: u64) -> String {
    format!("{}.log", lfsn)
}

/// Parses `<lfsn>.log`.
pub fn parse_log_name(name: &str) -> Option<u64> {
    name.strip_suffix(".log")?.parse().ok()
}

fn frame_crc(prev: u32, header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.write_u32(prev).write(&header[4..FRAME_SIZE]).write(payload);
    hasher.finish()
}

/// One replayed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub dsn: u32,
    pub flags: u8,
    pub timestamp: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn to_value(&self, lsn: u64) -> Arc<Value> {
        Arc::new(Value::new(
            self.key.clone(),
            self.value.clone(),
            lsn,
            self.flags,
            self.timestamp,
        ))
    }
}

/// All rows of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub lsn: u64,
    pub records: Vec<Record>,
}

/// Position a log file can be truncated back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    pub lfsn: u64,
    offset: u64,
    crc: u32,
    records: u64,
    lsn_max: u64,
}

/// The log file currently receiving writes.
#[derive(Debug)]
pub struct Wal {
    lfsn: u64,
    path: PathBuf,
    file: File,
    offset: u64,
    crc: u32,
    records: u64,
    lsn_max: u64,
}

impl Wal {
    /// Creates `<dir>/<lfsn>.log` with a fresh header.
    pub fn create(dir: &Path, lfsn: u64) -> Result<Self> {
        let path = dir.join(log_name(lfsn));
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let bytes: Vec<u8> = Header::new().try_into()?;
        file.write_all(&bytes)
            .map_err(|e| Error::WriteError("log header", e))?;
        file.sync_all()?;

        Ok(Self {
            lfsn,
            path,
            file,
            offset: HEADER_SIZE as u64,
            crc: 0,
            records: 0,
            lsn_max: 0,
        })
    }

    pub fn lfsn(&self) -> u64 {
        self.lfsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written to this file.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn lsn_max(&self) -> u64 {
        self.lsn_max
    }

    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Appends one commit in a single write.
    pub fn write(&mut self, lsn: u64, rows: &[(u32, Arc<Value>)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        let mut crc = self.crc;
        if rows.len() > 1 {
            crc = encode_frame(&mut buf, crc, lsn, 0, rows.len() as u32, BEGIN, &[])?;
        }
        for (dsn, value) in rows {
            let mut payload = Vec::with_capacity(8 + value.key().len() + value.data().len());
            payload.write_u32::<BigEndian>(value.timestamp())?;
            payload.write_u32::<BigEndian>(value.key().len() as u32)?;
            payload.extend_from_slice(value.key());
            payload.extend_from_slice(value.data());
            crc = encode_frame(
                &mut buf,
                crc,
                lsn,
                *dsn,
                payload.len() as u32,
                value.flags() & STORED_FLAGS,
                &payload,
            )?;
        }

        self.file
            .write_all(&buf)
            .map_err(|e| Error::WriteError("log frames", e))?;
        self.offset += buf.len() as u64;
        self.crc = crc;
        self.records += rows.len() as u64;
        self.lsn_max = self.lsn_max.max(lsn);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            lfsn: self.lfsn,
            offset: self.offset,
            crc: self.crc,
            records: self.records,
            lsn_max: self.lsn_max,
        }
    }

    /// Truncates everything written after `sp`.
    pub fn rollback(&mut self, sp: Savepoint) -> Result<()> {
        if sp.lfsn != self.lfsn {
            return Err(Error::InvalidState(format!(
                "savepoint of log {} applied to log {}",
                sp.lfsn, self.lfsn
            )));
        }
        self.file.set_len(sp.offset)?;
        self.file.seek(SeekFrom::Start(sp.offset))?;
        self.offset = sp.offset;
        self.crc = sp.crc;
        self.records = sp.records;
        self.lsn_max = sp.lsn_max;
        Ok(())
    }
}

fn encode_frame(
    buf: &mut Vec<u8>,
    prev: u32,
    lsn: u64,
    dsn: u32,
    size: u32,
    flags: u8,
    payload: &[u8],
) -> Result<u32> {
    let mut header = [0u8; FRAME_SIZE];
    BigEndian::write_u64(&mut header[4..12], lsn);
    BigEndian::write_u32(&mut header[12..16], dsn);
    BigEndian::write_u32(&mut header[16..20], size);
    header[20] = flags;
    let crc = frame_crc(prev, &header, payload);
    BigEndian::write_u32(&mut header[0..4], crc);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Ok(crc)
}

/// Streams the complete commits of one log file.
///
/// A frame cut short by the end of the file, or a damaged final frame, is a
/// crash during the last write: iteration ends there and any commit it
/// belonged to is dropped. Damage followed by more data is corruption.
pub struct ReplayIterator {
    reader: BufReader<File>,
    path: PathBuf,
    len: u64,
    offset: u64,
    crc: u32,
    truncated: bool,
    done: bool,
}

struct Frame {
    lsn: u64,
    dsn: u32,
    size: u32,
    flags: u8,
    payload: Vec<u8>,
}

impl ReplayIterator {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut buf = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut buf)
            .map_err(|e| Error::ReadError("log header", e))?;
        Header::try_from(&buf[..])?.validate()?;

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            len,
            offset: HEADER_SIZE as u64,
            crc: 0,
            truncated: false,
            done: false,
        })
    }

    /// Whether replay stopped at a torn tail.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Offset just past the last complete commit.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn torn(&mut self, what: &str) -> Option<Frame> {
        tracing::warn!(
            path = %self.path.display(),
            offset = self.offset,
            "Log ends with a torn {}",
            what
        );
        self.truncated = true;
        None
    }

    /// Reads one frame. `Ok(None)` is a clean or torn end of file.
    fn read_frame(&mut self, at: u64) -> Result<Option<Frame>> {
        if at == self.len {
            return Ok(None);
        }
        if at + FRAME_SIZE as u64 > self.len {
            return Ok(self.torn("frame header"));
        }
        let mut header = [0u8; FRAME_SIZE];
        self.reader
            .read_exact(&mut header)
            .map_err(|e| Error::ReadError("log frame", e))?;
        let size = BigEndian::read_u32(&header[16..20]);
        let flags = header[20];
        let payload_len = if flags & BEGIN != 0 { 0 } else { size as u64 };
        let end = at + FRAME_SIZE as u64 + payload_len;
        if end > self.len {
            return Ok(self.torn("frame payload"));
        }
        let mut payload = vec![0u8; payload_len as usize];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| Error::ReadError("log payload", e))?;

        let crc = frame_crc(self.crc, &header, &payload);
        if crc != BigEndian::read_u32(&header[0..4]) {
            if end == self.len {
                return Ok(self.torn("frame"));
            }
            return Err(Error::CorruptedWal(format!(
                "checksum mismatch at offset {} of {}",
                at,
                self.path.display()
            )));
        }
        self.crc = crc;
        Ok(Some(Frame {
            lsn: BigEndian::read_u64(&header[4..12]),
            dsn: BigEndian::read_u32(&header[12..16]),
            size,
            flags,
            payload,
        }))
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut at = self.offset;
        let Some(frame) = self.read_frame(at)? else {
            return Ok(None);
        };
        at += (FRAME_SIZE + frame.payload.len()) as u64;

        let (lsn, expected) = if frame.flags & BEGIN != 0 {
            (frame.lsn, frame.size as usize)
        } else {
            let lsn = frame.lsn;
            self.offset = at;
            return Ok(Some(Batch {
                lsn,
                records: vec![decode_record(frame)?],
            }));
        };

        let mut records = Vec::with_capacity(expected);
        while records.len() < expected {
            let Some(frame) = self.read_frame(at)? else {
                if !self.truncated {
                    self.torn("commit");
                }
                return Ok(None);
            };
            at += (FRAME_SIZE + frame.payload.len()) as u64;
            if frame.flags & BEGIN != 0 || frame.lsn != lsn {
                return Err(Error::CorruptedWal(format!(
                    "commit {} interrupted at offset {} of {}",
                    lsn,
                    at,
                    self.path.display()
                )));
            }
            records.push(decode_record(frame)?);
        }
        self.offset = at;
        Ok(Some(Batch { lsn, records }))
    }
}

fn decode_record(frame: Frame) -> Result<Record> {
    let payload = frame.payload;
    if payload.len() < 8 {
        return Err(Error::CorruptedWal("log row shorter than its header".to_string()));
    }
    let timestamp = BigEndian::read_u32(&payload[0..4]);
    let key_len = BigEndian::read_u32(&payload[4..8]) as usize;
    if 8 + key_len > payload.len() {
        return Err(Error::CorruptedWal("log row key overruns payload".to_string()));
    }
    Ok(Record {
        dsn: frame.dsn,
        flags: frame.flags & STORED_FLAGS,
        timestamp,
        key: payload[8..8 + key_len].to_vec(),
        value: payload[8 + key_len..].to_vec(),
    })
}

impl Iterator for ReplayIterator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::value::{DELETE, UPSERT};
    use crate::tmpfs::TempDir;

    fn row(dsn: u32, key: &str, data: &str, flags: u8) -> (u32, Arc<Value>) {
        (
            dsn,
            Arc::new(Value::new(
                key.as_bytes().to_vec(),
                data.as_bytes().to_vec(),
                0,
                flags,
                7,
            )),
        )
    }

    fn replay(path: &Path) -> Result<Vec<Batch>> {
        ReplayIterator::open(path)?.collect()
    }

    #[test]
    fn test_write_and_replay() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut wal = Wal::create(tmp.path(), 1)?;
        wal.write(1, &[row(1, "a", "1", 0)])?;
        wal.write(2, &[row(1, "b", "2", 0), row(2, "c", "", DELETE)])?;
        wal.write(3, &[row(1, "a", "+", UPSERT)])?;
        wal.sync()?;
        assert_eq!(wal.records(), 4);
        assert_eq!(wal.lsn_max(), 3);

        let batches = replay(wal.path())?;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].lsn, 2);
        assert_eq!(batches[1].records.len(), 2);
        assert_eq!(
            batches[1].records[1],
            Record {
                dsn: 2,
                flags: DELETE,
                timestamp: 7,
                key: b"c".to_vec(),
                value: Vec::new(),
            }
        );
        assert_eq!(batches[2].records[0].flags, UPSERT);
        Ok(())
    }

    #[test]
    fn test_torn_tail_drops_partial_commit() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut wal = Wal::create(tmp.path(), 1)?;
        wal.write(1, &[row(1, "a", "1", 0)])?;
        let complete = wal.size();
        wal.write(2, &[row(1, "b", "2", 0), row(1, "c", "3", 0)])?;
        let full = wal.size();
        drop(wal);

        // Cut inside the second row of the two-row commit.
        let path = tmp.path().join(log_name(1));
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(full - 3)?;

        let mut iter = ReplayIterator::open(&path)?;
        let batches: Vec<Batch> = iter.by_ref().collect::<Result<_>>()?;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lsn, 1);
        assert!(iter.truncated());
        assert_eq!(iter.offset(), complete);
        Ok(())
    }

    #[test]
    fn test_damaged_last_frame_is_tail() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut wal = Wal::create(tmp.path(), 1)?;
        wal.write(1, &[row(1, "a", "1", 0)])?;
        wal.write(2, &[row(1, "b", "2", 0)])?;
        let len = wal.size();
        drop(wal);

        let path = tmp.path().join(log_name(1));
        let mut bytes = std::fs::read(&path)?;
        bytes[len as usize - 1] ^= 0xff;
        std::fs::write(&path, &bytes)?;

        let batches = replay(&path)?;
        assert_eq!(batches.len(), 1);
        Ok(())
    }

    #[test]
    fn test_mid_file_damage_is_corruption() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut wal = Wal::create(tmp.path(), 1)?;
        wal.write(1, &[row(1, "a", "1", 0)])?;
        wal.write(2, &[row(1, "b", "2", 0)])?;
        drop(wal);

        let path = tmp.path().join(log_name(1));
        let mut bytes = std::fs::read(&path)?;
        bytes[HEADER_SIZE + FRAME_SIZE + 2] ^= 0xff;
        std::fs::write(&path, &bytes)?;

        assert!(matches!(replay(&path), Err(Error::CorruptedWal(_))));
        Ok(())
    }

    #[test]
    fn test_rollback_to_savepoint() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut wal = Wal::create(tmp.path(), 3)?;
        wal.write(1, &[row(1, "a", "1", 0)])?;
        let sp = wal.savepoint();
        wal.write(2, &[row(1, "b", "2", 0), row(1, "c", "3", 0)])?;
        wal.rollback(sp)?;
        assert_eq!(wal.records(), 1);
        assert_eq!(wal.lsn_max(), 1);

        // The crc chain continues from the savepoint.
        wal.write(2, &[row(1, "d", "4", 0)])?;
        let batches = replay(wal.path())?;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].records[0].key, b"d".to_vec());
        Ok(())
    }

    #[test]
    fn test_bad_magic_rejected() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join(log_name(9));
        std::fs::write(&path, [0u8; HEADER_SIZE])?;
        assert!(matches!(
            ReplayIterator::open(&path),
            Err(Error::InvalidWalMagic)
        ));
        assert_eq!(parse_log_name("9.log"), Some(9));
        assert_eq!(parse_log_name("scheme"), None);
        Ok(())
    }
}
