//! CRC32c checksums shared by pages, node indexes, the WAL and scheme files.
//!
//! Callers go through [`ChecksumFn`] so the implementation can be swapped,
//! e.g. for a hardware-accelerated one; [`crc32c`] is the software default.

use std::fmt;

use crc::{Crc, Digest, CRC_32_ISCSI};

pub static CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Pluggable one-shot checksum function.
pub type ChecksumFn = fn(&[u8]) -> u32;

pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// Incremental checksum used where several buffers are chained into one
/// digest (frame headers over payload CRCs, index headers over page records).
pub struct Hasher {
    digest: Digest<'static, u32>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher")
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC32C.digest(),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.digest.update(data);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.digest.update(&value.to_be_bytes());
        self
    }

    pub fn finish(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
