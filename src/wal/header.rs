use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Storage format tag written at the start of every log file.
pub const LOG_MAGIC: u64 = 8529643324614668147;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 2;

// 8 + 2 + 2 bytes
pub const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: u64,
    pub major: u16,
    pub minor: u16,
}

impl Header {
    pub fn new() -> Self {
        Header {
            magic: LOG_MAGIC,
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
        }
    }

    /// Checks magic and major version.
    pub fn validate(&self) -> Result<()> {
        if self.magic != LOG_MAGIC {
            return Err(Error::InvalidWalMagic);
        }
        if self.major != VERSION_MAJOR {
            return Err(Error::UnsupportedVersion(self.major as u32));
        }
        Ok(())
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

// Header encoding
impl TryInto<Vec<u8>> for Header {
    type Error = Error;

    fn try_into(self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        let mut encoder = HeaderEncoder::new(&mut buf);
        encoder.encode(&self)?;
        Ok(buf)
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        let mut decoder = HeaderDecoder::new(bytes);
        decoder.decode()
    }
}

pub struct HeaderDecoder<R: Read> {
    reader: R,
}

impl<R: Read> HeaderDecoder<R> {
    pub fn new(reader: R) -> Self {
        HeaderDecoder { reader }
    }

    pub fn decode(&mut self) -> Result<Header> {
        let magic = self
            .reader
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("magic", e))?;

        let major = self
            .reader
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("major", e))?;

        let minor = self
            .reader
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("minor", e))?;

        Ok(Header {
            magic,
            major,
            minor,
        })
    }
}

pub struct HeaderEncoder<W: Write> {
    writer: W,
}

impl<W: Write> HeaderEncoder<W> {
    pub fn new(writer: W) -> Self {
        HeaderEncoder { writer }
    }

    pub fn encode(&mut self, header: &Header) -> Result<()> {
        self.writer
            .write_u64::<BigEndian>(header.magic)
            .map_err(|e| Error::Encode("magic", e))?;

        self.writer
            .write_u16::<BigEndian>(header.major)
            .map_err(|e| Error::Encode("major", e))?;

        self.writer
            .write_u16::<BigEndian>(header.minor)
            .map_err(|e| Error::Encode("minor", e))?;

        Ok(())
    }
}
