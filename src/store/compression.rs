//! Page compression filters.
//!
//! A filter is chosen per database by name and persisted in its scheme file,
//! so reopening always decodes pages with the filter they were written with.

use std::fmt;

use crate::error::{Error, Result};

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "" | "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::InvalidInput(format!(
                "unknown compression filter: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Compression::None)
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::block::compress(data)),
            Compression::Zstd => zstd::bulk::compress(data, ZSTD_LEVEL)
                .map_err(|e| Error::Compression(format!("zstd compress: {}", e))),
        }
    }

    /// `size_origin` is the uncompressed length recorded in the page header.
    pub fn decompress(&self, data: &[u8], size_origin: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compression::None => data.to_vec(),
            Compression::Lz4 => lz4_flex::block::decompress(data, size_origin)
                .map_err(|e| Error::Compression(format!("lz4 decompress: {}", e)))?,
            Compression::Zstd => zstd::bulk::decompress(data, size_origin)
                .map_err(|e| Error::Compression(format!("zstd decompress: {}", e)))?,
        };
        if out.len() != size_origin {
            return Err(Error::Compression(format!(
                "{} page decompressed to {} bytes, expected {}",
                self.name(),
                out.len(),
                size_origin
            )));
        }
        Ok(out)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_restore_input() {
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i % 17).to_be_bytes()).collect();
        for filter in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let packed = filter.compress(&data).unwrap();
            if !filter.is_none() {
                assert!(packed.len() < data.len(), "{} did not shrink", filter);
            }
            assert_eq!(filter.decompress(&packed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(Compression::parse("lz4").unwrap(), Compression::Lz4);
        assert_eq!(Compression::parse("none").unwrap(), Compression::None);
        assert!(Compression::parse("snappy").is_err());
    }

    #[test]
    fn test_size_mismatch_is_error() {
        let packed = Compression::Lz4.compress(b"hello hello hello").unwrap();
        assert!(Compression::Lz4.decompress(&packed, 3).is_err());
    }
}
