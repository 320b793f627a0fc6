//! Per-database scheme file.
//!
//! Records the options a database was created with, so a reopen can refuse
//! an incompatible schema and keep reading pages with the codec they were
//! written with.
//!
//! ```text
//! crc u32 | total_size u32 | option_count u32
//! { type u8 | id u8 | size u32 | value } * option_count
//! ```
//!
//! The crc covers everything after itself. The file is replaced atomically
//! through `scheme.incomplete`.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::checksum::crc32c;
use crate::config::DatabaseConfig;
use crate::encoding::{Field, FieldType, Schema};
use crate::error::Result;
use crate::store::sstable::index::{VERSION_MAJOR, VERSION_MINOR};
use crate::Error;

pub const SCHEME_FILE: &str = "scheme";
const HEADER_SIZE: usize = 12;

const TYPE_U32: u8 = 0;
const TYPE_U64: u8 = 1;
const TYPE_STRING: u8 = 2;

const OPT_VERSION: u8 = 0;
const OPT_ID: u8 = 1;
const OPT_NAME: u8 = 2;
const OPT_FIELD: u8 = 3;
const OPT_NODE_SIZE: u8 = 4;
const OPT_PAGE_SIZE: u8 = 5;
const OPT_COMPRESSION: u8 = 6;
const OPT_EXPIRE: u8 = 7;

const ROLE_KEY: u8 = 0;
const ROLE_VALUE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheme {
    pub dsn: u32,
    pub name: String,
    pub major: u16,
    pub minor: u16,
    pub schema: Schema,
    pub node_size: u64,
    pub page_size: u32,
    pub compression: String,
    /// Expiry in seconds, 0 when disabled.
    pub expire: u32,
}

impl Scheme {
    pub fn from_config(dsn: u32, name: &str, config: &DatabaseConfig) -> Self {
        Self {
            dsn,
            name: name.to_string(),
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            schema: config.schema.clone(),
            node_size: config.compaction.node_size,
            page_size: config.compaction.page_size,
            compression: config.compression.clone(),
            expire: config
                .expire
                .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
                .unwrap_or(0),
        }
    }

    pub fn expire(&self) -> Option<Duration> {
        (self.expire > 0).then(|| Duration::from_secs(self.expire as u64))
    }

    /// Fails unless `schema` lays out keys and values exactly as stored.
    pub fn check(&self, schema: &Schema) -> Result<()> {
        if self.schema != *schema {
            return Err(Error::SchemaMismatch(format!(
                "database '{}' was created with {}, configured with {}",
                self.name,
                describe(&self.schema),
                describe(schema)
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut count = 0u32;
        let mut put = |ty: u8, id: u8, value: &[u8]| -> Result<()> {
            body.write_u8(ty)?;
            body.write_u8(id)?;
            body.write_u32::<BigEndian>(value.len() as u32)?;
            body.extend_from_slice(value);
            count += 1;
            Ok(())
        };

        put(
            TYPE_U32,
            OPT_VERSION,
            &((self.major as u32) << 16 | self.minor as u32).to_be_bytes(),
        )?;
        put(TYPE_U32, OPT_ID, &self.dsn.to_be_bytes())?;
        put(TYPE_STRING, OPT_NAME, self.name.as_bytes())?;
        for (role, fields) in [(ROLE_KEY, &self.schema.key), (ROLE_VALUE, &self.schema.value)] {
            for field in fields {
                let ty = field.ty.name();
                let mut value = Vec::with_capacity(2 + ty.len() + field.name.len());
                value.push(role);
                value.push(ty.len() as u8);
                value.extend_from_slice(ty.as_bytes());
                value.extend_from_slice(field.name.as_bytes());
                put(TYPE_STRING, OPT_FIELD, &value)?;
            }
        }
        put(TYPE_U64, OPT_NODE_SIZE, &self.node_size.to_be_bytes())?;
        put(TYPE_U32, OPT_PAGE_SIZE, &self.page_size.to_be_bytes())?;
        put(TYPE_STRING, OPT_COMPRESSION, self.compression.as_bytes())?;
        put(TYPE_U32, OPT_EXPIRE, &self.expire.to_be_bytes())?;

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.write_u32::<BigEndian>(0)?;
        out.write_u32::<BigEndian>((HEADER_SIZE + body.len()) as u32)?;
        out.write_u32::<BigEndian>(count)?;
        out.extend_from_slice(&body);
        let crc = crc32c(&out[4..]);
        BigEndian::write_u32(&mut out[0..4], crc);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }
        let crc = BigEndian::read_u32(&data[0..4]);
        let total = BigEndian::read_u32(&data[4..8]) as usize;
        let count = BigEndian::read_u32(&data[8..12]);
        if total != data.len() {
            return Err(Error::InvalidData(format!(
                "scheme size {} does not match file size {}",
                total,
                data.len()
            )));
        }
        if crc32c(&data[4..]) != crc {
            return Err(Error::ChecksumMismatch);
        }

        let mut scheme = Scheme {
            dsn: 0,
            name: String::new(),
            major: 0,
            minor: 0,
            schema: Schema::new(),
            node_size: 0,
            page_size: 0,
            compression: String::new(),
            expire: 0,
        };
        let mut input = &data[HEADER_SIZE..];
        for _ in 0..count {
            let ty = input.read_u8().map_err(|e| Error::Decode("option type", e))?;
            let id = input.read_u8().map_err(|e| Error::Decode("option id", e))?;
            let size = input
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("option size", e))? as usize;
            if size > input.len() {
                return Err(Error::InvalidData(format!("scheme option {} overruns file", id)));
            }
            let (value, rest) = input.split_at(size);
            input = rest;
            scheme.apply(ty, id, value)?;
        }

        if scheme.major != VERSION_MAJOR {
            return Err(Error::UnsupportedVersion(scheme.major as u32));
        }
        Ok(scheme)
    }

    fn apply(&mut self, ty: u8, id: u8, value: &[u8]) -> Result<()> {
        let u32_value = || -> Result<u32> {
            match (ty, value.len()) {
                (TYPE_U32, 4) => Ok(BigEndian::read_u32(value)),
                _ => Err(Error::InvalidData(format!("scheme option {} is not a u32", id))),
            }
        };
        let string = || -> Result<String> {
            String::from_utf8(value.to_vec())
                .map_err(|_| Error::InvalidData(format!("scheme option {} is not utf-8", id)))
        };

        match id {
            OPT_VERSION => {
                let v = u32_value()?;
                self.major = (v >> 16) as u16;
                self.minor = v as u16;
            }
            OPT_ID => self.dsn = u32_value()?,
            OPT_NAME => self.name = string()?,
            OPT_FIELD => {
                if value.len() < 2 || value.len() < 2 + value[1] as usize {
                    return Err(Error::InvalidData("truncated scheme field".to_string()));
                }
                let ty_end = 2 + value[1] as usize;
                let ty_name = std::str::from_utf8(&value[2..ty_end])
                    .ok()
                    .and_then(FieldType::parse)
                    .ok_or_else(|| Error::InvalidData("unknown scheme field type".to_string()))?;
                let name = String::from_utf8(value[ty_end..].to_vec())
                    .map_err(|_| Error::InvalidData("scheme field name is not utf-8".to_string()))?;
                let field = Field::new(name, ty_name);
                match value[0] {
                    ROLE_KEY => self.schema.key.push(field),
                    _ => self.schema.value.push(field),
                }
            }
            OPT_NODE_SIZE => {
                if ty != TYPE_U64 || value.len() != 8 {
                    return Err(Error::InvalidData("scheme node size is not a u64".to_string()));
                }
                self.node_size = BigEndian::read_u64(value);
            }
            OPT_PAGE_SIZE => self.page_size = u32_value()?,
            OPT_COMPRESSION => self.compression = string()?,
            OPT_EXPIRE => self.expire = u32_value()?,
            // Options written by newer minor versions.
            _ => {}
        }
        Ok(())
    }

    /// Writes `<dir>/scheme`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!("{}.incomplete", SCHEME_FILE));
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&self.encode()?)
            .map_err(|e| Error::WriteError("scheme", e))?;
        file.sync_all()?;
        std::fs::rename(&tmp, dir.join(SCHEME_FILE))?;
        Ok(())
    }

    /// Reads `<dir>/scheme` if present.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        match std::fs::read(dir.join(SCHEME_FILE)) {
            Ok(data) => Ok(Some(Self::decode(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::ReadError("scheme", e)),
        }
    }
}

fn describe(schema: &Schema) -> String {
    let fields = |fields: &[Field]| {
        fields
            .iter()
            .map(|f| format!("{}:{}", f.name, f.ty))
            .collect::<Vec<_>>()
            .join(",")
    };
    format!("key({}) value({})", fields(&schema.key), fields(&schema.value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn scheme() -> Scheme {
        let config = DatabaseConfig::new(
            Schema::new()
                .key("id", FieldType::U32Rev)
                .key("name", FieldType::String)
                .value("payload", FieldType::Bytes),
        )
        .compression("zstd")
        .expire(Duration::from_secs(90));
        Scheme::from_config(3, "users", &config)
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let tmp = TempDir::new()?;
        assert!(Scheme::load(tmp.path())?.is_none());

        let original = scheme();
        original.save(tmp.path())?;
        let loaded = Scheme::load(tmp.path())?.unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.expire(), Some(Duration::from_secs(90)));
        assert!(!tmp.path().join("scheme.incomplete").exists());
        Ok(())
    }

    #[test]
    fn test_corrupted_scheme() -> Result<()> {
        let mut bytes = scheme().encode()?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(Scheme::decode(&bytes), Err(Error::ChecksumMismatch)));

        bytes.pop();
        assert!(matches!(Scheme::decode(&bytes), Err(Error::InvalidData(_))));
        assert!(matches!(Scheme::decode(&[0u8; 4]), Err(Error::InvalidHeader)));
        Ok(())
    }

    #[test]
    fn test_schema_check() {
        let stored = scheme();
        assert!(stored.check(&stored.schema.clone()).is_ok());

        let other = Schema::new().key("id", FieldType::U32);
        match stored.check(&other) {
            Err(Error::SchemaMismatch(msg)) => assert!(msg.contains("id:u32rev")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
