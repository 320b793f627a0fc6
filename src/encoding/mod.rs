//! Typed fields and their byte encodings.
//!
//! Every key is stored as a *comparable key*: a byte string whose
//! lexicographic order equals the schema's field-by-field order. The rest of
//! the engine (memory index, pages, node routing) therefore only ever
//! compares plain byte slices. Values are stored with a compact,
//! non-order-preserving encoding.

pub mod keycode;
pub mod schema;

pub use schema::{Field, Schema};

use std::fmt;

/// Supported field types. The `*Rev` variants sort in descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    U8Rev,
    U16Rev,
    U32Rev,
    U64Rev,
    String,
    Bytes,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::U8 => "u8",
            FieldType::U16 => "u16",
            FieldType::U32 => "u32",
            FieldType::U64 => "u64",
            FieldType::U8Rev => "u8rev",
            FieldType::U16Rev => "u16rev",
            FieldType::U32Rev => "u32rev",
            FieldType::U64Rev => "u64rev",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name {
            "u8" => FieldType::U8,
            "u16" => FieldType::U16,
            "u32" => FieldType::U32,
            "u64" => FieldType::U64,
            "u8rev" => FieldType::U8Rev,
            "u16rev" => FieldType::U16Rev,
            "u32rev" => FieldType::U32Rev,
            "u64rev" => FieldType::U64Rev,
            "string" => FieldType::String,
            "bytes" => FieldType::Bytes,
            _ => return None,
        };
        Some(ty)
    }

    /// Width in bytes of fixed-size types, `None` for variable-size ones.
    pub fn width(&self) -> Option<usize> {
        match self {
            FieldType::U8 | FieldType::U8Rev => Some(1),
            FieldType::U16 | FieldType::U16Rev => Some(2),
            FieldType::U32 | FieldType::U32Rev => Some(4),
            FieldType::U64 | FieldType::U64Rev => Some(8),
            FieldType::String | FieldType::Bytes => None,
        }
    }

    pub fn is_reverse(&self) -> bool {
        matches!(
            self,
            FieldType::U8Rev | FieldType::U16Rev | FieldType::U32Rev | FieldType::U64Rev
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Datum {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    String(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Bytes(b) => Some(b),
            Datum::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Datum::U8(v) => Some(*v as u64),
            Datum::U16(v) => Some(*v as u64),
            Datum::U32(v) => Some(*v as u64),
            Datum::U64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<u8> for Datum {
    fn from(v: u8) -> Self {
        Datum::U8(v)
    }
}

impl From<u16> for Datum {
    fn from(v: u16) -> Self {
        Datum::U16(v)
    }
}

impl From<u32> for Datum {
    fn from(v: u32) -> Self {
        Datum::U32(v)
    }
}

impl From<u64> for Datum {
    fn from(v: u64) -> Self {
        Datum::U64(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::String(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::String(v)
    }
}

impl From<&[u8]> for Datum {
    fn from(v: &[u8]) -> Self {
        Datum::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Datum {
    fn from(v: Vec<u8>) -> Self {
        Datum::Bytes(v)
    }
}

/// Error type for encoding operations
#[derive(Debug)]
pub enum EncodingError {
    InvalidFormat(String),
    TypeMismatch {
        field: String,
        expected: FieldType,
    },
    Arity {
        expected: usize,
        actual: usize,
    },
    TruncatedData,
    InvalidUtf8,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid encoding format: {}", msg),
            EncodingError::TypeMismatch { field, expected } => {
                write!(f, "Field '{}' expects a {} value", field, expected)
            }
            EncodingError::Arity { expected, actual } => {
                write!(f, "Expected {} fields, got {}", expected, actual)
            }
            EncodingError::TruncatedData => write!(f, "Truncated data"),
            EncodingError::InvalidUtf8 => write!(f, "Invalid UTF-8 sequence"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::InvalidInput(err.to_string())
    }
}
