//! Order-preserving encoding of key fields.
//!
//! Integers are written big-endian at their natural width, so byte order
//! equals numeric order; the reverse variants invert every bit. Strings and
//! byte strings escape `0x00` as `0x00 0xff` and end with `0x00 0x00`, which
//! keeps a shorter string ahead of any string it prefixes and lets several
//! fields be concatenated without ambiguity.

use super::{Datum, EncodingError, FieldType};
use crate::error::Result;

const ESCAPE: u8 = 0xff;
const TERMINATOR: [u8; 2] = [0x00, 0x00];

/// Appends an unsigned integer of `width` bytes.
pub fn encode_uint(out: &mut Vec<u8>, value: u64, width: usize, reverse: bool) {
    let bytes = value.to_be_bytes();
    for &b in &bytes[8 - width..] {
        out.push(if reverse { !b } else { b });
    }
}

/// Reads an unsigned integer of `width` bytes, advancing `input`.
pub fn decode_uint(input: &mut &[u8], width: usize, reverse: bool) -> Result<u64> {
    if input.len() < width {
        return Err(EncodingError::TruncatedData.into());
    }
    let mut value = 0u64;
    for &b in &input[..width] {
        let b = if reverse { !b } else { b };
        value = (value << 8) | b as u64;
    }
    *input = &input[width..];
    Ok(value)
}

/// Appends an escaped, terminated byte string.
pub fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        if byte == 0x00 {
            out.extend_from_slice(&[0x00, ESCAPE]);
        } else {
            out.push(byte);
        }
    }
    out.extend_from_slice(&TERMINATOR);
}

/// Reads an escaped byte string up to and including its terminator.
pub fn decode_bytes(input: &mut &[u8]) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    let mut i = 0;
    loop {
        match input.get(i) {
            None => return Err(EncodingError::TruncatedData.into()),
            Some(0x00) => match input.get(i + 1) {
                Some(&ESCAPE) => {
                    result.push(0x00);
                    i += 2;
                }
                Some(0x00) => {
                    *input = &input[i + 2..];
                    return Ok(result);
                }
                Some(_) => {
                    return Err(EncodingError::InvalidFormat(
                        "Invalid null byte escape".to_string(),
                    )
                    .into())
                }
                None => return Err(EncodingError::TruncatedData.into()),
            },
            Some(&b) => {
                result.push(b);
                i += 1;
            }
        }
    }
}

/// Encodes one key field according to its declared type.
pub fn encode_field(out: &mut Vec<u8>, name: &str, ty: FieldType, datum: &Datum) -> Result<()> {
    match (ty, datum) {
        (FieldType::String, Datum::String(s)) => encode_bytes(out, s.as_bytes()),
        (FieldType::Bytes, Datum::Bytes(b)) => encode_bytes(out, b),
        (FieldType::Bytes, Datum::String(s)) => encode_bytes(out, s.as_bytes()),
        (ty, datum) => {
            let (Some(width), Some(value)) = (ty.width(), datum.as_u64()) else {
                return Err(mismatch(name, ty));
            };
            if width < 8 && value >> (width * 8) != 0 {
                return Err(mismatch(name, ty));
            }
            encode_uint(out, value, width, ty.is_reverse());
        }
    }
    Ok(())
}

/// Decodes one key field, advancing `input`.
pub fn decode_field(input: &mut &[u8], ty: FieldType) -> Result<Datum> {
    let datum = match ty {
        FieldType::String => {
            let bytes = decode_bytes(input)?;
            Datum::String(String::from_utf8(bytes).map_err(|_| EncodingError::InvalidUtf8)?)
        }
        FieldType::Bytes => Datum::Bytes(decode_bytes(input)?),
        FieldType::U8 | FieldType::U8Rev => {
            Datum::U8(decode_uint(input, 1, ty.is_reverse())? as u8)
        }
        FieldType::U16 | FieldType::U16Rev => {
            Datum::U16(decode_uint(input, 2, ty.is_reverse())? as u16)
        }
        FieldType::U32 | FieldType::U32Rev => {
            Datum::U32(decode_uint(input, 4, ty.is_reverse())? as u32)
        }
        FieldType::U64 | FieldType::U64Rev => Datum::U64(decode_uint(input, 8, ty.is_reverse())?),
    };
    Ok(datum)
}

fn mismatch(name: &str, ty: FieldType) -> crate::Error {
    EncodingError::TypeMismatch {
        field: name.to_string(),
        expected: ty,
    }
    .into()
}
