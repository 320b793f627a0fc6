use std::collections::HashSet;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{keycode, Datum, EncodingError, FieldType};
use crate::error::Result;
use crate::Error;

/// Largest encoded key a row can carry.
pub const KEY_SIZE_MAX: usize = u16::MAX as usize;

/// A named, typed column of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Key and value layout of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub key: Vec<Field>,
    pub value: Vec<Field>,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            key: vec![Field::new("key", FieldType::String)],
            value: vec![Field::new("value", FieldType::String)],
        }
    }
}

impl Schema {
    /// An empty schema; add fields with [`Schema::key`] and [`Schema::value`].
    pub fn new() -> Self {
        Self {
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Append a key field
    pub fn key(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.key.push(Field::new(name, ty));
        self
    }

    /// Append a value field
    pub fn value(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.value.push(Field::new(name, ty));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::InvalidInput(
                "schema needs at least one key field".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for field in self.key.iter().chain(self.value.iter()) {
            if !names.insert(field.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Encodes key fields into a comparable key.
    pub fn encode_key(&self, key: &[Datum]) -> Result<Vec<u8>> {
        check_arity(self.key.len(), key.len())?;
        let mut out = Vec::new();
        for (field, datum) in self.key.iter().zip(key) {
            keycode::encode_field(&mut out, &field.name, field.ty, datum)?;
        }
        if out.len() > KEY_SIZE_MAX {
            return Err(Error::InvalidInput(format!(
                "key of {} bytes exceeds the {} byte limit",
                out.len(),
                KEY_SIZE_MAX
            )));
        }
        Ok(out)
    }

    pub fn decode_key(&self, bytes: &[u8]) -> Result<Vec<Datum>> {
        let mut input = bytes;
        let mut key = Vec::with_capacity(self.key.len());
        for field in &self.key {
            key.push(keycode::decode_field(&mut input, field.ty)?);
        }
        if !input.is_empty() {
            return Err(EncodingError::InvalidFormat("trailing key bytes".to_string()).into());
        }
        Ok(key)
    }

    pub fn encode_value(&self, value: &[Datum]) -> Result<Vec<u8>> {
        check_arity(self.value.len(), value.len())?;
        let mut out = Vec::new();
        for (field, datum) in self.value.iter().zip(value) {
            encode_value_field(&mut out, field, datum)?;
        }
        Ok(out)
    }

    pub fn decode_value(&self, bytes: &[u8]) -> Result<Vec<Datum>> {
        let mut input = bytes;
        let mut value = Vec::with_capacity(self.value.len());
        for field in &self.value {
            value.push(decode_value_field(&mut input, field.ty)?);
        }
        Ok(value)
    }
}

fn check_arity(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(EncodingError::Arity { expected, actual }.into());
    }
    Ok(())
}

fn encode_value_field(out: &mut Vec<u8>, field: &Field, datum: &Datum) -> Result<()> {
    let mismatch = || -> Error {
        EncodingError::TypeMismatch {
            field: field.name.clone(),
            expected: field.ty,
        }
        .into()
    };
    let io = |e| Error::Encode("value field", e);
    match (field.ty.width(), datum) {
        (None, Datum::String(_)) | (None, Datum::Bytes(_)) => {
            let bytes = datum.as_bytes().ok_or_else(mismatch)?;
            if field.ty == FieldType::String && matches!(datum, Datum::Bytes(_)) {
                return Err(mismatch());
            }
            out.write_u32::<BigEndian>(bytes.len() as u32).map_err(io)?;
            out.extend_from_slice(bytes);
        }
        (Some(width), datum) => {
            let value = datum.as_u64().ok_or_else(mismatch)?;
            if width < 8 && value >> (width * 8) != 0 {
                return Err(mismatch());
            }
            keycode::encode_uint(out, value, width, false);
        }
        (None, _) => return Err(mismatch()),
    }
    Ok(())
}

fn decode_value_field(input: &mut &[u8], ty: FieldType) -> Result<Datum> {
    let truncated = |e| Error::Decode("value field", e);
    let datum = match ty.width() {
        Some(width) => {
            let v = keycode::decode_uint(input, width, false)?;
            match width {
                1 => Datum::U8(v as u8),
                2 => Datum::U16(v as u16),
                4 => Datum::U32(v as u32),
                _ => Datum::U64(v),
            }
        }
        None => {
            let len = input.read_u32::<BigEndian>().map_err(truncated)? as usize;
            if input.len() < len {
                return Err(EncodingError::TruncatedData.into());
            }
            let bytes = input[..len].to_vec();
            *input = &input[len..];
            if ty == FieldType::String {
                Datum::String(String::from_utf8(bytes).map_err(|_| EncodingError::InvalidUtf8)?)
            } else {
                Datum::Bytes(bytes)
            }
        }
    };
    Ok(datum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema() {
        let schema = Schema::default();
        assert!(schema.validate().is_ok());
        let key = schema.encode_key(&["k1".into()]).unwrap();
        assert_eq!(schema.decode_key(&key).unwrap(), vec![Datum::from("k1")]);
        let value = schema.encode_value(&["v1".into()]).unwrap();
        assert_eq!(schema.decode_value(&value).unwrap(), vec![Datum::from("v1")]);
    }

    #[test]
    fn test_multi_field_key_ordering() {
        let schema = Schema::new()
            .key("a", FieldType::String)
            .key("b", FieldType::U32)
            .value("v", FieldType::Bytes);

        let k1 = schema.encode_key(&["b".into(), 9u32.into()]).unwrap();
        let k2 = schema.encode_key(&["bb".into(), 0u32.into()]).unwrap();
        let k3 = schema.encode_key(&["bb".into(), 1u32.into()]).unwrap();
        assert!(k1 < k2);
        assert!(k2 < k3);

        assert_eq!(
            schema.decode_key(&k3).unwrap(),
            vec![Datum::from("bb"), Datum::U32(1)]
        );
    }

    #[test]
    fn test_value_fields() {
        let schema = Schema::new()
            .key("id", FieldType::U64)
            .value("name", FieldType::String)
            .value("age", FieldType::U8)
            .value("blob", FieldType::Bytes);

        let value = vec![Datum::from("ada"), Datum::U8(36), Datum::Bytes(vec![0, 1, 2])];
        let encoded = schema.encode_value(&value).unwrap();
        assert_eq!(schema.decode_value(&encoded).unwrap(), value);
    }

    #[test]
    fn test_arity_and_type_errors() {
        let schema = Schema::default();
        assert!(schema.encode_key(&[]).is_err());
        assert!(schema.encode_key(&[Datum::U32(1)]).is_err());
        assert!(schema.encode_value(&["a".into(), "b".into()]).is_err());
    }

    #[test]
    fn test_key_size_limit() {
        let schema = Schema::default();
        // Two terminator bytes follow a string field.
        let fits = "x".repeat(KEY_SIZE_MAX - 2);
        assert_eq!(schema.encode_key(&[fits.as_str().into()]).unwrap().len(), KEY_SIZE_MAX);
        let long = "x".repeat(KEY_SIZE_MAX - 1);
        assert!(matches!(
            schema.encode_key(&[long.as_str().into()]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_schemas() {
        assert!(Schema::new().validate().is_err());
        let dup = Schema::new()
            .key("a", FieldType::U32)
            .value("a", FieldType::U32);
        assert!(dup.validate().is_err());
    }
}
