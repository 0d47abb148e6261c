use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! impl_db_serializable_for {
    ($($t:ty),*) => {
        $(
            impl DbSerializable for $t {
                fn serialize_into(&self, buffer: &mut [u8]) {
                    buffer[..size_of::<Self>()].copy_from_slice(&self.to_le_bytes());
                }

                fn deserialize(buffer: &[u8]) -> Result<(Self, &[u8]), DataTypeError> {
                    Self::read_fixed_and_convert::<$t, { size_of::<$t>() }>(buffer, <$t>::from_le_bytes)
                }
            }
        )*
    };
}

impl_db_serializable_for!(i32, i64);

/// A trait for fixed-size values that can be serialized to and deserialized from bytes
/// for database storage.
pub(crate) trait DbSerializable: Sized {
    /// Serializes the value at the beginning of the provided buffer.
    /// The buffer must have enough space to hold serialized value, otherwise function should panic.
    fn serialize_into(&self, buffer: &mut [u8]);

    /// Deserializes a value from the given byte slice.
    ///
    /// Returns a tuple containing the deserialized value and a slice
    /// of the remaining unconsumed bytes.
    fn deserialize(buffer: &[u8]) -> Result<(Self, &[u8]), DataTypeError>;

    /// Helper function to read a fixed number of bytes and convert them to a value.
    fn read_fixed_and_convert<T, const N: usize>(
        buffer: &[u8],
        convert: fn([u8; N]) -> T,
    ) -> Result<(T, &[u8]), DataTypeError> {
        let (head, rest) = buffer
            .split_first_chunk::<N>()
            .ok_or(DataTypeError::UnexpectedEnd {
                expected: N,
                actual: buffer.len(),
            })?;
        Ok((convert(*head), rest))
    }
}

#[derive(Error, Debug)]
pub enum DataTypeError {
    #[error("unknown data type: '{0}'")]
    UnknownType(String),
    #[error("'{value}' is not a valid {ty} value")]
    InvalidValue { ty: DataType, value: String },
    #[error("out of range value '{value}' for type {ty}")]
    OutOfRange { ty: DataType, value: String },
    #[error("expected to read {expected} bytes, but only {actual} were left in the buffer")]
    UnexpectedEnd { expected: usize, actual: usize },
}

/// Comparison and width of the encoded keys stored in an index.
///
/// The index never interprets key bytes itself, it only asks the codec of its column to order them.
pub trait KeyCodec {
    /// Width in bytes of every encoded key.
    fn key_width(&self) -> usize;

    /// Orders two encoded keys, both exactly [`KeyCodec::key_width`] bytes long.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Column types supported by tables. Values are stored as fixed-width little-endian integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    BigInt,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::BigInt => "bigint",
        }
    }

    /// Number of bytes a value of this type takes on disk.
    pub fn size(&self) -> usize {
        match self {
            DataType::Int => size_of::<i32>(),
            DataType::BigInt => size_of::<i64>(),
        }
    }

    /// Parses decimal text into the on-disk representation of this type.
    pub fn parse(&self, text: &str) -> Result<Vec<u8>, DataTypeError> {
        let trimmed = text.trim();
        let wide: i128 = trimmed.parse().map_err(|_| DataTypeError::InvalidValue {
            ty: *self,
            value: text.to_string(),
        })?;
        let mut bytes = vec![0u8; self.size()];
        let out_of_range = || DataTypeError::OutOfRange {
            ty: *self,
            value: text.to_string(),
        };
        match self {
            DataType::Int => i32::try_from(wide)
                .map_err(|_| out_of_range())?
                .serialize_into(&mut bytes),
            DataType::BigInt => i64::try_from(wide)
                .map_err(|_| out_of_range())?
                .serialize_into(&mut bytes),
        }
        Ok(bytes)
    }

    /// Decodes the on-disk representation into an integer wide enough for every type.
    pub fn decode(&self, bytes: &[u8]) -> Result<i64, DataTypeError> {
        match self {
            DataType::Int => <i32 as DbSerializable>::deserialize(bytes).map(|(v, _)| v as i64),
            DataType::BigInt => <i64 as DbSerializable>::deserialize(bytes).map(|(v, _)| v),
        }
    }
}

impl KeyCodec for DataType {
    fn key_width(&self) -> usize {
        self.size()
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        // Keys handed to the index were produced by `parse`, so decoding only fails on
        // corrupted input; such keys sort by raw bytes instead.
        match (self.decode(a), self.decode(b)) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.cmp(b),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lookup table from type names to [`DataType`]s.
///
/// Built once by the table layer and handed down by reference to whoever needs to resolve column types.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: BTreeMap<&'static str, DataType>,
}

impl TypeRegistry {
    /// Creates a registry holding every built-in type.
    pub fn new() -> Self {
        let types = [DataType::Int, DataType::BigInt]
            .into_iter()
            .map(|ty| (ty.name(), ty))
            .collect();
        Self { types }
    }

    pub fn get(&self, name: &str) -> Result<DataType, DataTypeError> {
        self.types
            .get(name.trim())
            .copied()
            .ok_or_else(|| DataTypeError::UnknownType(name.to_string()))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
