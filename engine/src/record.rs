use std::fmt;

use thiserror::Error;

use crate::catalog::ColumnSchema;
use crate::data_types::{DataType, DataTypeError, DbSerializable};

/// Error for record related operations
#[derive(Error, Debug)]
pub enum RecordError {
    #[error(
        "while reading field {field_name}: expected to read {expected} bytes, but only {actual} were left in the buffer"
    )]
    UnexpectedEnd {
        field_name: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid value for field {field_name}: {source}")]
    InvalidValue {
        field_name: String,
        source: DataTypeError,
    },
}

impl RecordError {
    /// Returns a mapped data type error that now includes the name of the field being (de)serialized.
    fn for_field(err: DataTypeError, field_name: &str) -> Self {
        match err {
            DataTypeError::UnexpectedEnd { expected, actual } => Self::UnexpectedEnd {
                field_name: field_name.to_string(),
                expected,
                actual,
            },
            source => Self::InvalidValue {
                field_name: field_name.to_string(),
                source,
            },
        }
    }
}

/// A row of a table: one field per column, in the table's column order.
///
/// On disk a record is the concatenation of its fields' fixed-width little-endian encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub fields: Vec<Field>,
}

impl Record {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Parses one textual value per column.
    pub fn parse<'a>(
        columns: &[ColumnSchema],
        values: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, RecordError> {
        let fields = columns
            .iter()
            .zip(values)
            .map(|(col, text)| {
                Field::parse(col.ty(), text).map_err(|err| RecordError::for_field(err, col.name()))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self::new(fields))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = vec![];
        for field in &self.fields {
            field.serialize(&mut bytes);
        }
        bytes
    }

    /// Deserializes bytes into a record, reading every column at its offset in the row.
    pub fn deserialize(columns: &[ColumnSchema], bytes: &[u8]) -> Result<Self, RecordError> {
        let fields = columns
            .iter()
            .map(|col| {
                let field_bytes = bytes.get(col.offset()..).unwrap_or_default();
                Field::deserialize(field_bytes, col.ty())
                    .map_err(|err| RecordError::for_field(err, col.name()))
            })
            .collect::<Result<_, RecordError>>()?;
        Ok(Self::new(fields))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

/// Typed value of a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Int(i32),
    BigInt(i64),
}

impl Field {
    pub fn parse(ty: DataType, text: &str) -> Result<Self, DataTypeError> {
        Self::deserialize(&ty.parse(text)?, ty)
    }

    pub fn ty(&self) -> DataType {
        match self {
            Field::Int(_) => DataType::Int,
            Field::BigInt(_) => DataType::BigInt,
        }
    }

    /// Encoded value, usable as an index key for the field's column.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![];
        self.serialize(&mut bytes);
        bytes
    }

    fn serialize(&self, buffer: &mut Vec<u8>) {
        let start = buffer.len();
        buffer.resize(start + self.ty().size(), 0);
        match self {
            Field::Int(v) => v.serialize_into(&mut buffer[start..]),
            Field::BigInt(v) => v.serialize_into(&mut buffer[start..]),
        }
    }

    /// Reads a field from the start of `buffer`; trailing bytes are ignored.
    fn deserialize(buffer: &[u8], ty: DataType) -> Result<Self, DataTypeError> {
        match ty {
            DataType::Int => <i32 as DbSerializable>::deserialize(buffer).map(|(v, _)| Field::Int(v)),
            DataType::BigInt => {
                <i64 as DbSerializable>::deserialize(buffer).map(|(v, _)| Field::BigInt(v))
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{v}"),
            Field::BigInt(v) => write!(f, "{v}"),
        }
    }
}
