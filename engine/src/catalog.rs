//! Catalog module - manages table schemas.

use std::{
    collections::{BTreeSet, HashMap},
    fs, io,
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::b_tree::IndexOptions;
use crate::data_types::{DataType, DataTypeError, TypeRegistry};

/// Error for [`TableSchema`] related operations
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("table name '{0}' is longer than {max} bytes", max = TableSchema::MAX_TABLE_NAME_LEN)]
    TableNameTooLong(String),
    #[error("column name '{0}' is longer than {max} bytes", max = TableSchema::MAX_COLUMN_NAME_LEN)]
    ColumnNameTooLong(String),
    #[error("name must not be empty")]
    EmptyName,
    #[error("table must have at least one column")]
    NoColumns,
    /// More than one column with the same name
    #[error("column '{0}' was defined more than once")]
    DuplicatedColumn(String),
    /// Column with provided name does not exist in the table
    #[error("column '{0}' not found")]
    ColumnNotFound(String),
    #[error("unknown column type: {0}")]
    DataTypeError(#[from] DataTypeError),
    /// Underlying IO module returned error
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
    /// Schema file contains invalid json
    #[error("json error occurred: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// [`TableSchema`] describes the columns of a single table and which of them are indexed.
///
/// It maps to the schema file `<table>.frm`, stored as JSON. Rows are laid out as the columns' values one
/// after another in declaration order, so every row of a table has the same width.
#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    /// All table's columns sorted by their position in the row layout.
    columns: Vec<ColumnSchema>,
    /// Maps each column name to its position in `columns`.
    columns_by_name: HashMap<String, usize>,
    /// Names of indexed columns, kept in name order.
    indexed_columns: BTreeSet<String>,
    /// Degree every index of the table was created with.
    index_degree: usize,
}

impl TableSchema {
    pub const MAX_TABLE_NAME_LEN: usize = 16;
    pub const MAX_COLUMN_NAME_LEN: usize = 64;

    /// Creates new [`TableSchema`] from `(name, type)` pairs.
    /// Can fail if any name is too long or repeated, or if an indexed column is not one of `columns`.
    pub fn new(
        name: impl Into<String>,
        columns: &[(String, DataType)],
        indexed_columns: &[String],
    ) -> Result<Self, CatalogError> {
        let name = name.into();
        if name.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        if name.len() > Self::MAX_TABLE_NAME_LEN {
            return Err(CatalogError::TableNameTooLong(name));
        }
        if columns.is_empty() {
            return Err(CatalogError::NoColumns);
        }

        let mut table_columns = Vec::with_capacity(columns.len());
        let mut columns_by_name = HashMap::with_capacity(columns.len());
        let mut offset = 0;
        for (pos, (column_name, ty)) in columns.iter().enumerate() {
            if column_name.is_empty() {
                return Err(CatalogError::EmptyName);
            }
            if column_name.len() > Self::MAX_COLUMN_NAME_LEN {
                return Err(CatalogError::ColumnNameTooLong(column_name.clone()));
            }
            if columns_by_name.insert(column_name.clone(), pos).is_some() {
                return Err(CatalogError::DuplicatedColumn(column_name.clone()));
            }
            table_columns.push(ColumnSchema {
                name: column_name.clone(),
                ty: *ty,
                offset,
            });
            offset += ty.size();
        }

        let mut indexed = BTreeSet::new();
        for column_name in indexed_columns {
            if !columns_by_name.contains_key(column_name) {
                return Err(CatalogError::ColumnNotFound(column_name.clone()));
            }
            indexed.insert(column_name.clone());
        }

        Ok(TableSchema {
            name,
            columns: table_columns,
            columns_by_name,
            indexed_columns: indexed,
            index_degree: IndexOptions::DEFAULT_DEGREE,
        })
    }

    /// Sets the degree the table's indexes are built with.
    pub fn with_index_degree(mut self, degree: usize) -> Self {
        self.index_degree = degree;
        self
    }

    /// Reads the schema stored at `path`, resolving column types through `registry`.
    pub fn load(path: impl AsRef<Path>, registry: &TypeRegistry) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path)?;
        let schema_json: SchemaJson = serde_json::from_str(&content)?;
        let columns = schema_json
            .columns
            .into_iter()
            .map(|c| Ok((c.name, registry.get(&c.ty)?)))
            .collect::<Result<Vec<_>, CatalogError>>()?;
        Ok(
            Self::new(schema_json.name, &columns, &schema_json.indexed_columns)?
                .with_index_degree(schema_json.index_degree),
        )
    }

    /// Writes the schema to `path`, replacing whatever was there.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CatalogError> {
        let content = serde_json::to_string_pretty(&SchemaJson::from(self))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns all columns in row layout order.
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Returns position and schema of column `column_name`.
    /// Can fail if column with `column_name` does not exist.
    pub fn column(&self, column_name: &str) -> Result<(usize, &ColumnSchema), CatalogError> {
        self.columns_by_name
            .get(column_name)
            .map(|&idx| (idx, &self.columns[idx]))
            .ok_or(CatalogError::ColumnNotFound(column_name.into()))
    }

    /// Returns names of indexed columns in name order.
    pub fn indexed_columns(&self) -> impl Iterator<Item = &str> {
        self.indexed_columns.iter().map(String::as_str)
    }

    pub fn index_degree(&self) -> usize {
        self.index_degree
    }

    /// Width in bytes of every row.
    pub fn row_width(&self) -> usize {
        self.columns.iter().map(|c| c.ty.size()).sum()
    }
}

/// [`ColumnSchema`] stores the metadata for a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    name: String,
    ty: DataType,
    /// Offset of the column's value inside a row.
    offset: usize,
}

impl ColumnSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> DataType {
        self.ty
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// [`SchemaJson`] is a representation of [`TableSchema`] on disk. Used only for serializing to/deserializing
/// from JSON file.
#[derive(Serialize, Deserialize)]
struct SchemaJson {
    name: String,
    columns: Vec<ColumnJson>,
    indexed_columns: Vec<String>,
    /// Missing in schemas written before the degree was stored.
    #[serde(default = "default_index_degree")]
    index_degree: usize,
}

fn default_index_degree() -> usize {
    IndexOptions::DEFAULT_DEGREE
}

/// [`ColumnJson`] is a representation of [`ColumnSchema`] on disk. Types are stored by name, the offset is
/// derived from the column order.
#[derive(Serialize, Deserialize)]
struct ColumnJson {
    name: String,
    ty: String,
}

impl From<&TableSchema> for SchemaJson {
    fn from(value: &TableSchema) -> Self {
        SchemaJson {
            name: value.name.clone(),
            columns: value
                .columns
                .iter()
                .map(|c| ColumnJson {
                    name: c.name.clone(),
                    ty: c.ty.name().to_string(),
                })
                .collect(),
            indexed_columns: value.indexed_columns.iter().cloned().collect(),
            index_degree: value.index_degree,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn columns(defs: &[(&str, DataType)]) -> Vec<(String, DataType)> {
        defs.iter().map(|(n, t)| (n.to_string(), *t)).collect()
    }

    #[test]
    fn new_computes_offsets_and_width() {
        let schema = TableSchema::new(
            "people",
            &columns(&[("id", DataType::Int), ("balance", DataType::BigInt), ("age", DataType::Int)]),
            &["age".to_string(), "id".to_string()],
        )
        .unwrap();

        let offsets: Vec<_> = schema.columns().iter().map(|c| c.offset()).collect();
        assert_eq!(offsets, vec![0, 4, 12]);
        assert_eq!(schema.row_width(), 16);
        assert_eq!(schema.column("age").unwrap().0, 2);
        assert_eq!(schema.indexed_columns().collect::<Vec<_>>(), vec!["age", "id"]);
        assert_eq!(schema.index_degree(), IndexOptions::DEFAULT_DEGREE);
    }

    #[test]
    fn new_rejects_invalid_definitions() {
        let long_table = "t".repeat(TableSchema::MAX_TABLE_NAME_LEN + 1);
        let long_column = "c".repeat(TableSchema::MAX_COLUMN_NAME_LEN + 1);

        assert!(matches!(
            TableSchema::new(long_table, &columns(&[("id", DataType::Int)]), &[]),
            Err(CatalogError::TableNameTooLong(_))
        ));
        assert!(matches!(
            TableSchema::new("t", &[(long_column, DataType::Int)], &[]),
            Err(CatalogError::ColumnNameTooLong(_))
        ));
        assert!(matches!(
            TableSchema::new("t", &columns(&[("id", DataType::Int), ("id", DataType::BigInt)]), &[]),
            Err(CatalogError::DuplicatedColumn(name)) if name == "id"
        ));
        assert!(matches!(
            TableSchema::new("t", &columns(&[("id", DataType::Int)]), &["age".to_string()]),
            Err(CatalogError::ColumnNotFound(name)) if name == "age"
        ));
        assert!(matches!(
            TableSchema::new("t", &[], &[]),
            Err(CatalogError::NoColumns)
        ));
    }

    #[test]
    fn schema_survives_save_and_load() {
        // given a saved schema
        let dir = tempdir().unwrap();
        let path = dir.path().join("people.frm");
        let schema = TableSchema::new(
            "people",
            &columns(&[("id", DataType::Int), ("balance", DataType::BigInt)]),
            &["balance".to_string()],
        )
        .unwrap()
        .with_index_degree(8);
        schema.save(&path).unwrap();

        // when loading it back
        let loaded = TableSchema::load(&path, &TypeRegistry::new()).unwrap();

        // then columns, indexes and index degree are the same
        assert_eq!(loaded.name(), "people");
        assert_eq!(loaded.columns(), schema.columns());
        assert_eq!(loaded.indexed_columns().collect::<Vec<_>>(), vec!["balance"]);
        assert_eq!(loaded.index_degree(), 8);
    }

    #[test]
    fn load_defaults_missing_index_degree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.frm");
        fs::write(
            &path,
            r#"{"name":"t","columns":[{"name":"x","ty":"int"}],"indexed_columns":["x"]}"#,
        )
        .unwrap();

        let loaded = TableSchema::load(&path, &TypeRegistry::new()).unwrap();

        assert_eq!(loaded.index_degree(), IndexOptions::DEFAULT_DEGREE);
    }

    #[test]
    fn load_rejects_unknown_type() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.frm");
        fs::write(
            &path,
            r#"{"name":"t","columns":[{"name":"x","ty":"float"}],"indexed_columns":[]}"#,
        )
        .unwrap();

        let result = TableSchema::load(&path, &TypeRegistry::new());

        assert!(matches!(result, Err(CatalogError::DataTypeError(_))));
    }
}
