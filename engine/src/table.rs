//! Table module - rows stored in a data file with one B+Tree index per indexed column.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::b_tree::{BTree, BTreeError, IndexOptions};
use crate::b_tree_node::RecordPtr;
use crate::block_file::{BlockFile, BlockFileError};
use crate::catalog::{CatalogError, TableSchema};
use crate::data_types::{DataType, DataTypeError, TypeRegistry};
use crate::files_manager::{FileType, FilesManager};
use crate::record::{Field, Record, RecordError};

/// Error for [`Table`] related operations
#[derive(Error, Debug)]
pub enum TableError {
    #[error("table '{0}' already exists")]
    TableAlreadyExists(String),
    #[error("table '{0}' not found")]
    TableNotFound(String),
    #[error("no value given for column '{0}'")]
    MissingValue(String),
    #[error("column '{0}' is not indexed")]
    NotIndexed(String),
    #[error("table is corrupted: {0}")]
    Corrupted(String),
    #[error("catalog error: {0}")]
    CatalogError(#[from] CatalogError),
    #[error("index error: {0}")]
    IndexError(#[from] BTreeError),
    #[error("data file error: {0}")]
    DataFileError(#[from] BlockFileError),
    #[error("record error: {0}")]
    RecordError(#[from] RecordError),
    #[error("invalid value: {0}")]
    DataTypeError(#[from] DataTypeError),
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
}

/// Tunables shared by every index of a table.
///
/// The degree only applies when creating a table. It is stored in the schema and an opened table uses the
/// stored one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub index: IndexOptions,
}

/// An open table.
///
/// Every row occupies one block of the data file, so a row's block offset doubles as the record locator
/// stored in the indexes.
pub struct Table {
    schema: TableSchema,
    data: BlockFile,
    /// Indexes by column name, iterated in name order.
    indexes: BTreeMap<String, BTree<DataType>>,
}

impl Table {
    /// Creates table `name` in `dir` with `columns` given as `(name, type name)` pairs and an index on
    /// each of `indexed_columns`.
    pub fn create(
        dir: impl Into<PathBuf>,
        name: &str,
        columns: &[(&str, &str)],
        indexed_columns: &[&str],
        registry: &TypeRegistry,
        options: TableOptions,
    ) -> Result<Self, TableError> {
        let columns = columns
            .iter()
            .map(|(column, ty)| Ok((column.to_string(), registry.get(ty)?)))
            .collect::<Result<Vec<_>, TableError>>()?;
        let indexed: Vec<String> = indexed_columns.iter().map(|c| c.to_string()).collect();
        let schema =
            TableSchema::new(name, &columns, &indexed)?.with_index_degree(options.index.degree);

        let files = FilesManager::new(dir, name);
        if files.table_exists() {
            return Err(TableError::TableAlreadyExists(name.into()));
        }
        fs::create_dir_all(files.base_path())?;

        let (data, indexes) = match Self::create_files(&files, &schema, options.index) {
            Ok(created) => created,
            Err(e) => {
                Self::remove_files(&files, &schema);
                return Err(e);
            }
        };

        log::info!("created table {name} with {} indexes", indexes.len());
        Ok(Table {
            schema,
            data,
            indexes,
        })
    }

    fn create_files(
        files: &FilesManager,
        schema: &TableSchema,
        options: IndexOptions,
    ) -> Result<(BlockFile, BTreeMap<String, BTree<DataType>>), TableError> {
        let row_width = u32::try_from(schema.row_width()).map_err(|_| {
            TableError::Corrupted(format!("row of table '{}' is too wide", schema.name()))
        })?;
        let data = BlockFile::create(files.path(&FileType::Data), row_width)?;
        let mut indexes = BTreeMap::new();
        for column in schema.indexed_columns() {
            let (_, col) = schema.column(column)?;
            let path = files.path(&FileType::Index(column.to_string()));
            indexes.insert(column.to_string(), BTree::create(path, col.ty(), options)?);
        }
        // Written last, a table only counts as existing once all of its files do.
        schema.save(files.path(&FileType::Schema))?;
        Ok((data, indexes))
    }

    /// Removes whatever files a failed create left behind.
    fn remove_files(files: &FilesManager, schema: &TableSchema) {
        let paths = [FileType::Data, FileType::Schema]
            .into_iter()
            .chain(
                schema
                    .indexed_columns()
                    .map(|column| FileType::Index(column.to_string())),
            )
            .map(|file_type| files.path(&file_type));
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("failed to remove {}: {e}", path.display()),
            }
        }
    }

    /// Opens an existing table `name` in `dir`. Indexes are opened with the degree stored in the schema.
    pub fn open(
        dir: impl Into<PathBuf>,
        name: &str,
        registry: &TypeRegistry,
        options: TableOptions,
    ) -> Result<Self, TableError> {
        let files = FilesManager::new(dir, name);
        if !files.table_exists() {
            return Err(TableError::TableNotFound(name.into()));
        }
        let schema = TableSchema::load(files.path(&FileType::Schema), registry)?;
        let data = BlockFile::open(files.path(&FileType::Data))?;
        if data.block_size() as usize != schema.row_width() {
            return Err(TableError::Corrupted(format!(
                "data file block size {} does not match row width {}",
                data.block_size(),
                schema.row_width()
            )));
        }

        let index_options = IndexOptions {
            degree: schema.index_degree(),
            ..options.index
        };
        let mut indexes = BTreeMap::new();
        for column in schema.indexed_columns() {
            let (_, col) = schema.column(column)?;
            let path = files.path(&FileType::Index(column.to_string()));
            indexes.insert(column.to_string(), BTree::open(path, col.ty(), index_options)?);
        }

        log::info!("opened table {name} with {} rows", data.block_count());
        Ok(Table {
            schema,
            data,
            indexes,
        })
    }

    /// Flushes and closes the data file and every index.
    pub fn close(self) -> Result<(), TableError> {
        let Table {
            mut data, indexes, ..
        } = self;
        for index in indexes.into_values() {
            index.close()?;
        }
        data.flush()?;
        Ok(())
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Inserts a row. Every column needs a value, given as text keyed by column name.
    ///
    /// Returns the locator of the new row.
    pub fn insert(&mut self, values: &HashMap<String, String>) -> Result<RecordPtr, TableError> {
        for column in values.keys() {
            self.schema.column(column)?;
        }
        let texts = self
            .schema
            .columns()
            .iter()
            .map(|col| {
                values
                    .get(col.name())
                    .map(String::as_str)
                    .ok_or_else(|| TableError::MissingValue(col.name().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let record = Record::parse(self.schema.columns(), texts)?;

        let ptr = self.data.allocate_block()?;
        self.data.write_block(ptr, &record.serialize())?;
        for (column, index) in self.indexes.iter_mut() {
            let (pos, _) = self.schema.column(column)?;
            index.insert(&record.fields[pos].to_bytes(), ptr)?;
        }
        log::debug!("inserted row {ptr} into {}", self.schema.name());
        Ok(ptr)
    }

    /// Returns rows whose values equal every value in `example`. An empty example matches every row.
    ///
    /// When any of the example's columns is indexed, the first of them in name order drives the lookup and
    /// rows come back in index order; otherwise the data file is scanned in row order.
    pub fn select(&mut self, example: &HashMap<String, String>) -> Result<Vec<Record>, TableError> {
        let conditions = example
            .iter()
            .map(|(column, text)| {
                let (pos, col) = self.schema.column(column)?;
                Ok((pos, Field::parse(col.ty(), text)?))
            })
            .collect::<Result<Vec<_>, TableError>>()?;

        // `indexes` iterates in name order, so this picks the first indexed column by name.
        let driving = self.indexes.keys().find_map(|name| {
            conditions
                .iter()
                .find(|(pos, _)| self.schema.columns()[*pos].name() == name)
                .map(|(_, field)| (name.clone(), *field))
        });
        let ptrs = match driving {
            Some((column, field)) => {
                log::debug!("select on {} uses index {column}", self.schema.name());
                self.index_mut(&column)?.get(&field.to_bytes())?
            }
            None => self.data.block_offsets().collect(),
        };

        let mut records = Vec::new();
        for ptr in ptrs {
            let record = self.read_record(ptr)?;
            if conditions
                .iter()
                .all(|(pos, field)| record.fields[*pos] == *field)
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Returns rows whose `column` value lies in `[start, end]`, in index order.
    pub fn select_range(
        &mut self,
        column: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<Record>, TableError> {
        let (_, col) = self.schema.column(column)?;
        let ty = col.ty();
        let start = ty.parse(start)?;
        let end = ty.parse(end)?;
        let ptrs = self.index_mut(column)?.scan(&start, &end)?;
        ptrs.into_iter().map(|ptr| self.read_record(ptr)).collect()
    }

    fn index_mut(&mut self, column: &str) -> Result<&mut BTree<DataType>, TableError> {
        self.indexes
            .get_mut(column)
            .ok_or_else(|| TableError::NotIndexed(column.to_string()))
    }

    fn read_record(&mut self, ptr: RecordPtr) -> Result<Record, TableError> {
        let mut buffer = vec![0u8; self.schema.row_width()];
        self.data.read_block(ptr, &mut buffer)?;
        Ok(Record::deserialize(self.schema.columns(), &buffer)?)
    }
}
