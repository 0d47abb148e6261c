//! FilesManager module - names the files that make up a single table.

use std::path::{Path, PathBuf};

use crate::b_tree::BTree;
use crate::data_types::DataType;

/// Represents possible file types of a table.
#[derive(Eq, PartialEq, Hash, Clone, Debug)]
pub enum FileType {
    /// Schema stored as JSON.
    Schema,
    /// Fixed-width rows, one per block.
    Data,
    /// B+Tree over one column.
    Index(String),
}

/// Resolves paths of the files belonging to table `table_name` inside database directory `base_path`.
///
/// Layout: `<table>.frm` (schema), `<table>.dat` (rows) and `<table>_<column>.idx` per indexed column.
#[derive(Clone, Debug)]
pub struct FilesManager {
    base_path: PathBuf,
    table_name: String,
}

impl FilesManager {
    pub fn new(base_path: impl Into<PathBuf>, table_name: impl Into<String>) -> Self {
        FilesManager {
            base_path: base_path.into(),
            table_name: table_name.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn path(&self, file_type: &FileType) -> PathBuf {
        match file_type {
            FileType::Schema => self.base_path.join(format!("{}.frm", self.table_name)),
            FileType::Data => self.base_path.join(format!("{}.dat", self.table_name)),
            FileType::Index(column) => {
                BTree::<DataType>::index_path(&self.base_path, &self.table_name, column)
            }
        }
    }

    /// A table exists once its schema file does.
    pub fn table_exists(&self) -> bool {
        self.path(&FileType::Schema).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_follow_table_layout() {
        let files = FilesManager::new("/db", "people");

        assert_eq!(files.path(&FileType::Schema), PathBuf::from("/db/people.frm"));
        assert_eq!(files.path(&FileType::Data), PathBuf::from("/db/people.dat"));
        assert_eq!(
            files.path(&FileType::Index("age".into())),
            PathBuf::from("/db/people_age.idx")
        );
    }

    #[test]
    fn table_exists_checks_schema_file() {
        let dir = tempdir().unwrap();
        let files = FilesManager::new(dir.path(), "t");
        assert!(!files.table_exists());

        std::fs::write(files.path(&FileType::Schema), "{}").unwrap();

        assert!(files.table_exists());
    }
}
