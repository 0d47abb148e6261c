pub mod b_tree;
pub mod b_tree_key;
mod b_tree_node;
pub mod block_file;
pub mod catalog;
pub mod data_types;
pub mod files_manager;
pub mod record;
pub mod table;

pub use b_tree_node::{BTreeNodeError, RecordPtr};
