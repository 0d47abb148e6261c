use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use idxdb::b_tree::IndexOptions;
use idxdb::data_types::TypeRegistry;
use idxdb::record::Record;
use idxdb::table::{Table, TableError, TableOptions};
use thiserror::Error;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "idxdb client for creating and querying indexed tables", long_about = None)]
struct Cli {
    /// Database directory, defaults to the per-user data directory
    #[arg(short, long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new table
    Create {
        table: String,

        /// Column definition as NAME:TYPE, repeated for every column
        #[arg(short, long = "column", required = true)]
        columns: Vec<String>,

        /// Name of a column to index, may be repeated
        #[arg(short, long = "index")]
        indexes: Vec<String>,

        /// Maximal number of entries per index node, kept for the table's lifetime
        #[arg(long, default_value_t = IndexOptions::DEFAULT_DEGREE)]
        degree: usize,
    },

    /// Insert a row given as NAME=VALUE pairs, one for every column
    Insert { table: String, values: Vec<String> },

    /// Print rows matching every NAME=VALUE pair, or all rows when none are given
    Select {
        table: String,
        conditions: Vec<String>,
    },

    /// Print rows whose indexed column lies between START and END inclusive
    Range {
        table: String,
        column: String,
        #[arg(allow_negative_numbers = true)]
        start: String,
        #[arg(allow_negative_numbers = true)]
        end: String,
    },
}

#[derive(Debug, Error)]
enum ClientError {
    #[error("couldn't find the data directory")]
    DirectoryNotFound,

    #[error("expected NAME{separator}VALUE, got '{arg}'")]
    InvalidPair { arg: String, separator: char },

    #[error("table error: {0}")]
    Table(#[from] TableError),
}

fn database_dir(dir: Option<PathBuf>) -> Result<PathBuf, ClientError> {
    match dir {
        Some(dir) => Ok(dir),
        None => ProjectDirs::from("", "", "idxdb")
            .map(|project_dir| project_dir.data_local_dir().to_path_buf())
            .ok_or(ClientError::DirectoryNotFound),
    }
}

fn split_pairs(args: &[String], separator: char) -> Result<Vec<(String, String)>, ClientError> {
    args.iter()
        .map(|arg| {
            arg.split_once(separator)
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| ClientError::InvalidPair {
                    arg: arg.clone(),
                    separator,
                })
        })
        .collect()
}

fn print_records(records: &[Record]) {
    for record in records {
        println!("{record}");
    }
}

fn main() -> Result<(), ClientError> {
    env_logger::init();

    let cli = Cli::parse();
    let dir = database_dir(cli.dir)?;
    let registry = TypeRegistry::new();
    let options = TableOptions::default();
    log::debug!("using database directory {}", dir.display());

    match cli.command {
        Command::Create {
            table,
            columns,
            indexes,
            degree,
        } => {
            let columns = split_pairs(&columns, ':')?;
            let columns: Vec<(&str, &str)> = columns
                .iter()
                .map(|(name, ty)| (name.as_str(), ty.as_str()))
                .collect();
            let indexes: Vec<&str> = indexes.iter().map(String::as_str).collect();
            let options = TableOptions {
                index: IndexOptions {
                    degree,
                    ..options.index
                },
            };
            Table::create(&dir, &table, &columns, &indexes, &registry, options)?.close()?;
            println!("Created table '{table}'.");
        }
        Command::Insert { table, values } => {
            let values: HashMap<_, _> = split_pairs(&values, '=')?.into_iter().collect();
            let mut table = Table::open(&dir, &table, &registry, options)?;
            table.insert(&values)?;
            table.close()?;
        }
        Command::Select { table, conditions } => {
            let conditions: HashMap<_, _> = split_pairs(&conditions, '=')?.into_iter().collect();
            let mut table = Table::open(&dir, &table, &registry, options)?;
            print_records(&table.select(&conditions)?);
            table.close()?;
        }
        Command::Range {
            table,
            column,
            start,
            end,
        } => {
            let mut table = Table::open(&dir, &table, &registry, options)?;
            print_records(&table.select_range(&column, &start, &end)?);
            table.close()?;
        }
    }
    Ok(())
}
