use std::fs;
use std::path::Path;

use metadata::MetadataError;
use redb::{CommitError, Database, DatabaseError, StorageError, TableError, TransactionError};
use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod commands;
pub mod documents;
pub mod fingerprints;
pub mod indexer;
pub mod kinds;
pub mod queue;
pub mod scanner;
pub mod serializer;
pub mod store;

pub use catalog::{
    BackingCatalog, CatalogError, CatalogRequest, CatalogResponse, Document, KindDefinition,
    Query,
};
pub use documents::DocumentCatalog;
pub use fingerprints::FingerprintStore;
pub use indexer::{FileOutcome, Indexer, ScanSummary};
pub use queue::{CommandQueue, QueueEvent, QueueEvents, QueueState, QueueStats};
pub use scanner::IgnoreSet;
pub use store::MediaStore;

/// Schema the running code expects. Any other persisted value forces a rebuild.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Metadata(MetadataError),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    Json(serde_json::Error),
    Catalog(CatalogError),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Metadata(err) => write!(f, "metadata error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::Json(err) => write!(f, "json error: {}", err),
            LibraryError::Catalog(err) => write!(f, "catalog error: {}", err),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<MetadataError> for LibraryError {
    fn from(err: MetadataError) -> Self {
        LibraryError::Metadata(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
    }
}

impl From<serde_json::Error> for LibraryError {
    fn from(err: serde_json::Error) -> Self {
        LibraryError::Json(err)
    }
}

impl From<CatalogError> for LibraryError {
    fn from(err: CatalogError) -> Self {
        LibraryError::Catalog(err)
    }
}

pub(crate) fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}
