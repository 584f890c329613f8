//! photoscan-store: the persisted face corpus.
//!
//! A corpus is two files in one data directory, loaded and written as a unit:
//! `faces.idx` (the bincode-serialized vector index, carrying the fusion
//! version tag) and `metadata.db` (SQLite photo and face rows). Every indexed
//! vector id has exactly one face row and vice versa.

pub mod corpus;
pub mod index_file;
pub mod metadata;
pub mod records;
mod schema;

pub use corpus::{Corpus, CorpusStats, DB_FILE, INDEX_FILE};
pub use records::{FaceRecord, GeoPoint, IngestMeta, NewFace, NewPhoto, PhotoRecord};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("index file {path}: {reason}")]
    IndexFile { path: String, reason: String },
    #[error("{present} exists but {missing} is missing; the corpus files must be restored together")]
    MissingCounterpart { present: String, missing: String },
    #[error("corpus was built with {found}, current models produce {expected}; re-ingest the corpus")]
    VersionMismatch { expected: String, found: String },
    #[error("index and metadata disagree: {0}")]
    Inconsistent(String),
    #[error("index: {0}")]
    Index(#[from] photoscan_core::IndexError),
}
