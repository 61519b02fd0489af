//! Error types and result definitions

use std::path::PathBuf;

use thiserror::Error;

use crate::core::Space;

/// Result type alias for indexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the indexer
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The input file could not be opened or read
    #[error("Input error for {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output directory could not be created or written
    #[error("Output directory error for {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Storage I/O failed while touching a specific key
    #[error("Storage error on key {key:?}: {source}")]
    Storage {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Embedded database error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Embedded database write failed for a specific key
    #[error("SQLite error on key {key:?}: {source}")]
    SqliteKey {
        key: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Lookup of an absent key
    #[error("Key not found: {0:?}")]
    KeyNotFound(String),

    /// The identifier counter of a space no longer matches its index size
    #[error("Identifier space {space} corrupted: index holds {size} keys but next id is {next_id}")]
    InvariantViolation { space: Space, size: u64, next_id: u64 },

    /// On-disk index file does not have the expected layout
    #[error("Corrupt index file {path}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Progress marker cannot be used to resume
    #[error("Progress error: {0}")]
    Progress(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error must abort the whole run instead of skipping a chunk.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::KeyNotFound(_) | Error::Serialization(_) => false,
            Error::Config(_)
            | Error::Input { .. }
            | Error::OutputDir { .. }
            | Error::Storage { .. }
            | Error::Sqlite(_)
            | Error::SqliteKey { .. }
            | Error::InvariantViolation { .. }
            | Error::CorruptIndex { .. }
            | Error::Progress(_)
            | Error::Io(_) => true,
        }
    }

    pub(crate) fn storage(key: &str, source: std::io::Error) -> Self {
        Error::Storage { key: key.to_string(), source }
    }

    pub(crate) fn sqlite_key(key: &str, source: rusqlite::Error) -> Self {
        Error::SqliteKey { key: key.to_string(), source }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
