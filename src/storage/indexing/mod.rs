//! Persistent string → identifier indexes.
//!
//! One [`KeyValueIndex`] exists per identifier space. Two interchangeable
//! backends implement it:
//!
//! - [`mmap::MmapIndex`]: memory-mapped open-addressing table, fastest, but a
//!   crash between two flushes may lose the unflushed tail.
//! - [`sqlite::SqliteIndex`]: embedded SQLite table, point lookups per key,
//!   transactional commits on every flush.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::Space;
use crate::error::Result;

pub mod dictionary;
pub mod mmap;
pub mod sqlite;

/// Outcome of [`KeyValueIndex::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was not present and has been stored
    Inserted,
    /// The key already existed; its value now equals the one given
    AlreadyPresent,
    /// The backend cannot store this key; nothing was written
    RejectedKey,
}

/// Durable mapping from a key string to its identifier.
pub trait KeyValueIndex: Send {
    fn contains(&self, key: &str) -> Result<bool>;

    /// Identifier of `key`, or [`crate::Error::KeyNotFound`].
    fn get(&self, key: &str) -> Result<u64>;

    fn put(&mut self, key: &str, value: u64) -> Result<PutOutcome>;

    /// Bulk-write path. Keys must already satisfy the index's [`KeyPolicy`].
    fn put_all(&mut self, entries: &mut dyn Iterator<Item = (String, u64)>) -> Result<()> {
        for (key, value) in entries {
            if self.put(&key, value)? == PutOutcome::RejectedKey {
                return Err(rejected(&key));
            }
        }
        Ok(())
    }

    /// Number of distinct keys stored.
    fn size(&self) -> Result<u64>;

    /// Make every pending write durable.
    fn flush(&mut self) -> Result<()>;

    /// All `(key, id)` pairs ordered by id.
    fn entries(&self) -> Result<Vec<(String, u64)>>;

    fn policy(&self) -> &KeyPolicy;
}

/// Constraints a key must satisfy to be stored as-is. Keys that fail the
/// check go through the digest fallback instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub max_key_bytes: usize,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self { max_key_bytes: 1024 }
    }
}

impl KeyPolicy {
    pub fn accepts(&self, key: &str) -> bool {
        !key.is_empty()
            && key.len() <= self.max_key_bytes
            && !key.bytes().any(|b| b.is_ascii_control())
    }
}

pub(crate) fn rejected(key: &str) -> crate::Error {
    crate::Error::storage(
        key,
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "key violates index policy"),
    )
}

/// Storage backend used for both identifier spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IndexBackend {
    #[default]
    Mmap,
    Sqlite,
}

impl fmt::Display for IndexBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexBackend::Mmap => f.write_str("mmap"),
            IndexBackend::Sqlite => f.write_str("sqlite"),
        }
    }
}

impl FromStr for IndexBackend {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "mmap" => Ok(IndexBackend::Mmap),
            "sqlite" | "db" => Ok(IndexBackend::Sqlite),
            other => Err(format!("unknown backend {other:?}, expected mmap or sqlite")),
        }
    }
}

/// Name of the SQLite file shared by both spaces.
pub const SQLITE_FILE: &str = "indexing.db";

/// Open (or create) the index of `space` inside `dir`.
pub fn open_index(
    backend: IndexBackend,
    dir: &Path,
    space: Space,
    policy: KeyPolicy,
) -> Result<Box<dyn KeyValueIndex>> {
    match backend {
        IndexBackend::Mmap => Ok(Box::new(mmap::MmapIndex::open(dir, space.name(), policy)?)),
        IndexBackend::Sqlite => {
            Ok(Box::new(sqlite::SqliteIndex::open(&dir.join(SQLITE_FILE), space.name(), policy)?))
        }
    }
}

/// Files that belong to a backend in `dir`, used to reset an output directory.
pub fn backend_files(backend: IndexBackend, dir: &Path) -> Vec<std::path::PathBuf> {
    match backend {
        IndexBackend::Mmap => [Space::Entity, Space::Relation]
            .iter()
            .flat_map(|space| mmap::MmapIndex::files(dir, space.name()))
            .collect(),
        IndexBackend::Sqlite => ["", "-wal", "-shm"]
            .iter()
            .map(|suffix| dir.join(format!("{SQLITE_FILE}{suffix}")))
            .collect(),
    }
}
