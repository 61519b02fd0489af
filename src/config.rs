//! Run configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::digest::DIGEST_LEN;
use crate::error::{Error, Result};
use crate::storage::indexing::{IndexBackend, KeyPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Whitespace-delimited triple file to index
    pub file_path: PathBuf,
    /// Directory receiving indexes, the array, and the progress marker
    pub output_dir: PathBuf,
    /// Triples per chunk
    pub chunk_size: usize,
    /// Stop after this many accepted triples
    pub max_rows: Option<u64>,
    pub backend: IndexBackend,
    /// Resident/total memory ratio above which working dictionaries spill
    pub memory_threshold: f64,
    /// Pending entries per space above which the working dictionary spills
    pub max_working_entries: usize,
    /// Chunks between checkpoints of the indexing pass
    pub checkpoint_every: u64,
    /// Index entities and relations on separate threads
    pub parallel: bool,
    /// Longest key stored as-is; longer keys go through the digest fallback
    pub max_key_bytes: usize,
    /// Discard existing outputs instead of resuming
    pub fresh: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("triples.nt"),
            output_dir: PathBuf::from("output"),
            chunk_size: 1_000_000,
            max_rows: None,
            backend: IndexBackend::Mmap,
            memory_threshold: 0.9,
            max_working_entries: 1_000_000,
            checkpoint_every: 1,
            parallel: true,
            max_key_bytes: KeyPolicy::default().max_key_bytes,
            fresh: false,
        }
    }
}

impl IndexerConfig {
    pub fn new(file_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self { file_path: file_path.into(), output_dir: output_dir.into(), ..Self::default() }
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy { max_key_bytes: self.max_key_bytes }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be greater than zero".to_string()));
        }
        if !(self.memory_threshold > 0.0 && self.memory_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "memory threshold must lie in (0, 1], got {}",
                self.memory_threshold
            )));
        }
        if self.max_working_entries == 0 {
            return Err(Error::Config("max working entries must be greater than zero".to_string()));
        }
        if self.checkpoint_every == 0 {
            return Err(Error::Config("checkpoint interval must be at least one chunk".to_string()));
        }
        if self.max_key_bytes < DIGEST_LEN {
            return Err(Error::Config(format!(
                "max key bytes must be at least {DIGEST_LEN} so digest keys fit, got {}",
                self.max_key_bytes
            )));
        }
        Ok(())
    }
}
