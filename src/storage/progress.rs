//! `progress.json`: where an interrupted run left off.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;
use serde::{Deserialize, Serialize};

use crate::config::IndexerConfig;
use crate::core::ReadPosition;
use crate::error::{Error, Result};
use crate::storage::indexing::IndexBackend;

pub const PROGRESS_FILE: &str = "progress.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Indexing,
    Materializing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: Phase,
    pub input_path: PathBuf,
    pub input_size: u64,
    pub chunk_size: usize,
    pub max_rows: Option<u64>,
    pub backend: IndexBackend,
    /// End of the last checkpointed chunk of the indexing pass
    pub indexing: ReadPosition,
    pub next_entity_id: u64,
    pub next_relation_id: u64,
    /// End of the last chunk written by the materialization pass
    pub materializing: ReadPosition,
    pub materialized_rows: u64,
    pub malformed_lines: u64,
    pub dropped_rows: u64,
    pub skipped_chunks: u64,
    /// TSV mappings and metadata were written after the run completed
    #[serde(default)]
    pub exported: bool,
}

impl Progress {
    pub fn new(config: &IndexerConfig, input_size: u64) -> Self {
        Self {
            phase: Phase::Indexing,
            input_path: config.file_path.clone(),
            input_size,
            chunk_size: config.chunk_size,
            max_rows: config.max_rows,
            backend: config.backend,
            indexing: ReadPosition::default(),
            next_entity_id: 0,
            next_relation_id: 0,
            materializing: ReadPosition::default(),
            materialized_rows: 0,
            malformed_lines: 0,
            dropped_rows: 0,
            skipped_chunks: 0,
            exported: false,
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(PROGRESS_FILE)
    }

    /// Marker left in `dir`, if any.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let progress = serde_json::from_str(&contents)
            .map_err(|e| Error::Progress(format!("cannot parse {}: {e}", path.display())))?;
        Ok(Some(progress))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let mut file = AtomicWriteFile::options().open(Self::path(dir))?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.commit()?;
        Ok(())
    }

    /// Refuse to resume a marker written for a different input or layout.
    pub fn check_compatible(&self, config: &IndexerConfig, input_size: u64) -> Result<()> {
        let mut mismatches = Vec::new();
        if self.input_size != input_size {
            mismatches.push(format!("input size {} != {}", self.input_size, input_size));
        }
        if self.chunk_size != config.chunk_size {
            mismatches.push(format!("chunk size {} != {}", self.chunk_size, config.chunk_size));
        }
        if self.max_rows != config.max_rows {
            mismatches.push(format!("row limit {:?} != {:?}", self.max_rows, config.max_rows));
        }
        if self.backend != config.backend {
            mismatches.push(format!("backend {} != {}", self.backend, config.backend));
        }
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(Error::Progress(format!(
                "existing progress marker does not match this run ({}); rerun with --fresh to start over",
                mismatches.join(", ")
            )))
        }
    }
}
