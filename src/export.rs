//! Human-readable dumps of the indexes and the run metadata.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::Space;
use crate::error::{Error, Result};
use crate::storage::indexing::dictionary::{HashOriginFile, HashOriginMap};
use crate::storage::indexing::{backend_files, open_index, IndexBackend, KeyPolicy, KeyValueIndex, SQLITE_FILE};

pub const METADATA_FILE: &str = "metadata.json";

/// TSV file listing the mappings of `space`.
pub fn tsv_path(dir: &Path, space: Space) -> PathBuf {
    dir.join(format!("{}.tsv", space.name()))
}

/// Write `id<TAB>original` lines for every key of `store`, in identifier
/// order. Digest keys are replaced by the value they stand for.
pub fn export_space(path: &Path, store: &dyn KeyValueIndex, origins: &HashOriginMap) -> Result<u64> {
    let entries = store.entries()?;
    let mut file = AtomicWriteFile::options().open(path)?;
    {
        let mut writer = BufWriter::new(&mut file);
        for (key, id) in &entries {
            let original = origins.original(key).unwrap_or(key.as_str());
            writeln!(writer, "{id}\t{original}")?;
        }
        writer.flush()?;
    }
    file.commit()?;
    Ok(entries.len() as u64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub entities: u64,
    pub relations: u64,
}

/// Open the indexes in `dir` and write both TSV files. Fails without
/// touching `dir` when it holds no indexes of `backend`.
pub fn export_dir(dir: &Path, backend: IndexBackend) -> Result<ExportSummary> {
    let required = match backend {
        IndexBackend::Mmap => backend_files(backend, dir),
        IndexBackend::Sqlite => vec![dir.join(SQLITE_FILE)],
    };
    if let Some(missing) = required.iter().find(|path| !path.is_file()) {
        return Err(Error::Config(format!(
            "no {backend} indexes in {}: {} is missing",
            dir.display(),
            missing.display()
        )));
    }

    let (entity_origins, relation_origins) = HashOriginFile::load_or_default(dir)?.into_maps();
    let policy = KeyPolicy::default();

    let entities = open_index(backend, dir, Space::Entity, policy)?;
    let relations = open_index(backend, dir, Space::Relation, policy)?;
    let summary = ExportSummary {
        entities: export_space(&tsv_path(dir, Space::Entity), entities.as_ref(), &entity_origins)?,
        relations: export_space(&tsv_path(dir, Space::Relation), relations.as_ref(), &relation_origins)?,
    };
    info!(dir = %dir.display(), entities = summary.entities, relations = summary.relations, "exported mappings");
    Ok(summary)
}

/// Totals for an output directory, accumulated over every input indexed into it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub triple_count: u64,
    pub entity_count: u64,
    pub relation_count: u64,
    pub malformed_lines: u64,
    pub dropped_rows: u64,
    pub backend: IndexBackend,
    pub inputs: Vec<PathBuf>,
}

impl Metadata {
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_reader(File::open(path)?)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let mut file = AtomicWriteFile::options().open(dir.join(METADATA_FILE))?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.commit()?;
        Ok(())
    }
}

/// Counts contributed by one completed run.
#[derive(Debug, Clone, Default)]
pub struct RunTotals {
    pub input: PathBuf,
    pub triples: u64,
    pub entities: u64,
    pub relations: u64,
    pub malformed_lines: u64,
    pub dropped_rows: u64,
    pub backend: IndexBackend,
}

/// Fold a completed run into `metadata.json`. Triple and error counts add
/// up; identifier counts are replaced since the indexes are shared.
pub fn record_run(dir: &Path, run: &RunTotals) -> Result<Metadata> {
    let mut metadata = Metadata::load_or_default(dir)?;
    metadata.triple_count += run.triples;
    metadata.malformed_lines += run.malformed_lines;
    metadata.dropped_rows += run.dropped_rows;
    metadata.entity_count = run.entities;
    metadata.relation_count = run.relations;
    metadata.backend = run.backend;
    metadata.inputs.push(run.input.clone());
    metadata.save(dir)?;
    Ok(metadata)
}

/// Remove a file if present.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest;
    use crate::storage::indexing::mmap::MmapIndex;
    use tempfile::TempDir;

    #[test]
    fn test_export_space_restores_originals() {
        let dir = TempDir::new().unwrap();
        let mut store = MmapIndex::open(dir.path(), "entities", KeyPolicy::default()).unwrap();
        let long = "z".repeat(2000);
        store.put("b", 1).unwrap();
        store.put("a", 0).unwrap();
        store.put(&digest(&long), 2).unwrap();
        let mut origins = HashOriginMap::new();
        origins.record(&digest(&long), &long, 2);

        let path = tsv_path(dir.path(), Space::Entity);
        assert_eq!(export_space(&path, &store, &origins).unwrap(), 3);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("0\ta\n1\tb\n2\t{long}\n"));
    }

    #[test]
    fn test_export_dir_without_indexes_creates_nothing() {
        let dir = TempDir::new().unwrap();
        for backend in [IndexBackend::Mmap, IndexBackend::Sqlite] {
            let err = export_dir(dir.path(), backend).err().unwrap();
            assert!(matches!(err, Error::Config(_)));
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_export_dir_reads_existing_indexes() {
        let dir = TempDir::new().unwrap();
        for space in [Space::Entity, Space::Relation] {
            let mut store = MmapIndex::open(dir.path(), space.name(), KeyPolicy::default()).unwrap();
            store.put("ex:x", 0).unwrap();
            store.flush().unwrap();
        }

        let summary = export_dir(dir.path(), IndexBackend::Mmap).unwrap();
        assert_eq!(summary, ExportSummary { entities: 1, relations: 1 });
        assert_eq!(fs::read_to_string(tsv_path(dir.path(), Space::Relation)).unwrap(), "0\tex:x\n");
    }

    #[test]
    fn test_metadata_accumulates_triples() {
        let dir = TempDir::new().unwrap();
        let run = RunTotals { input: PathBuf::from("a.nt"), triples: 3, entities: 3, relations: 2, ..RunTotals::default() };
        record_run(dir.path(), &run).unwrap();
        let run = RunTotals { input: PathBuf::from("b.nt"), triples: 5, entities: 6, relations: 2, ..RunTotals::default() };
        let metadata = record_run(dir.path(), &run).unwrap();

        assert_eq!(metadata.triple_count, 8);
        assert_eq!(metadata.entity_count, 6);
        assert_eq!(Metadata::load_or_default(dir.path()).unwrap(), metadata);
    }
}
