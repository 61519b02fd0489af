//! Two-pass driver: index every unique value, then materialize the triples.
//!
//! Both passes stream the input chunk by chunk and record their position in
//! `progress.json`, so an interrupted run picks up at the last completed
//! chunk. A stop flag is checked between chunks.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::IndexerConfig;
use crate::core::{Chunk, ReadPosition, Space};
use crate::error::{Error, Result};
use crate::export::{self, ExportSummary, RunTotals};
use crate::indexing::builder::{IndexBuilder, SpaceIndexer};
use crate::indexing::materializer::{Materializer, SpaceResolver, TripleSink};
use crate::parsing::TripleReader;
use crate::storage::indexing::dictionary::{HashOriginFile, HASH_ORIGIN_FILE};
use crate::storage::indexing::sqlite::TransformedTable;
use crate::storage::indexing::{backend_files, open_index, IndexBackend, SQLITE_FILE};
use crate::storage::memory_guard::{format_bytes, MemoryGuard, MemoryProbe, SystemProbe};
use crate::storage::progress::{Phase, Progress, PROGRESS_FILE};
use crate::storage::train_set::{TrainSetWriter, TRAIN_SET_FILE};

/// Outcome of [`Pipeline::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub phase: Phase,
    pub entities: u64,
    pub relations: u64,
    pub materialized_rows: u64,
    pub dropped_rows: u64,
    pub malformed_lines: u64,
    pub skipped_chunks: u64,
    /// Peak resident memory sampled during this run
    pub peak_resident_bytes: u64,
    /// Working dictionaries spilled early by the memory guard
    pub spills: u64,
    /// The stop flag ended the run before both passes completed
    pub stopped: bool,
    pub elapsed: Duration,
}

pub struct Pipeline {
    config: IndexerConfig,
    builder: IndexBuilder,
    progress: Progress,
    guard: MemoryGuard,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    /// Prepare the output directory, open both indexes and load the progress
    /// marker left by an earlier run.
    pub fn new(config: IndexerConfig) -> Result<Self> {
        Self::with_probe(config, Box::new(SystemProbe::new()))
    }

    pub fn with_probe(config: IndexerConfig, probe: Box<dyn MemoryProbe>) -> Result<Self> {
        config.validate()?;
        let dir = config.output_dir.clone();
        fs::create_dir_all(&dir).map_err(|source| Error::OutputDir { path: dir.clone(), source })?;

        if config.fresh {
            reset_output_dir(&dir, config.backend)?;
        }

        let input_size = fs::metadata(&config.file_path)
            .map_err(|source| Error::Input { path: config.file_path.clone(), source })?
            .len();
        let progress = resume_point(&config, input_size)?;

        let (entity_origins, relation_origins) = HashOriginFile::load_or_default(&dir)?.into_maps();
        let policy = config.key_policy();
        let entities = SpaceIndexer::new(
            Space::Entity,
            open_index(config.backend, &dir, Space::Entity, policy)?,
            entity_origins,
        )?;
        let relations = SpaceIndexer::new(
            Space::Relation,
            open_index(config.backend, &dir, Space::Relation, policy)?,
            relation_origins,
        )?;

        if entities.next_id() < progress.next_entity_id || relations.next_id() < progress.next_relation_id {
            return Err(Error::Progress(format!(
                "indexes hold fewer keys ({} entities, {} relations) than recorded in {PROGRESS_FILE} ({}, {})",
                entities.next_id(),
                relations.next_id(),
                progress.next_entity_id,
                progress.next_relation_id
            )));
        }

        info!(
            input = %config.file_path.display(),
            output = %dir.display(),
            backend = %config.backend,
            phase = ?progress.phase,
            entities = entities.next_id(),
            relations = relations.next_id(),
            "pipeline ready"
        );

        let guard = MemoryGuard::new(probe, config.memory_threshold, config.max_working_entries);
        let builder = IndexBuilder::new(entities, relations, config.parallel);
        Ok(Self { config, builder, progress, guard, stop: Arc::new(AtomicBool::new(false)) })
    }

    /// Flag that ends the run at the next chunk boundary when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn builder(&self) -> &IndexBuilder {
        &self.builder
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut stopped = false;

        if self.progress.phase == Phase::Indexing {
            stopped = self.index_pass()?;
        }
        if !stopped && self.progress.phase == Phase::Materializing {
            stopped = self.materialize_pass()?;
        }
        if !stopped && self.progress.phase == Phase::Done && !self.progress.exported {
            self.finish()?;
        }

        let memory = self.guard.stats();
        let summary = RunSummary {
            phase: self.progress.phase,
            entities: self.builder.entities().next_id(),
            relations: self.builder.relations().next_id(),
            materialized_rows: self.progress.materialized_rows,
            dropped_rows: self.progress.dropped_rows,
            malformed_lines: self.progress.malformed_lines,
            skipped_chunks: self.progress.skipped_chunks,
            peak_resident_bytes: memory.peak_bytes,
            spills: memory.spills,
            stopped,
            elapsed: started.elapsed(),
        };
        if stopped {
            warn!(phase = ?summary.phase, "run stopped at a chunk boundary, rerun to resume");
        }
        info!(
            entities = summary.entities,
            relations = summary.relations,
            rows = summary.materialized_rows,
            dropped = summary.dropped_rows,
            malformed = summary.malformed_lines,
            peak_resident = %format_bytes(memory.peak_bytes),
            avg_resident = %format_bytes(memory.avg_bytes as u64),
            memory_samples = memory.total_measurements,
            spills = memory.spills,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "run finished"
        );
        Ok(summary)
    }

    fn log_skipped_chunk(&mut self, pass: &str, chunk: &Chunk, err: &Error) {
        let memory = self.guard.record();
        error!(
            pass,
            chunk = chunk.index,
            rows = chunk.len(),
            chunk_bytes = chunk.estimated_bytes(),
            resident = %format_bytes(memory.resident_bytes),
            usage = memory.usage_ratio(),
            error = %err,
            "skipping chunk"
        );
        self.progress.skipped_chunks += 1;
    }

    /// Returns whether the stop flag interrupted the pass.
    fn index_pass(&mut self) -> Result<bool> {
        let start = self.progress.indexing;
        let base_malformed = self.progress.malformed_lines;
        let mut reader = TripleReader::open_at(
            &self.config.file_path,
            self.config.chunk_size,
            self.config.max_rows,
            start,
        )?;
        info!(line = start.line, rows = start.rows, chunk = start.chunks, "indexing pass");

        let empty_indexes = self.builder.entities().next_id() == 0 && self.builder.relations().next_id() == 0;
        let mut position = start;
        let mut since_checkpoint = 0;
        loop {
            if self.stop_requested() {
                self.checkpoint(position, base_malformed + reader.malformed())?;
                return Ok(true);
            }
            let Some(chunk) = reader.next() else {
                break;
            };
            let chunk = chunk?;
            let chunk_started = Instant::now();

            match self.builder.index_chunk(&chunk, empty_indexes && chunk.index == 0) {
                Ok(report) => {
                    let memory = self.guard.record();
                    info!(
                        chunk = chunk.index,
                        rows = chunk.len(),
                        chunk_bytes = chunk.estimated_bytes(),
                        unique_entities = report.unique_entities,
                        unique_relations = report.unique_relations,
                        new_entities = report.new_entities,
                        new_relations = report.new_relations,
                        working_entity_bytes = self.builder.entities().working_bytes(),
                        working_relation_bytes = self.builder.relations().working_bytes(),
                        resident = %format_bytes(memory.resident_bytes),
                        elapsed_ms = chunk_started.elapsed().as_millis() as u64,
                        "indexed chunk"
                    );
                }
                Err(err) if !err.is_fatal() => self.log_skipped_chunk("indexing", &chunk, &err),
                Err(err) => return Err(err),
            }

            for space in [Space::Entity, Space::Relation] {
                self.guard.check_and_maybe_flush(self.builder.indexer_mut(space))?;
            }

            position = chunk.end;
            since_checkpoint += 1;
            if since_checkpoint >= self.config.checkpoint_every {
                self.checkpoint(position, base_malformed + reader.malformed())?;
                since_checkpoint = 0;
            }
        }

        self.checkpoint(position, base_malformed + reader.malformed())?;
        self.progress.phase = Phase::Materializing;
        self.progress.materializing = ReadPosition::default();
        self.progress.materialized_rows = 0;
        self.progress.save(&self.config.output_dir)?;
        info!(
            entities = self.progress.next_entity_id,
            relations = self.progress.next_relation_id,
            spills = self.guard.spills(),
            "indexing pass complete"
        );
        Ok(false)
    }

    /// Persist both spaces and the hash-origin map, then record `position`.
    fn checkpoint(&mut self, position: ReadPosition, malformed: u64) -> Result<()> {
        self.builder.checkpoint()?;
        self.save_hash_origins()?;

        self.progress.indexing = position;
        self.progress.malformed_lines = malformed;
        self.progress.next_entity_id = self.builder.entities().next_id();
        self.progress.next_relation_id = self.builder.relations().next_id();
        self.progress.save(&self.config.output_dir)
    }

    fn save_hash_origins(&mut self) -> Result<()> {
        if !self.builder.entities().origins().is_dirty() && !self.builder.relations().origins().is_dirty() {
            return Ok(());
        }
        let file = HashOriginFile::new(self.builder.entities().origins(), self.builder.relations().origins());
        file.save_to_file(&self.config.output_dir.join(HASH_ORIGIN_FILE))?;
        info!(entities = file.entities.len(), relations = file.relations.len(), "saved hash-origin map");
        for space in [Space::Entity, Space::Relation] {
            self.builder.indexer_mut(space).origins_mut().mark_saved();
        }
        Ok(())
    }

    fn open_sinks(&self) -> Result<Vec<Box<dyn TripleSink>>> {
        let dir = &self.config.output_dir;
        let rows = self.progress.materialized_rows;
        let mut sinks: Vec<Box<dyn TripleSink>> = vec![Box::new(TrainSetWriter::resume(dir, rows)?)];
        if self.config.backend == IndexBackend::Sqlite {
            let mut table = TransformedTable::open(&dir.join(SQLITE_FILE))?;
            table.truncate(rows)?;
            sinks.push(Box::new(table));
        }
        for sink in &sinks {
            let written = sink.rows_written()?;
            if written != rows {
                return Err(Error::Progress(format!(
                    "an output holds {written} materialized rows but {PROGRESS_FILE} records {rows}"
                )));
            }
        }
        Ok(sinks)
    }

    /// Returns whether the stop flag interrupted the pass.
    fn materialize_pass(&mut self) -> Result<bool> {
        let start = self.progress.materializing;
        let mut sinks = self.open_sinks()?;
        let reader = TripleReader::open_at(
            &self.config.file_path,
            self.config.chunk_size,
            self.config.max_rows,
            start,
        )?;
        info!(line = start.line, rows = self.progress.materialized_rows, "materialization pass");

        let entity_origins = self.builder.entities().origins().sorted();
        let relation_origins = self.builder.relations().origins().sorted();
        let Self { config, builder, progress, guard, stop } = self;
        let materializer = Materializer::new(
            SpaceResolver::new(builder.entities().store(), &entity_origins),
            SpaceResolver::new(builder.relations().store(), &relation_origins),
        );

        for chunk in reader {
            if stop.load(Ordering::SeqCst) {
                return Ok(true);
            }
            let chunk = chunk?;
            let chunk_started = Instant::now();

            match materializer.materialize_chunk(&chunk) {
                Ok(out) => {
                    for sink in &mut sinks {
                        sink.append(&out.rows)?;
                    }
                    progress.materialized_rows += out.rows.len() as u64;
                    progress.dropped_rows += out.dropped;
                    let memory = guard.record();
                    info!(
                        chunk = chunk.index,
                        rows = out.rows.len(),
                        chunk_bytes = chunk.estimated_bytes(),
                        dropped = out.dropped,
                        total_rows = progress.materialized_rows,
                        resident = %format_bytes(memory.resident_bytes),
                        elapsed_ms = chunk_started.elapsed().as_millis() as u64,
                        "materialized chunk"
                    );
                }
                Err(err) if !err.is_fatal() => {
                    let memory = guard.record();
                    error!(
                        pass = "materializing",
                        chunk = chunk.index,
                        rows = chunk.len(),
                        chunk_bytes = chunk.estimated_bytes(),
                        resident = %format_bytes(memory.resident_bytes),
                        usage = memory.usage_ratio(),
                        error = %err,
                        "skipping chunk"
                    );
                    progress.skipped_chunks += 1;
                }
                Err(err) => return Err(err),
            }

            progress.materializing = chunk.end;
            progress.save(&config.output_dir)?;
        }

        progress.phase = Phase::Done;
        progress.save(&config.output_dir)?;
        info!(rows = progress.materialized_rows, dropped = progress.dropped_rows, "materialization pass complete");
        Ok(false)
    }

    /// Export the mappings and fold this run into `metadata.json`.
    fn finish(&mut self) -> Result<ExportSummary> {
        let dir = &self.config.output_dir;
        let entities = self.builder.entities();
        let relations = self.builder.relations();
        let summary = ExportSummary {
            entities: export::export_space(
                &export::tsv_path(dir, Space::Entity),
                entities.store(),
                entities.origins(),
            )?,
            relations: export::export_space(
                &export::tsv_path(dir, Space::Relation),
                relations.store(),
                relations.origins(),
            )?,
        };

        let metadata = export::record_run(
            dir,
            &RunTotals {
                input: self.config.file_path.clone(),
                triples: self.progress.materialized_rows,
                entities: entities.next_id(),
                relations: relations.next_id(),
                malformed_lines: self.progress.malformed_lines,
                dropped_rows: self.progress.dropped_rows,
                backend: self.config.backend,
            },
        )?;
        self.progress.exported = true;
        self.progress.save(dir)?;
        info!(
            entities = summary.entities,
            relations = summary.relations,
            total_triples = metadata.triple_count,
            "exported mappings and metadata"
        );
        Ok(summary)
    }
}

/// Progress to continue from: the saved marker when it belongs to this
/// input, a new marker after a completed run on another input, or an error.
fn resume_point(config: &IndexerConfig, input_size: u64) -> Result<Progress> {
    let Some(saved) = Progress::load(&config.output_dir)? else {
        return Ok(Progress::new(config, input_size));
    };

    let same_input = saved.input_path == config.file_path && saved.input_size == input_size;
    if saved.phase == Phase::Done && !same_input {
        if saved.backend != config.backend {
            return Err(Error::Progress(format!(
                "output directory was indexed with the {} backend, not {}",
                saved.backend, config.backend
            )));
        }
        info!(previous = %saved.input_path.display(), "previous input complete, extending its indexes");
        return Ok(Progress::new(config, input_size));
    }

    saved.check_compatible(config, input_size)?;
    if saved.phase != Phase::Done {
        info!(phase = ?saved.phase, line = saved.indexing.line, "resuming interrupted run");
    }
    Ok(saved)
}

/// Delete every file a previous run may have left in `dir`.
fn reset_output_dir(dir: &Path, backend: IndexBackend) -> Result<()> {
    warn!(dir = %dir.display(), "discarding previous outputs");
    let mut files = backend_files(backend, dir);
    files.extend(
        [PROGRESS_FILE, TRAIN_SET_FILE, HASH_ORIGIN_FILE, export::METADATA_FILE]
            .iter()
            .map(|name| dir.join(name)),
    );
    files.push(export::tsv_path(dir, Space::Entity));
    files.push(export::tsv_path(dir, Space::Relation));
    for file in files {
        export::remove_if_exists(&file)?;
    }
    Ok(())
}
