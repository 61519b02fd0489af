//! kg-indexer - entity/relation indexing of large triple files.
//!
//! Usage:
//!   kg-indexer index --file-path data/part_0.nt --output-dir out --chunksize 1000000
//!   kg-indexer index --file-path data/part_0.nt --output-dir out --backend sqlite --nrows 10000000
//!   kg-indexer export --output-dir out
//!   kg-indexer count --file-path data/part_0.nt

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kg_indexer::export::export_dir;
use kg_indexer::stats::count_triples;
use kg_indexer::storage::memory_guard::format_bytes;
use kg_indexer::storage::progress::Progress;
use kg_indexer::{Error, IndexBackend, IndexerConfig, Pipeline};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kg-indexer")]
#[command(about = "Assign dense ids to the entities and relations of a triple file")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a triple file and write train_set.npy
    Index {
        /// Whitespace-delimited triple file (N-Triples or N-Quads)
        #[arg(short, long)]
        file_path: PathBuf,

        /// Directory for indexes, train_set.npy and progress.json
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Triples per chunk
        #[arg(short, long = "chunksize")]
        chunk_size: usize,

        /// Stop after this many triples
        #[arg(short, long = "nrows")]
        max_rows: Option<u64>,

        /// Index backend: mmap or sqlite
        #[arg(short, long, default_value = "mmap")]
        backend: IndexBackend,

        /// Memory usage ratio above which pending ids spill to disk
        #[arg(long, default_value = "0.9")]
        memory_threshold: f64,

        /// Pending ids per space above which they spill to disk
        #[arg(long, default_value = "1000000")]
        max_working_entries: usize,

        /// Chunks between checkpoints
        #[arg(long, default_value = "1")]
        checkpoint_every: u64,

        /// Longest value stored as a key; longer ones are stored by digest
        #[arg(long, default_value = "1024")]
        max_key_bytes: usize,

        /// Index entities and relations on one thread
        #[arg(long)]
        sequential: bool,

        /// Discard previous outputs instead of resuming
        #[arg(long)]
        fresh: bool,
    },

    /// Write entities.tsv and relations.tsv from existing indexes
    Export {
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Backend of the indexes, read from progress.json when omitted
        #[arg(short, long)]
        backend: Option<IndexBackend>,
    },

    /// Count triples and unique values without indexing
    Count {
        #[arg(short, long)]
        file_path: PathBuf,

        #[arg(short, long = "chunksize", default_value = "1000000")]
        chunk_size: usize,

        #[arg(short, long = "nrows")]
        max_rows: Option<u64>,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run(command: Command) -> kg_indexer::Result<ExitCode> {
    match command {
        Command::Index {
            file_path,
            output_dir,
            chunk_size,
            max_rows,
            backend,
            memory_threshold,
            max_working_entries,
            checkpoint_every,
            max_key_bytes,
            sequential,
            fresh,
        } => {
            let config = IndexerConfig {
                file_path,
                output_dir,
                chunk_size,
                max_rows,
                backend,
                memory_threshold,
                max_working_entries,
                checkpoint_every,
                parallel: !sequential,
                max_key_bytes,
                fresh,
            };

            let mut pipeline = Pipeline::new(config)?;
            let should_stop = pipeline.stop_handle();
            let should_stop_clone = Arc::clone(&should_stop);
            ctrlc::set_handler(move || {
                warn!("received Ctrl+C, stopping after the current chunk");
                should_stop_clone.store(true, Ordering::SeqCst);
            })
            .map_err(|e| Error::Config(format!("cannot install Ctrl+C handler: {e}")))?;

            let summary = pipeline.run()?;

            println!("\nIndexing {}", if summary.stopped { "Interrupted" } else { "Complete" });
            println!("====================");
            println!("Entities:         {}", summary.entities);
            println!("Relations:        {}", summary.relations);
            println!("Triples written:  {}", summary.materialized_rows);
            println!("Dropped rows:     {}", summary.dropped_rows);
            println!("Malformed lines:  {}", summary.malformed_lines);
            println!("Skipped chunks:   {}", summary.skipped_chunks);
            println!("Peak memory:      {}", format_bytes(summary.peak_resident_bytes));
            println!("Memory spills:    {}", summary.spills);
            println!("Elapsed time:     {:.2}s", summary.elapsed.as_secs_f64());

            Ok(if summary.stopped { ExitCode::from(130) } else { ExitCode::SUCCESS })
        }

        Command::Export { output_dir, backend } => {
            let backend = match backend {
                Some(backend) => backend,
                None => Progress::load(&output_dir)?.map(|p| p.backend).unwrap_or_default(),
            };
            let summary = export_dir(&output_dir, backend)?;
            println!("Exported {} entities and {} relations", summary.entities, summary.relations);
            Ok(ExitCode::SUCCESS)
        }

        Command::Count { file_path, chunk_size, max_rows } => {
            let counts = count_triples(&file_path, chunk_size, max_rows)?;
            println!("Triples:          {}", counts.triples);
            println!("Unique entities:  {}", counts.unique_entities);
            println!("Unique relations: {}", counts.unique_relations);
            println!("Malformed lines:  {}", counts.malformed_lines);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    info!(version = env!("CARGO_PKG_VERSION"), "kg-indexer");

    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, fatal = err.is_fatal(), "run failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_requires_chunksize() {
        let err = Cli::try_parse_from(["kg-indexer", "index", "-f", "in.nt", "-o", "out"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = Cli::try_parse_from(["kg-indexer", "index", "-f", "in.nt", "-o", "out", "--chunksize", "500"])
            .unwrap();
        match cli.command {
            Command::Index { chunk_size, backend, sequential, .. } => {
                assert_eq!(chunk_size, 500);
                assert_eq!(backend, IndexBackend::Mmap);
                assert!(!sequential);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_count_keeps_default_chunksize() {
        let cli = Cli::try_parse_from(["kg-indexer", "count", "-f", "in.nt"]).unwrap();
        assert!(matches!(cli.command, Command::Count { chunk_size: 1_000_000, .. }));
    }
}
