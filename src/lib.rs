//! # kg-indexer
//!
//! Memory-bounded, resumable indexing of very large RDF triple files.
//!
//! Every unique entity (subject or object) and every unique relation gets a
//! dense integer identifier, assigned in order of first appearance and kept
//! in a persistent key-value index per identifier space. A second pass turns
//! the input into an `(n, 3)` integer array, `train_set.npy`, ready for
//! knowledge-graph embedding training.
//!
//! ## Features
//!
//! - Chunked streaming with bounded memory: pending assignments spill to disk
//!   when the process nears its memory ceiling
//! - Two interchangeable index backends, memory-mapped files or SQLite
//! - Values the backend cannot store as keys are indexed by their SHA-256
//!   digest, with the original kept on the side
//! - Crash-safe resume at chunk granularity through `progress.json`
//!
//! ## Example
//!
//! ```rust,no_run
//! use kg_indexer::{IndexerConfig, Pipeline, Result};
//!
//! fn example() -> Result<()> {
//!     let config = IndexerConfig::new("triples.nt", "output");
//!     let summary = Pipeline::new(config)?.run()?;
//!     println!("{} entities, {} relations", summary.entities, summary.relations);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::new_without_default)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_closure_for_method_calls)]

/// Core data structures and types
pub mod core;

/// Run configuration
pub mod config;

pub mod error;

/// Human-readable exports and run metadata
pub mod export;

/// Identifier assignment and materialization
pub mod indexing;

/// Triple file reading
pub mod parsing;

pub mod pipeline;

pub mod stats;

pub mod storage;

// Re-export commonly used types
pub use config::IndexerConfig;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, RunSummary};
pub use storage::indexing::{IndexBackend, KeyValueIndex};
