//! The two passes over the input: identifier assignment and materialization.

pub mod builder;
pub mod materializer;

pub use builder::{IndexBuilder, SpaceIndexer};
pub use materializer::{Materializer, TripleSink};
