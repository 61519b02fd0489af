//! Input parsing for whitespace-delimited triple files

pub mod triple_reader;

pub use triple_reader::TripleReader;
