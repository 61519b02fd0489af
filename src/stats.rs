//! Quick counts over a triple file without building any index.
//!
//! Unique values are kept in memory, so this is meant for inputs whose
//! vocabulary fits in RAM.

use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::parsing::TripleReader;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TripleCounts {
    pub triples: u64,
    pub chunks: u64,
    pub malformed_lines: u64,
    pub unique_entities: u64,
    pub unique_relations: u64,
}

pub fn count_triples(path: &Path, chunk_size: usize, max_rows: Option<u64>) -> Result<TripleCounts> {
    let started = Instant::now();
    let mut reader = TripleReader::open(path, chunk_size, max_rows)?;
    let mut entities: HashSet<String> = HashSet::new();
    let mut relations: HashSet<String> = HashSet::new();
    let mut counts = TripleCounts::default();

    for chunk in &mut reader {
        let chunk = chunk?;
        counts.triples += chunk.len() as u64;
        counts.chunks += 1;
        for value in chunk.unique_entities() {
            if !entities.contains(value) {
                entities.insert(value.to_string());
            }
        }
        for value in chunk.unique_relations() {
            if !relations.contains(value) {
                relations.insert(value.to_string());
            }
        }
        debug!(chunk = chunk.index, triples = counts.triples, "counted chunk");
    }

    counts.malformed_lines = reader.malformed();
    counts.unique_entities = entities.len() as u64;
    counts.unique_relations = relations.len() as u64;
    info!(
        path = %path.display(),
        triples = counts.triples,
        entities = counts.unique_entities,
        relations = counts.unique_relations,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "counted triples"
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_counts() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a p1 b .\nb p1 c .\nbroken line\na p2 c .").unwrap();

        let counts = count_triples(file.path(), 2, None).unwrap();
        assert_eq!(
            counts,
            TripleCounts { triples: 3, chunks: 2, malformed_lines: 1, unique_entities: 3, unique_relations: 2 }
        );
    }
}
