//! Second pass: turn each chunk of string triples into identifier triples.

use tracing::warn;

use crate::core::{Chunk, IndexedTriple};
use crate::error::{Error, Result};
use crate::storage::indexing::dictionary::HashOrigin;
use crate::storage::indexing::sqlite::TransformedTable;
use crate::storage::indexing::KeyValueIndex;
use crate::storage::train_set::TrainSetWriter;

/// Originals of digest keys, sorted so they can be binary searched.
#[derive(Debug, Default)]
pub struct DigestTable {
    entries: Vec<(String, String)>,
}

impl DigestTable {
    pub fn new(origins: &[HashOrigin]) -> Self {
        let mut entries: Vec<(String, String)> =
            origins.iter().map(|origin| (origin.original.clone(), origin.digest.clone())).collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Self { entries }
    }

    /// Digest key stored for `original`, if it went through the fallback.
    pub fn lookup(&self, original: &str) -> Option<&str> {
        self.entries
            .binary_search_by(|(candidate, _)| candidate.as_str().cmp(original))
            .ok()
            .map(|pos| self.entries[pos].1.as_str())
    }
}

/// Identifier lookup for one space: direct key first, digest key second.
pub struct SpaceResolver<'a> {
    store: &'a dyn KeyValueIndex,
    digests: DigestTable,
}

impl<'a> SpaceResolver<'a> {
    pub fn new(store: &'a dyn KeyValueIndex, origins: &[HashOrigin]) -> Self {
        Self { store, digests: DigestTable::new(origins) }
    }

    pub fn resolve(&self, value: &str) -> Result<Option<u64>> {
        match self.store.get(value) {
            Ok(id) => return Ok(Some(id)),
            Err(Error::KeyNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let Some(digest) = self.digests.lookup(value) else {
            return Ok(None);
        };
        match self.store.get(digest) {
            Ok(id) => Ok(Some(id)),
            Err(Error::KeyNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Rows produced from one chunk.
#[derive(Debug, Default)]
pub struct MaterializedChunk {
    pub rows: Vec<IndexedTriple>,
    /// Rows with at least one value missing from the indexes
    pub dropped: u64,
}

pub struct Materializer<'a> {
    entities: SpaceResolver<'a>,
    relations: SpaceResolver<'a>,
}

impl<'a> Materializer<'a> {
    pub fn new(entities: SpaceResolver<'a>, relations: SpaceResolver<'a>) -> Self {
        Self { entities, relations }
    }

    pub fn materialize_chunk(&self, chunk: &Chunk) -> Result<MaterializedChunk> {
        let mut out = MaterializedChunk { rows: Vec::with_capacity(chunk.len()), dropped: 0 };

        for row in 0..chunk.len() {
            let (subject, relation, object) = (&chunk.subjects[row], &chunk.relations[row], &chunk.objects[row]);
            let resolved = (
                self.entities.resolve(subject)?,
                self.relations.resolve(relation)?,
                self.entities.resolve(object)?,
            );
            match resolved {
                (Some(s), Some(r), Some(o)) => out.rows.push(IndexedTriple::new(s, r, o)),
                (s, r, o) => {
                    warn!(
                        chunk = chunk.index,
                        row,
                        subject = %subject,
                        relation = %relation,
                        object = %object,
                        subject_found = s.is_some(),
                        relation_found = r.is_some(),
                        object_found = o.is_some(),
                        "dropping row with unresolved values"
                    );
                    out.dropped += 1;
                }
            }
        }
        Ok(out)
    }
}

/// Destination of materialized rows.
pub trait TripleSink {
    /// Append the rows of one chunk and make them durable.
    fn append(&mut self, rows: &[IndexedTriple]) -> Result<()>;

    /// Rows held by the sink so far.
    fn rows_written(&self) -> Result<u64>;
}

impl TripleSink for TrainSetWriter {
    fn append(&mut self, rows: &[IndexedTriple]) -> Result<()> {
        TrainSetWriter::append(self, rows)
    }

    fn rows_written(&self) -> Result<u64> {
        Ok(self.len())
    }
}

impl TripleSink for TransformedTable {
    fn append(&mut self, rows: &[IndexedTriple]) -> Result<()> {
        TransformedTable::append(self, rows)
    }

    fn rows_written(&self) -> Result<u64> {
        self.row_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest;
    use crate::storage::indexing::mmap::MmapIndex;
    use crate::storage::indexing::KeyPolicy;
    use tempfile::TempDir;

    #[test]
    fn test_digest_table_lookup() {
        let origins = vec![
            HashOrigin { digest: "d-b".to_string(), original: "b".to_string(), id: 0 },
            HashOrigin { digest: "d-a".to_string(), original: "a".to_string(), id: 1 },
        ];
        let table = DigestTable::new(&origins);
        assert_eq!(table.lookup("a"), Some("d-a"));
        assert_eq!(table.lookup("c"), None);
    }

    #[test]
    fn test_unresolved_rows_are_dropped() {
        let dir = TempDir::new().unwrap();
        let mut entities = MmapIndex::open(dir.path(), "entities", KeyPolicy { max_key_bytes: 70 }).unwrap();
        let mut relations = MmapIndex::open(dir.path(), "relations", KeyPolicy::default()).unwrap();
        let long = "y".repeat(80);
        entities.put("a", 0).unwrap();
        entities.put(&digest(&long), 1).unwrap();
        relations.put("p", 0).unwrap();

        let origins = vec![HashOrigin { digest: digest(&long), original: long.clone(), id: 1 }];
        let materializer = Materializer::new(
            SpaceResolver::new(&entities, &origins),
            SpaceResolver::new(&relations, &[]),
        );

        let mut chunk = Chunk::default();
        chunk.push("a", "p", &long);
        chunk.push("a", "q", "a");
        let out = materializer.materialize_chunk(&chunk).unwrap();
        assert_eq!(out.rows, vec![IndexedTriple::new(0, 0, 1)]);
        assert_eq!(out.dropped, 1);
    }
}
