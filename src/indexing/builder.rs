//! Identifier assignment for the indexing pass.
//!
//! A [`SpaceIndexer`] hands out dense identifiers for one space, keeping new
//! assignments in a [`WorkingDictionary`] until they are checkpointed into
//! the space's [`KeyValueIndex`]. The logical size of a space is the number
//! of keys in the index plus the pending assignments, and it must always
//! equal the next identifier to be handed out.

use std::thread;

use tracing::{debug, warn};

use crate::core::{digest, Chunk, Space};
use crate::error::{Error, Result};
use crate::storage::indexing::dictionary::{HashOriginMap, WorkingDictionary};
use crate::storage::indexing::KeyValueIndex;

pub struct SpaceIndexer {
    space: Space,
    store: Box<dyn KeyValueIndex>,
    working: WorkingDictionary,
    origins: HashOriginMap,
    next_id: u64,
    /// Set once the store may hold keys, so lookups must consult it
    spilled: bool,
}

impl SpaceIndexer {
    /// Wrap an opened index. Identifiers continue after the keys it already holds.
    pub fn new(space: Space, store: Box<dyn KeyValueIndex>, origins: HashOriginMap) -> Result<Self> {
        let next_id = store.size()?;
        Ok(Self {
            space,
            store,
            working: WorkingDictionary::new(),
            origins,
            next_id,
            spilled: next_id > 0,
        })
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }

    pub fn working_bytes(&self) -> usize {
        self.working.approx_bytes()
    }

    pub fn is_spilled(&self) -> bool {
        self.spilled
    }

    pub fn store(&self) -> &dyn KeyValueIndex {
        self.store.as_ref()
    }

    pub fn origins(&self) -> &HashOriginMap {
        &self.origins
    }

    pub fn origins_mut(&mut self) -> &mut HashOriginMap {
        &mut self.origins
    }

    /// Keys in the store plus pending assignments.
    pub fn logical_size(&self) -> Result<u64> {
        Ok(self.store.size()? + self.working.len() as u64)
    }

    fn stored_id(&self, key: &str) -> Result<Option<u64>> {
        if !self.spilled {
            return Ok(None);
        }
        match self.store.get(key) {
            Ok(id) => Ok(Some(id)),
            Err(Error::KeyNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn existing_id(&self, key: &str) -> Result<Option<u64>> {
        match self.working.get(key) {
            Some(id) => Ok(Some(id)),
            None => self.stored_id(key),
        }
    }

    fn assign(&mut self, key: String) -> u64 {
        let id = self.next_id;
        self.working.insert(key, id);
        self.next_id += 1;
        id
    }

    /// Assign identifiers to the unique `values` of one chunk, in order.
    ///
    /// With `is_first_batch` the store lookups are skipped, which is only
    /// sound while the space is empty; a non-empty space falls back to the
    /// checked path. Values the index cannot store as-is are keyed by their
    /// digest, which is recorded in the hash-origin map.
    ///
    /// Returns the updated next identifier.
    pub fn index_batch(&mut self, values: &[&str], is_first_batch: bool) -> Result<u64> {
        let fast_path = is_first_batch && self.next_id == 0 && self.logical_size()? == 0;
        if is_first_batch && !fast_path {
            warn!(space = %self.space, next_id = self.next_id, "first batch on a non-empty space, checking existence");
        }

        let policy = *self.store.policy();
        for &value in values {
            let digest_key = (!policy.accepts(value)).then(|| digest(value));
            let key = digest_key.as_deref().unwrap_or(value);

            // the fast path skips the store, but a digest key assigned
            // earlier in this batch can equal a raw value
            let id = if fast_path && digest_key.is_none() {
                match self.working.get(key) {
                    Some(id) => id,
                    None => self.assign(key.to_string()),
                }
            } else if let Some(id) = self.existing_id(key)? {
                id
            } else {
                self.assign(key.to_string())
            };

            if let Some(digest_key) = &digest_key {
                self.origins.record(digest_key, value, id);
            }
        }

        self.verify()?;
        debug!(space = %self.space, values = values.len(), next_id = self.next_id, "indexed batch");
        Ok(self.next_id)
    }

    /// Fail with [`Error::InvariantViolation`] when the logical size and the
    /// identifier counter disagree.
    pub fn verify(&self) -> Result<()> {
        let size = self.logical_size()?;
        if size != self.next_id {
            return Err(Error::InvariantViolation { space: self.space, size, next_id: self.next_id });
        }
        Ok(())
    }

    /// Write all pending assignments into the store and make them durable.
    pub fn checkpoint(&mut self) -> Result<()> {
        if !self.working.is_empty() {
            let pending = self.working.drain_ordered();
            let count = pending.len();
            self.store.put_all(&mut pending.into_iter())?;
            self.spilled = true;
            debug!(space = %self.space, count, "checkpointed working dictionary");
        }
        self.store.flush()?;
        self.verify()
    }
}

/// Counts reported for one indexed chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub unique_entities: usize,
    pub unique_relations: usize,
    pub new_entities: u64,
    pub new_relations: u64,
}

/// Indexes both spaces of each chunk, on two threads when `parallel` is set.
pub struct IndexBuilder {
    entities: SpaceIndexer,
    relations: SpaceIndexer,
    parallel: bool,
}

impl IndexBuilder {
    pub fn new(entities: SpaceIndexer, relations: SpaceIndexer, parallel: bool) -> Self {
        Self { entities, relations, parallel }
    }

    pub fn entities(&self) -> &SpaceIndexer {
        &self.entities
    }

    pub fn relations(&self) -> &SpaceIndexer {
        &self.relations
    }

    pub fn indexer_mut(&mut self, space: Space) -> &mut SpaceIndexer {
        match space {
            Space::Entity => &mut self.entities,
            Space::Relation => &mut self.relations,
        }
    }

    pub fn index_chunk(&mut self, chunk: &Chunk, is_first_batch: bool) -> Result<ChunkReport> {
        let unique_entities = chunk.unique_entities();
        let unique_relations = chunk.unique_relations();
        let entities_before = self.entities.next_id();
        let relations_before = self.relations.next_id();

        let Self { entities, relations, parallel } = self;
        let (entity_result, relation_result) = if *parallel {
            thread::scope(|scope| {
                let worker = scope.spawn(|| entities.index_batch(&unique_entities, is_first_batch));
                let relation_result = relations.index_batch(&unique_relations, is_first_batch);
                let entity_result =
                    worker.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload));
                (entity_result, relation_result)
            })
        } else {
            (
                entities.index_batch(&unique_entities, is_first_batch),
                relations.index_batch(&unique_relations, is_first_batch),
            )
        };

        let entities_after = entity_result?;
        let relations_after = relation_result?;
        Ok(ChunkReport {
            unique_entities: unique_entities.len(),
            unique_relations: unique_relations.len(),
            new_entities: entities_after - entities_before,
            new_relations: relations_after - relations_before,
        })
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.entities.checkpoint()?;
        self.relations.checkpoint()
    }
}
