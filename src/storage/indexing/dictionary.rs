//! In-memory side of the indexes: assignments waiting for the next
//! checkpoint, and the map from digest keys back to the values they replace.
//!
//! The hash-origin map of both spaces is saved as one bincode file next to
//! the indexes so exported mappings and materialization can recover the
//! original strings.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use atomic_write_file::AtomicWriteFile;
use serde::{Deserialize, Serialize};

use crate::core::Space;
use crate::error::{Error, Result};

/// File holding the digest → original mappings of both spaces.
pub const HASH_ORIGIN_FILE: &str = "hash_value_mapping.bin";

/// Pending `key -> id` assignments that have not reached the persistent
/// index yet.
#[derive(Debug, Default)]
pub struct WorkingDictionary {
    string_to_id: HashMap<String, u64>,
    key_bytes: usize,
}

impl WorkingDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.string_to_id.get(key).copied()
    }

    pub fn insert(&mut self, key: String, id: u64) {
        let len = key.len();
        if self.string_to_id.insert(key, id).is_none() {
            self.key_bytes += len;
        }
    }

    pub fn len(&self) -> usize {
        self.string_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.string_to_id.is_empty()
    }

    /// Rough heap footprint: key bytes plus per-entry map overhead.
    pub fn approx_bytes(&self) -> usize {
        const ENTRY_OVERHEAD: usize = std::mem::size_of::<String>() + std::mem::size_of::<u64>() + 8;
        self.key_bytes + self.string_to_id.capacity() * ENTRY_OVERHEAD
    }

    /// Take every pending entry in identifier order, leaving the dictionary
    /// empty but with its allocation intact.
    pub fn drain_ordered(&mut self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self.string_to_id.drain().collect();
        entries.sort_unstable_by_key(|(_, id)| *id);
        self.key_bytes = 0;
        entries
    }
}

/// Original string behind a digest key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashOrigin {
    pub digest: String,
    pub original: String,
    pub id: u64,
}

/// Digest → original mapping of one space. Only values whose raw form the
/// index refused end up here.
#[derive(Debug, Default, Clone)]
pub struct HashOriginMap {
    by_digest: HashMap<String, HashOrigin>,
    dirty: bool,
}

impl HashOriginMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, digest: &str, original: &str, id: u64) {
        if self.by_digest.get(digest).is_some_and(|origin| origin.id == id) {
            return;
        }
        self.by_digest.insert(
            digest.to_string(),
            HashOrigin { digest: digest.to_string(), original: original.to_string(), id },
        );
        self.dirty = true;
    }

    pub fn original(&self, digest: &str) -> Option<&str> {
        self.by_digest.get(digest).map(|origin| origin.original.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }

    /// Whether entries were recorded since the map was last loaded or saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    /// Entries sorted by assigned identifier.
    pub fn sorted(&self) -> Vec<HashOrigin> {
        let mut origins: Vec<HashOrigin> = self.by_digest.values().cloned().collect();
        origins.sort_unstable_by_key(|origin| origin.id);
        origins
    }

    fn from_sorted(origins: Vec<HashOrigin>) -> Self {
        let by_digest = origins.into_iter().map(|origin| (origin.digest.clone(), origin)).collect();
        Self { by_digest, dirty: false }
    }
}

/// On-disk form of [`HashOriginMap`]s for both spaces.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HashOriginFile {
    pub entities: Vec<HashOrigin>,
    pub relations: Vec<HashOrigin>,
}

impl HashOriginFile {
    pub fn new(entities: &HashOriginMap, relations: &HashOriginMap) -> Self {
        Self { entities: entities.sorted(), relations: relations.sorted() }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut file = AtomicWriteFile::options().open(path)?;
        {
            let mut writer = BufWriter::new(&mut file);
            bincode::serialize_into(&mut writer, self)?;
            writer.flush()?;
        }
        file.commit()?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|err| Error::CorruptIndex {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    /// Load the file in `dir`, or empty maps when it does not exist yet.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(HASH_ORIGIN_FILE);
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn into_maps(self) -> (HashOriginMap, HashOriginMap) {
        (HashOriginMap::from_sorted(self.entities), HashOriginMap::from_sorted(self.relations))
    }

    pub fn space(&self, space: Space) -> &[HashOrigin] {
        match space {
            Space::Entity => &self.entities,
            Space::Relation => &self.relations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_working_dictionary_drains_in_id_order() {
        let mut dict = WorkingDictionary::new();
        dict.insert("ex:c".to_string(), 2);
        dict.insert("ex:a".to_string(), 0);
        dict.insert("ex:b".to_string(), 1);
        assert_eq!(dict.get("ex:b"), Some(1));
        assert!(dict.approx_bytes() > 0);

        let drained = dict.drain_ordered();
        assert_eq!(drained.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(dict.is_empty());
        assert_eq!(dict.get("ex:a"), None);
    }

    #[test]
    fn test_hash_origins_persist_sorted_by_id() {
        let dir = TempDir::new().unwrap();
        let mut entities = HashOriginMap::new();
        entities.record("d2", "second", 7);
        entities.record("d1", "first", 3);
        let relations = HashOriginMap::new();
        assert!(entities.is_dirty());

        HashOriginFile::new(&entities, &relations).save_to_file(&dir.path().join(HASH_ORIGIN_FILE)).unwrap();
        let loaded = HashOriginFile::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.entities.iter().map(|o| o.id).collect::<Vec<_>>(), vec![3, 7]);
        assert!(loaded.space(Space::Relation).is_empty());

        let (entities, _) = loaded.into_maps();
        assert_eq!(entities.original("d2"), Some("second"));
        assert!(!entities.is_dirty());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = HashOriginFile::load_or_default(dir.path()).unwrap();
        assert!(loaded.entities.is_empty());
    }
}
