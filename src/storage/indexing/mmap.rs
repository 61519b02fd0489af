//! Memory-mapped persistent dictionary.
//!
//! ## Files
//!
//! **Slot table** (`<name>.slots`):
//! ```text
//! magic: "KGIXSLT1" (8B)
//! capacity: u64        power of two
//! len: u64             occupied slots
//! clean: u64           1 after a flush, 0 while writes are pending
//! reserved (32B)
//! slots: [hash: u64, key_offset: u64, key_len: u64, value: u64] x capacity
//! ```
//!
//! **Key heap** (`<name>.keys`):
//! ```text
//! magic: "KGIXKEY1" (8B)
//! used: u64            bytes in use, header included
//! key bytes, concatenated
//! ```
//!
//! Slots use linear probing on an xxh3 hash. An empty slot has `key_len == 0`
//! (empty keys are never stored). Both files grow by doubling.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::{KeyPolicy, KeyValueIndex, PutOutcome};
use crate::error::{Error, Result};

const SLOTS_MAGIC: [u8; 8] = *b"KGIXSLT1";
const KEYS_MAGIC: [u8; 8] = *b"KGIXKEY1";

const TABLE_HEADER: usize = 64;
const SLOT_SIZE: usize = 32;
const KEYS_HEADER: u64 = 16;

const INITIAL_CAPACITY: u64 = 1 << 16;
const INITIAL_HEAP_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone, Copy)]
struct Slot {
    hash: u64,
    key_offset: u64,
    key_len: u64,
    value: u64,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.key_len == 0
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn slot_at(slot: u64) -> usize {
    TABLE_HEADER + slot as usize * SLOT_SIZE
}

fn read_slot(table: &[u8], slot: u64) -> Slot {
    let at = slot_at(slot);
    Slot {
        hash: read_u64(table, at),
        key_offset: read_u64(table, at + 8),
        key_len: read_u64(table, at + 16),
        value: read_u64(table, at + 24),
    }
}

fn write_slot(table: &mut [u8], slot: u64, entry: Slot) {
    let at = slot_at(slot);
    write_u64(table, at, entry.hash);
    write_u64(table, at + 8, entry.key_offset);
    write_u64(table, at + 16, entry.key_len);
    write_u64(table, at + 24, entry.value);
}

fn table_len(capacity: u64) -> u64 {
    TABLE_HEADER as u64 + capacity * SLOT_SIZE as u64
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)
}

fn map(file: &File) -> io::Result<MmapMut> {
    // Safety: the files are owned by this index for the whole run; nothing else
    // resizes or writes them while the mapping is alive.
    unsafe { MmapMut::map_mut(file) }
}

/// Persistent `key -> id` dictionary backed by two memory-mapped files.
pub struct MmapIndex {
    slots_path: PathBuf,
    slots_file: File,
    keys_file: File,
    slots: MmapMut,
    keys: MmapMut,
    capacity: u64,
    len: u64,
    keys_used: u64,
    dirty: bool,
    policy: KeyPolicy,
}

impl MmapIndex {
    /// Paths of the files backing the index `name` in `dir`.
    pub fn files(dir: &Path, name: &str) -> [PathBuf; 2] {
        [dir.join(format!("{name}.slots")), dir.join(format!("{name}.keys"))]
    }

    pub fn open(dir: &Path, name: &str, policy: KeyPolicy) -> Result<Self> {
        let [slots_path, keys_path] = Self::files(dir, name);
        let slots_file = open_rw(&slots_path)?;
        let keys_file = open_rw(&keys_path)?;

        let fresh = slots_file.metadata()?.len() == 0;
        if fresh {
            slots_file.set_len(table_len(INITIAL_CAPACITY))?;
            keys_file.set_len(INITIAL_HEAP_BYTES)?;
        }

        let corrupt = |path: &Path, reason: &str| Error::CorruptIndex {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut slots = map(&slots_file)?;
        if fresh {
            slots[0..8].copy_from_slice(&SLOTS_MAGIC);
            write_u64(&mut slots, 8, INITIAL_CAPACITY);
            write_u64(&mut slots, 16, 0);
            write_u64(&mut slots, 24, 1);
            slots.flush()?;
        }
        if slots.len() < TABLE_HEADER || slots[0..8] != SLOTS_MAGIC {
            return Err(corrupt(&slots_path, "invalid slot table magic"));
        }

        if keys_file.metadata()?.len() < KEYS_HEADER {
            return Err(corrupt(&keys_path, "key heap is missing or truncated"));
        }
        let mut keys = map(&keys_file)?;
        if fresh {
            keys[0..8].copy_from_slice(&KEYS_MAGIC);
            write_u64(&mut keys, 8, KEYS_HEADER);
            keys.flush()?;
        }
        if keys[0..8] != KEYS_MAGIC {
            return Err(corrupt(&keys_path, "invalid key heap magic"));
        }

        let capacity = read_u64(&slots, 8);
        if !capacity.is_power_of_two() || table_len(capacity) != slots.len() as u64 {
            return Err(corrupt(&slots_path, "slot table size does not match its capacity"));
        }

        let mut index = Self {
            slots_path,
            slots_file,
            keys_file,
            len: read_u64(&slots, 16),
            keys_used: read_u64(&keys, 8),
            dirty: read_u64(&slots, 24) != 1,
            slots,
            keys,
            capacity,
            policy,
        };

        if index.dirty {
            index.recover()?;
        }

        debug!(name, len = index.len, capacity = index.capacity, "opened mmap index");
        Ok(index)
    }

    /// Recompute the counters after an unclean shutdown.
    fn recover(&mut self) -> Result<()> {
        let mut len = 0;
        let mut keys_used = KEYS_HEADER;
        for i in 0..self.capacity {
            let slot = read_slot(&self.slots, i);
            if !slot.is_empty() {
                len += 1;
                keys_used = keys_used.max(slot.key_offset + slot.key_len);
            }
        }
        if keys_used > self.keys.len() as u64 {
            return Err(Error::CorruptIndex {
                path: self.slots_path.clone(),
                reason: "slot points past the end of the key heap".to_string(),
            });
        }
        warn!(
            path = %self.slots_path.display(),
            recorded = self.len,
            recovered = len,
            "index was not flushed cleanly, recounted its entries"
        );
        self.len = len;
        self.keys_used = keys_used;
        self.flush()
    }

    fn key_bytes(&self, slot: &Slot) -> &[u8] {
        let start = slot.key_offset as usize;
        &self.keys[start..start + slot.key_len as usize]
    }

    /// Slot holding `key`, or the empty slot where it would go.
    fn probe(&self, hash: u64, key: &[u8]) -> (u64, Option<Slot>) {
        let mask = self.capacity - 1;
        let mut i = hash & mask;
        loop {
            let slot = read_slot(&self.slots, i);
            if slot.is_empty() {
                return (i, None);
            }
            if slot.hash == hash
                && slot.key_len == key.len() as u64
                && self.key_bytes(&slot) == key
            {
                return (i, Some(slot));
            }
            i = (i + 1) & mask;
        }
    }

    fn mark_dirty(&mut self) {
        if !self.dirty {
            write_u64(&mut self.slots, 24, 0);
            self.dirty = true;
        }
    }

    fn append_key(&mut self, key: &[u8]) -> io::Result<u64> {
        let needed = self.keys_used + key.len() as u64;
        if needed > self.keys.len() as u64 {
            let new_len = (self.keys.len() as u64 * 2).max(needed);
            self.keys.flush()?;
            self.keys_file.set_len(new_len)?;
            self.keys = map(&self.keys_file)?;
        }
        let offset = self.keys_used;
        self.keys[offset as usize..needed as usize].copy_from_slice(key);
        self.keys_used = needed;
        write_u64(&mut self.keys, 8, needed);
        Ok(offset)
    }

    /// Double the slot table, rehashing into a fresh file that replaces the old one.
    fn grow_table(&mut self) -> io::Result<()> {
        let new_capacity = self.capacity * 2;
        let tmp_path = self.slots_path.with_extension("slots.tmp");
        let tmp_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp_file.set_len(table_len(new_capacity))?;
        let mut table = map(&tmp_file)?;

        table[0..8].copy_from_slice(&SLOTS_MAGIC);
        write_u64(&mut table, 8, new_capacity);
        write_u64(&mut table, 16, self.len);
        write_u64(&mut table, 24, 0);

        let mask = new_capacity - 1;
        for i in 0..self.capacity {
            let slot = read_slot(&self.slots, i);
            if slot.is_empty() {
                continue;
            }
            let mut j = slot.hash & mask;
            while !read_slot(&table, j).is_empty() {
                j = (j + 1) & mask;
            }
            write_slot(&mut table, j, slot);
        }
        table.flush()?;

        self.slots = table;
        self.slots_file = tmp_file;
        fs::rename(&tmp_path, &self.slots_path)?;
        self.capacity = new_capacity;
        self.dirty = true;

        debug!(path = %self.slots_path.display(), capacity = new_capacity, "grew slot table");
        Ok(())
    }

    fn insert(&mut self, key: &str, value: u64) -> io::Result<PutOutcome> {
        let bytes = key.as_bytes();
        let hash = xxh3_64(bytes);
        self.mark_dirty();

        if let (i, Some(mut slot)) = self.probe(hash, bytes) {
            if slot.value != value {
                slot.value = value;
                write_slot(&mut self.slots, i, slot);
            }
            return Ok(PutOutcome::AlreadyPresent);
        }

        // keep the load factor under 0.7
        if (self.len + 1) * 10 > self.capacity * 7 {
            self.grow_table()?;
        }
        let (i, _) = self.probe(hash, bytes);
        let key_offset = self.append_key(bytes)?;
        write_slot(
            &mut self.slots,
            i,
            Slot { hash, key_offset, key_len: bytes.len() as u64, value },
        );
        self.len += 1;
        write_u64(&mut self.slots, 16, self.len);
        Ok(PutOutcome::Inserted)
    }

    fn lookup(&self, key: &str) -> Option<u64> {
        if key.is_empty() {
            return None;
        }
        let bytes = key.as_bytes();
        self.probe(xxh3_64(bytes), bytes).1.map(|slot| slot.value)
    }
}

impl KeyValueIndex for MmapIndex {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lookup(key).is_some())
    }

    fn get(&self, key: &str) -> Result<u64> {
        self.lookup(key).ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    fn put(&mut self, key: &str, value: u64) -> Result<PutOutcome> {
        if !self.policy.accepts(key) {
            return Ok(PutOutcome::RejectedKey);
        }
        self.insert(key, value).map_err(|e| Error::storage(key, e))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn flush(&mut self) -> Result<()> {
        write_u64(&mut self.slots, 16, self.len);
        write_u64(&mut self.keys, 8, self.keys_used);
        self.keys.flush()?;
        self.slots.flush()?;
        // the clean marker goes out only after the data it vouches for
        write_u64(&mut self.slots, 24, 1);
        self.slots.flush_range(0, TABLE_HEADER)?;
        self.dirty = false;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, u64)>> {
        let mut entries = Vec::with_capacity(self.len as usize);
        for i in 0..self.capacity {
            let slot = read_slot(&self.slots, i);
            if slot.is_empty() {
                continue;
            }
            let key = std::str::from_utf8(self.key_bytes(&slot)).map_err(|e| {
                Error::CorruptIndex { path: self.slots_path.clone(), reason: e.to_string() }
            })?;
            entries.push((key.to_string(), slot.value));
        }
        entries.sort_by_key(|(_, id)| *id);
        Ok(entries)
    }

    fn policy(&self) -> &KeyPolicy {
        &self.policy
    }
}

impl Drop for MmapIndex {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                warn!(path = %self.slots_path.display(), error = %e, "failed to flush index on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_contains() {
        let dir = TempDir::new().unwrap();
        let mut index = MmapIndex::open(dir.path(), "entities", KeyPolicy::default()).unwrap();

        assert_eq!(index.put("<ex:a>", 0).unwrap(), PutOutcome::Inserted);
        assert_eq!(index.put("<ex:a>", 0).unwrap(), PutOutcome::AlreadyPresent);
        assert!(index.contains("<ex:a>").unwrap());
        assert!(!index.contains("<ex:b>").unwrap());
        assert_eq!(index.get("<ex:a>").unwrap(), 0);
        assert!(matches!(index.get("<ex:b>"), Err(Error::KeyNotFound(_))));
        assert_eq!(index.size().unwrap(), 1);
    }

    #[test]
    fn test_rejects_keys_outside_policy() {
        let dir = TempDir::new().unwrap();
        let mut index =
            MmapIndex::open(dir.path(), "entities", KeyPolicy { max_key_bytes: 4 }).unwrap();
        assert_eq!(index.put("<ex:long>", 0).unwrap(), PutOutcome::RejectedKey);
        assert_eq!(index.size().unwrap(), 0);
    }

    #[test]
    fn test_grows_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let count = INITIAL_CAPACITY + 10;
        {
            let mut index = MmapIndex::open(dir.path(), "entities", KeyPolicy::default()).unwrap();
            for i in 0..count {
                index.put(&format!("<ex:e{i}>"), i).unwrap();
            }
            index.flush().unwrap();
        }

        let index = MmapIndex::open(dir.path(), "entities", KeyPolicy::default()).unwrap();
        assert_eq!(index.size().unwrap(), count);
        assert_eq!(index.get("<ex:e0>").unwrap(), 0);
        assert_eq!(index.get(&format!("<ex:e{}>", count - 1)).unwrap(), count - 1);

        let entries = index.entries().unwrap();
        assert_eq!(entries.len() as u64, count);
        assert!(entries.windows(2).all(|w| w[0].1 < w[1].1));
    }

    fn overwrite_u64(path: &Path, at: u64, value: u64) {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(at)).unwrap();
        file.write_all(&value.to_le_bytes()).unwrap();
    }

    #[test]
    fn test_unclean_shutdown_recounts_entries() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = MmapIndex::open(dir.path(), "entities", KeyPolicy::default()).unwrap();
            for (i, key) in ["<ex:a>", "<ex:b>", "<ex:c>"].iter().enumerate() {
                index.put(key, i as u64).unwrap();
            }
            index.flush().unwrap();
        }

        // stale counters and a cleared clean marker, as left by a crash mid-write
        let [slots, keys] = MmapIndex::files(dir.path(), "entities");
        overwrite_u64(&slots, 16, 1);
        overwrite_u64(&slots, 24, 0);
        overwrite_u64(&keys, 8, KEYS_HEADER);

        {
            let mut index = MmapIndex::open(dir.path(), "entities", KeyPolicy::default()).unwrap();
            assert_eq!(index.size().unwrap(), 3);
            assert_eq!(index.get("<ex:c>").unwrap(), 2);

            assert_eq!(index.put("<ex:d>", 3).unwrap(), PutOutcome::Inserted);
            assert_eq!(index.get("<ex:a>").unwrap(), 0);
            index.flush().unwrap();
        }

        let index = MmapIndex::open(dir.path(), "entities", KeyPolicy::default()).unwrap();
        assert_eq!(index.size().unwrap(), 4);
        let keys: Vec<String> = index.entries().unwrap().into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["<ex:a>", "<ex:b>", "<ex:c>", "<ex:d>"]);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let [slots, _] = MmapIndex::files(dir.path(), "relations");
        std::fs::write(&slots, vec![7u8; 128]).unwrap();
        let err = MmapIndex::open(dir.path(), "relations", KeyPolicy::default()).err().unwrap();
        assert!(matches!(err, Error::CorruptIndex { .. }));
    }
}
