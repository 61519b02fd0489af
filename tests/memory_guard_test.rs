use kg_indexer::core::Space;
use kg_indexer::indexing::SpaceIndexer;
use kg_indexer::storage::indexing::dictionary::HashOriginMap;
use kg_indexer::storage::indexing::{open_index, IndexBackend, KeyPolicy};
use kg_indexer::storage::memory_guard::{MemoryGuard, MemoryProbe, MemorySample};
use tempfile::TempDir;

struct FixedProbe(MemorySample);

impl MemoryProbe for FixedProbe {
    fn sample(&self) -> MemorySample {
        self.0
    }
}

fn guard(used_percent: u64, max_working_entries: usize) -> MemoryGuard {
    let sample = MemorySample { resident_bytes: used_percent, total_bytes: 100 };
    MemoryGuard::new(Box::new(FixedProbe(sample)), 0.9, max_working_entries)
}

fn indexer(dir: &TempDir, backend: IndexBackend) -> SpaceIndexer {
    let store = open_index(backend, dir.path(), Space::Entity, KeyPolicy::default()).unwrap();
    SpaceIndexer::new(Space::Entity, store, HashOriginMap::new()).unwrap()
}

#[test]
fn test_spill_above_threshold_keeps_every_assignment() {
    for backend in [IndexBackend::Mmap, IndexBackend::Sqlite] {
        let dir = TempDir::new().unwrap();
        let mut space = indexer(&dir, backend);
        let mut guard = guard(95, 1_000_000);

        space.index_batch(&["ex:a", "ex:b", "ex:c"], true).unwrap();
        assert!(guard.check_and_maybe_flush(&mut space).unwrap());

        println!("{backend}: spilled {} entries", space.store().size().unwrap());
        assert_eq!(space.working_len(), 0);
        assert!(space.is_spilled());
        assert_eq!(space.store().size().unwrap(), space.next_id());

        // lookups after the spill go to the store
        assert_eq!(space.index_batch(&["ex:b", "ex:d"], false).unwrap(), 4);
        space.checkpoint().unwrap();
        assert_eq!(space.store().get("ex:b").unwrap(), 1);
        assert_eq!(space.store().get("ex:d").unwrap(), 3);
        assert_eq!(guard.stats().spills, 1);
    }
}

#[test]
fn test_no_spill_below_threshold() {
    let dir = TempDir::new().unwrap();
    let mut space = indexer(&dir, IndexBackend::Mmap);
    let mut guard = guard(50, 1_000_000);

    space.index_batch(&["ex:a"], true).unwrap();
    assert!(!guard.check_and_maybe_flush(&mut space).unwrap());
    assert_eq!(space.working_len(), 1);
    assert_eq!(space.store().size().unwrap(), 0);
    assert_eq!(space.logical_size().unwrap(), 1);
}

#[test]
fn test_entry_cap_forces_spill() {
    let dir = TempDir::new().unwrap();
    let mut space = indexer(&dir, IndexBackend::Mmap);
    let mut guard = guard(10, 2);

    space.index_batch(&["ex:a", "ex:b"], true).unwrap();
    assert!(!guard.check_and_maybe_flush(&mut space).unwrap());
    space.index_batch(&["ex:c"], false).unwrap();
    assert!(guard.check_and_maybe_flush(&mut space).unwrap());
    assert_eq!(space.store().size().unwrap(), 3);

    let stats = guard.stats();
    assert_eq!(stats.peak_bytes, 10);
    assert_eq!(stats.total_measurements, 2);
}
