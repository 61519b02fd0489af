use kg_indexer::core::{digest, Space};
use kg_indexer::storage::indexing::dictionary::{HashOriginFile, HashOriginMap, HASH_ORIGIN_FILE};
use kg_indexer::storage::indexing::{open_index, IndexBackend, KeyPolicy, PutOutcome};
use tempfile::TempDir;

#[test]
fn test_index_round_trip_with_digest_keys() {
    for backend in [IndexBackend::Mmap, IndexBackend::Sqlite] {
        let dir = TempDir::new().unwrap();
        let policy = KeyPolicy { max_key_bytes: 80 };
        let mut index = open_index(backend, dir.path(), Space::Entity, policy).unwrap();
        let mut origins = HashOriginMap::new();

        let values = [
            "http://example.org/person/Alice".to_string(),
            "http://example.org/person/Bob".to_string(),
            format!("\"{}\"@en", "a long abstract ".repeat(10).replace(' ', "_")),
        ];

        for (id, value) in values.iter().enumerate() {
            let id = id as u64;
            match index.put(value, id).unwrap() {
                PutOutcome::Inserted => {}
                PutOutcome::RejectedKey => {
                    let key = digest(value);
                    assert_eq!(index.put(&key, id).unwrap(), PutOutcome::Inserted);
                    origins.record(&key, value, id);
                }
                PutOutcome::AlreadyPresent => panic!("{value} inserted twice"),
            }
        }
        index.flush().unwrap();

        println!("{backend}: {} keys, {} through digest", index.size().unwrap(), origins.len());
        assert_eq!(index.size().unwrap(), 3);
        assert_eq!(origins.len(), 1);

        // resolve every id back to its original string
        let resolved: Vec<String> = index
            .entries()
            .unwrap()
            .into_iter()
            .map(|(key, _)| origins.original(&key).map_or(key.clone(), str::to_string))
            .collect();
        assert_eq!(resolved, values);
    }
}

#[test]
fn test_put_is_idempotent_and_overwrites() {
    let dir = TempDir::new().unwrap();
    let mut index = open_index(IndexBackend::Mmap, dir.path(), Space::Relation, KeyPolicy::default()).unwrap();

    assert_eq!(index.put("http://example.org/knows", 0).unwrap(), PutOutcome::Inserted);
    assert_eq!(index.put("http://example.org/knows", 0).unwrap(), PutOutcome::AlreadyPresent);
    assert_eq!(index.put("http://example.org/knows", 5).unwrap(), PutOutcome::AlreadyPresent);
    assert_eq!(index.get("http://example.org/knows").unwrap(), 5);
    assert_eq!(index.size().unwrap(), 1);
}

#[test]
fn test_hash_origin_file_holds_both_spaces() {
    let dir = TempDir::new().unwrap();
    let mut entities = HashOriginMap::new();
    let mut relations = HashOriginMap::new();
    entities.record(&digest("e"), "e", 4);
    relations.record(&digest("r"), "r", 1);

    HashOriginFile::new(&entities, &relations).save_to_file(&dir.path().join(HASH_ORIGIN_FILE)).unwrap();
    let (entities, relations) = HashOriginFile::load_or_default(dir.path()).unwrap().into_maps();
    assert_eq!(entities.original(&digest("e")), Some("e"));
    assert_eq!(relations.original(&digest("r")), Some("r"));
    assert_eq!(relations.original(&digest("e")), None);
}
