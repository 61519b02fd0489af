use std::fmt::Write as _;
use std::fs;
use std::hint::black_box;
use std::path::Path;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use kg_indexer::core::Space;
use kg_indexer::indexing::SpaceIndexer;
use kg_indexer::storage::indexing::dictionary::HashOriginMap;
use kg_indexer::storage::indexing::{open_index, IndexBackend, KeyPolicy};
use kg_indexer::{IndexerConfig, Pipeline};
use tempfile::TempDir;

const NUMBER_TRIPLES: u64 = 20_000;

fn generate_input(path: &Path) {
    let mut content = String::new();
    for i in 0..NUMBER_TRIPLES {
        let subject = i % 1000;
        let predicate = i % 50;
        let object = i % 2000;
        let _ = writeln!(
            content,
            "<http://example.org/s{subject}> <http://example.org/p{predicate}> <http://example.org/o{object}> ."
        );
    }
    fs::write(path, content).expect("write benchmark input");
}

/// Unique values of one 10K chunk assigned against an empty space.
fn space_indexer_batch(c: &mut Criterion) {
    let values: Vec<String> = (0..10_000).map(|i| format!("<http://example.org/e{i}>")).collect();
    let refs: Vec<&str> = values.iter().map(String::as_str).collect();

    for backend in [IndexBackend::Mmap, IndexBackend::Sqlite] {
        c.bench_function(&format!("SpaceIndexer::index_batch + checkpoint - {backend}"), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().expect("tempdir");
                    let store = open_index(backend, dir.path(), Space::Entity, KeyPolicy::default())
                        .expect("open index");
                    let indexer = SpaceIndexer::new(Space::Entity, store, HashOriginMap::new())
                        .expect("indexer");
                    (dir, indexer)
                },
                |(dir, mut indexer)| {
                    black_box(indexer.index_batch(&refs, true).expect("index batch"));
                    indexer.checkpoint().expect("checkpoint");
                    drop(indexer);
                    drop(dir);
                },
                BatchSize::PerIteration,
            );
        });
    }
}

/// Both passes over a generated file.
fn full_pipeline(c: &mut Criterion) {
    let input_dir = TempDir::new().expect("tempdir");
    let input = input_dir.path().join("triples.nt");
    generate_input(&input);

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    for parallel in [true, false] {
        group.bench_function(format!("run - parallel={parallel}"), |b| {
            b.iter_batched(
                || TempDir::new().expect("tempdir"),
                |output| {
                    let config = IndexerConfig {
                        chunk_size: 5_000,
                        parallel,
                        ..IndexerConfig::new(&input, output.path())
                    };
                    let summary = Pipeline::new(config).expect("pipeline").run().expect("run");
                    assert_eq!(summary.materialized_rows, NUMBER_TRIPLES);
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, space_indexer_batch, full_pipeline);
criterion_main!(benches);
