//! Benchmark for the TTL reduction step search

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mongo_migrator::config::MigrationOptions;
use mongo_migrator::migrations::ttl_collection::TtlCollection;
use mongo_migrator::store::memory::MemoryStore;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn reducer(batch_size: u64) -> TtlCollection {
    TtlCollection::new(&MigrationOptions {
        database: "bench".to_string(),
        collection: Some("events".to_string()),
        batch_size: Some(batch_size),
        env: [
            ("GOAL_TTL", "1h"),
            ("TTL_DECREMENT", "10m"),
            ("TTL_FIELD", "ts"),
        ]
        .into_iter()
        .collect(),
    })
    .expect("valid benchmark options")
}

fn bench_next_ttl(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let cancel = CancellationToken::new();

    let mut group = c.benchmark_group("next_ttl");
    for docs in [1_000usize, 10_000] {
        // One document per minute going back from `now`.
        let store = MemoryStore::new("events")
            .with_documents((0..docs as i64).map(|i| now - Duration::minutes(i + 1)));

        group.throughput(Throughput::Elements(docs as u64));
        for batch_size in [100u64, 1_000_000] {
            let job = reducer(batch_size);
            group.bench_with_input(
                BenchmarkId::new(format!("batch_{}", batch_size), docs),
                &docs,
                |b, _| {
                    b.iter(|| {
                        rt.block_on(async {
                            black_box(job.next_ttl(&store, black_box(now), &cancel).await.unwrap())
                        })
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_next_ttl);
criterion_main!(benches);
