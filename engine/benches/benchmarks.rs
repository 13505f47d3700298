//! Performance benchmarks for tandem-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tandem_engine::{
    reconcile_remote, CacheEntry, Candidate, ConflictResolver, Entity, Record, Schema, Stamp,
};

fn users(count: usize, offset_ms: i64) -> Vec<Record> {
    let schema = Schema::default();
    (0..count)
        .map(|i| {
            schema
                .parse(
                    Entity::Users,
                    json!({
                        "id": format!("user_{i}"),
                        "email": format!("user{i}@example.com"),
                        "name": "Test User",
                        "updated_at": 1_700_000_000_000i64 + offset_ms + i as i64,
                    }),
                )
                .unwrap()
        })
        .collect()
}

fn bench_schema(c: &mut Criterion) {
    let mut group = c.benchmark_group("schema");
    let schema = Schema::default();
    let row = json!({
        "id": "user_1",
        "email": "Test@Example.com",
        "name": "Test User",
        "updated_at": "2024-03-01T10:00:00.000Z",
    });

    group.bench_function("parse_user_row", |b| {
        b.iter(|| schema.parse(Entity::Users, black_box(row.clone())))
    });

    let entry = CacheEntry::clean(schema.parse(Entity::Users, row).unwrap(), Stamp::from_millis(0));
    let persisted = entry.to_json();
    let users_schema = schema.entity(Entity::Users).unwrap();

    group.bench_function("cache_entry_from_json", |b| {
        b.iter(|| CacheEntry::from_json(users_schema, black_box(persisted.clone())))
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for size in [10, 100, 1000] {
        let now = Stamp::from_millis(0);
        let candidates: Vec<Candidate> = users(size, 0)
            .into_iter()
            .map(|r| Candidate::from_collection(CacheEntry::clean(r, now)))
            .chain(
                users(size / 2, 5)
                    .into_iter()
                    .map(|r| Candidate::from_override(CacheEntry::clean(r, now))),
            )
            .collect();

        let id = BenchmarkId::new("collection_and_overrides", size);
        group.bench_with_input(id, &candidates, |b, candidates| {
            b.iter(|| ConflictResolver::merge(black_box(candidates.clone())))
        });
    }

    group.finish();
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_remote");
    let now = Stamp::from_millis(1_800_000_000_000);

    for size in [10, 100, 1000] {
        let remote = users(size, 0);
        let local: Vec<CacheEntry> = users(size / 10, -10)
            .into_iter()
            .map(|r| CacheEntry::dirty(r, Stamp::from_millis(1_700_000_000_000)))
            .collect();

        let id = BenchmarkId::new("with_dirty_entries", size);
        group.bench_with_input(id, &(remote, local), |b, (remote, local)| {
            b.iter(|| reconcile_remote(black_box(remote.clone()), black_box(local.clone()), now))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_schema, bench_merge, bench_reconcile);
criterion_main!(benches);
