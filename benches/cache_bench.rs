// Row cache hot-path benchmarks: promotion, cached reads, and the
// promote/evict cycle under pool pressure.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

use hotkv::{
    FieldType, IndexCursor, Indexer, IndexerList, RowBuffer, RowBufferOptions, SchemaField,
    SchemaId, SchemaRegistry, Timestamp, ValuePtr,
};

fn build_buffer(max_pages: usize) -> (Arc<RowBuffer>, Arc<Indexer>, SchemaId) {
    let registry = Arc::new(SchemaRegistry::new());
    let indexers = Arc::new(IndexerList::new());
    let schema = registry.create(
        "bench",
        0,
        vec![
            SchemaField::with_size(FieldType::String, "field1", 6),
            SchemaField::with_size(FieldType::String, "field2", 6),
        ],
    );
    let indexer = indexers.create(schema.id);
    let buffer = RowBuffer::new(
        RowBufferOptions {
            max_pages,
            retention: Duration::from_millis(1),
            ..Default::default()
        },
        indexers,
        registry,
    )
    .unwrap();
    (buffer, indexer, schema.id)
}

fn cursor_for(indexer: &Arc<Indexer>, key: u64) -> IndexCursor {
    indexer.insert(key, ValuePtr::cold(key, Timestamp::now()));
    indexer.cursor(key).unwrap()
}

fn bench_sync_write(c: &mut Criterion) {
    let (buffer, indexer, sid) = build_buffer(64);
    let mut key = 0u64;
    c.bench_function("sync_write_fresh_key", |b| {
        b.iter(|| {
            key += 1;
            let cursor = cursor_for(&indexer, key);
            let old_ts = cursor.value_ptr().timestamp();
            buffer
                .write(old_ts, Timestamp::now(), sid, b"abc123xyz789", &cursor)
                .unwrap();
        })
    });
}

fn bench_cached_read(c: &mut Criterion) {
    let (buffer, indexer, sid) = build_buffer(64);
    let cursor = cursor_for(&indexer, 1);
    let old_ts = cursor.value_ptr().timestamp();
    buffer
        .write(old_ts, Timestamp::now(), sid, b"abc123xyz789", &cursor)
        .unwrap();

    let vptr = cursor.value_ptr().clone();
    let mut out = Vec::new();
    c.bench_function("cached_read", |b| {
        b.iter(|| {
            let ts = vptr.timestamp();
            buffer
                .read(ts, Timestamp::now(), vptr.row_addr(), sid, &mut out, &vptr)
                .unwrap();
            black_box(&out);
        })
    });
}

fn bench_promote_evict_cycle(c: &mut Criterion) {
    let (buffer, indexer, sid) = build_buffer(64);
    let cursor = cursor_for(&indexer, 1);
    c.bench_function("promote_evict_cycle", |b| {
        b.iter(|| {
            let old_ts = cursor.value_ptr().timestamp();
            buffer
                .write(old_ts, Timestamp::now(), sid, b"abc123xyz789", &cursor)
                .unwrap();
            buffer.evict_row(&cursor).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_sync_write,
    bench_cached_read,
    bench_promote_evict_cycle
);
criterion_main!(benches);
