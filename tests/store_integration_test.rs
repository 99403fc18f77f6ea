// End-to-end store tests: promote-on-miss, overwrite and update
// invalidation, removal, scans, and cache-less operation.

use rand::seq::SliceRandom;

use hotkv::{
    Error, FieldType, RowBufferOptions, SchemaField, SchemaId, Store, StoreOptions, ValueLogOptions,
};

fn pair_fields() -> Vec<SchemaField> {
    vec![
        SchemaField::with_size(FieldType::String, "field1", 6),
        SchemaField::with_size(FieldType::String, "field2", 6),
    ]
}

fn cached_store() -> (Store, SchemaId) {
    hotkv::init_logging();
    let store = Store::open(StoreOptions {
        log: ValueLogOptions {
            chunk_size: 1 << 16,
            capacity: 1 << 24,
            dir: None,
        },
        cache: Some(RowBufferOptions {
            max_pages: 32,
            ..Default::default()
        }),
    })
    .unwrap();
    let schema_id = store.create_schema("pair", 0, pair_fields());
    (store, schema_id)
}

#[test]
fn test_promote_on_miss() {
    let (store, sid) = cached_store();
    store.put(sid, 2, b"abc123xyz789").unwrap();

    // Freshly put keys are cold.
    let cursor = store.indexers().get(sid).unwrap().cursor(2).unwrap();
    assert!(!cursor.value_ptr().is_hot());

    // The first get reads the log and promotes.
    assert_eq!(store.get(sid, 2).unwrap(), b"abc123xyz789");
    let vptr = cursor.value_ptr();
    assert!(vptr.is_hot());
    assert!(store.cache().unwrap().owns(vptr.row_addr()));

    // The second get is a cache hit.
    assert_eq!(store.get(sid, 2).unwrap(), b"abc123xyz789");
    assert_eq!(store.hit_ratio(sid), Some(0.5));
}

#[test]
fn test_overwrite_drops_cached_row() {
    let (store, sid) = cached_store();
    store.put(sid, 1, b"aaaaaa111111").unwrap();
    store.get(sid, 1).unwrap();
    assert_eq!(store.cache().unwrap().chain_live_rows(sid), Some(1));

    store.put(sid, 1, b"bbbbbb222222").unwrap();
    let cursor = store.indexers().get(sid).unwrap().cursor(1).unwrap();
    assert!(!cursor.value_ptr().is_hot());
    assert_eq!(store.cache().unwrap().chain_live_rows(sid), Some(0));
    assert_eq!(store.get(sid, 1).unwrap(), b"bbbbbb222222");
}

#[test]
fn test_update_in_place_invalidates_cache() {
    let (store, sid) = cached_store();
    store.put(sid, 5, b"aaaaaabbbbbb").unwrap();
    store.get(sid, 5).unwrap();

    store.update(sid, 5, &[(1, b"cccccc")]).unwrap();
    let cursor = store.indexers().get(sid).unwrap().cursor(5).unwrap();
    assert!(!cursor.value_ptr().is_hot());
    assert_eq!(store.get(sid, 5).unwrap(), b"aaaaaacccccc");

    // Wrong field width is rejected before touching the log.
    assert!(matches!(
        store.update(sid, 5, &[(0, b"nope")]),
        Err(Error::SizeMismatch { .. })
    ));
}

#[test]
fn test_remove() {
    let (store, sid) = cached_store();
    store.put(sid, 9, b"abc123xyz789").unwrap();
    store.get(sid, 9).unwrap();
    assert_eq!(store.cache().unwrap().chain_live_rows(sid), Some(1));

    store.remove(sid, 9).unwrap();
    assert!(matches!(store.get(sid, 9), Err(Error::NotFound)));
    assert!(matches!(store.remove(sid, 9), Err(Error::NotFound)));
    assert_eq!(store.cache().unwrap().chain_live_rows(sid), Some(0));
}

#[test]
fn test_scan_is_ordered() {
    let (store, sid) = cached_store();
    let mut keys: Vec<u64> = (1..=10).collect();
    keys.shuffle(&mut rand::rng());
    for &key in &keys {
        let value = format!("k{key:05}{key:06}");
        store.put(sid, key, value.as_bytes()).unwrap();
    }

    let hits = store.scan(sid, 3, 4).unwrap();
    let scanned: Vec<u64> = hits.iter().map(|(k, _)| *k).collect();
    assert_eq!(scanned, vec![4, 5, 6, 7]);
    for (key, value) in hits {
        assert_eq!(value, format!("k{key:05}{key:06}").into_bytes());
    }

    // Scanning promotes: a second scan hits the cache.
    let again = store.scan(sid, 3, 4).unwrap();
    assert_eq!(again.len(), 4);
    assert!(store.hit_ratio(sid).unwrap() > 0.0);
}

#[test]
fn test_store_without_cache() {
    let store = Store::open(StoreOptions {
        log: ValueLogOptions {
            chunk_size: 1 << 16,
            capacity: 1 << 24,
            dir: None,
        },
        cache: None,
    })
    .unwrap();
    let sid = store.create_schema("pair", 0, pair_fields());

    store.put(sid, 1, b"abc123xyz789").unwrap();
    assert_eq!(store.get(sid, 1).unwrap(), b"abc123xyz789");
    assert_eq!(store.hit_ratio(sid), None);
    assert!(store.run_gc());
}

#[test]
fn test_stats_window_rollover() {
    let store = Store::open(StoreOptions {
        log: ValueLogOptions::default(),
        cache: Some(RowBufferOptions {
            max_pages: 8,
            stats_interval: 4,
            ..Default::default()
        }),
    })
    .unwrap();
    let sid = store.create_schema("pair", 0, pair_fields());

    store.put(sid, 1, b"abc123xyz789").unwrap();
    for _ in 0..8 {
        store.get(sid, 1).unwrap();
    }
    let snapshot = store.stats_snapshot();
    let entry = snapshot.iter().find(|s| s.schema_id == sid).unwrap();
    assert_eq!(entry.accesses, 8);
    assert_eq!(entry.hits, 7, "first access misses, the rest hit");
    assert_eq!(entry.window_hits.len(), 2);
}

#[test]
fn test_async_store_survives_promotion_burst() {
    let store = Store::open(StoreOptions {
        log: ValueLogOptions::default(),
        cache: Some(RowBufferOptions {
            max_pages: 32,
            async_write: true,
            queue_capacity: 4,
            ..Default::default()
        }),
    })
    .unwrap();
    let sid = store.create_schema("pair", 0, pair_fields());

    for key in 0..100u64 {
        store.put(sid, key, b"abc123xyz789").unwrap();
    }
    // Reads succeed regardless of how many promotions the ring absorbed.
    for key in 0..100u64 {
        assert_eq!(store.get(sid, key).unwrap(), b"abc123xyz789");
    }
}
