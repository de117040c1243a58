// Property-based tests for batched lookups

mod support;

use common::cache::{batch_chunks, MemoryCacheStore, Origin, BATCH_WIDTH};
use proptest::prelude::*;
use std::collections::HashSet;
use support::{query_cache, FakeDatabase};

const LOOKUP_TEN: &str = "SELECT tablename AS _qkey FROM pg_tables \
                          WHERE tablename IN ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// *For any* list of keys, batching yields ceil(n / 10) full-width batches
/// that carry every key once, in order, followed only by null padding.
#[test]
fn property_batches_cover_keys_in_order() {
    proptest!(|(keys in prop::collection::vec("[a-z]{1,8}", 0..64))| {
        let chunks = batch_chunks(&keys);

        prop_assert_eq!(chunks.len(), keys.len().div_ceil(BATCH_WIDTH));
        prop_assert!(chunks.iter().all(|c| c.len() == BATCH_WIDTH));

        let flat: Vec<_> = chunks.into_iter().flatten().collect();
        let (real, padding) = flat.split_at(keys.len());
        for (value, key) in real.iter().zip(&keys) {
            prop_assert_eq!(value.as_str(), Some(key.as_str()));
        }
        prop_assert!(padding.iter().all(|v| v.is_null()));
        prop_assert!(padding.len() < BATCH_WIDTH);
    });
}

/// *For any* 1..=10 uncached keys, run10 issues exactly one statement with
/// 10 parameters, and repeating the call is served entirely from the cache.
#[test]
fn property_single_batch_then_all_hits() {
    let rt = runtime();

    proptest!(|(keys in prop::collection::hash_set("[a-z]{1,6}", 1..=BATCH_WIDTH))| {
        let keys: Vec<String> = keys.into_iter().collect();
        let db = FakeDatabase::with_keys(&keys);
        let store = MemoryCacheStore::new();
        let cache = query_cache(&db, &store);

        let first = rt.block_on(cache.run10("tables", LOOKUP_TEN, &keys, 60)).unwrap();
        let executions = db.executions();
        prop_assert_eq!(executions.len(), 1);
        prop_assert_eq!(executions[0].params.len(), BATCH_WIDTH);
        prop_assert_eq!(executions[0].null_params(), BATCH_WIDTH - keys.len());
        prop_assert_eq!(first.len(), keys.len());
        prop_assert!(first.values().all(|r| r.origin == Origin::Miss));

        db.reset_executions();
        let second = rt.block_on(cache.run10("tables", LOOKUP_TEN, &keys, 60)).unwrap();
        prop_assert_eq!(db.execution_count(), 0);
        prop_assert_eq!(second.len(), keys.len());
        prop_assert!(second.values().all(|r| r.origin == Origin::Hit));
    });
}

/// *For any* split of keys into already-cached and new, run10 issues
/// ceil(new / 10) statements and never re-queries a cached key.
#[test]
fn property_only_missing_keys_are_queried() {
    let rt = runtime();

    proptest!(|(
        keys in prop::collection::hash_set("[a-z]{1,6}", 1..40),
        cached_share in 0usize..=100,
    )| {
        let keys: Vec<String> = keys.into_iter().collect();
        let cached_count = keys.len() * cached_share / 100;
        let (cached, fresh) = keys.split_at(cached_count);

        let db = FakeDatabase::with_keys(&keys);
        let store = MemoryCacheStore::new();
        let cache = query_cache(&db, &store);

        if !cached.is_empty() {
            rt.block_on(cache.run10("tables", LOOKUP_TEN, cached, 60)).unwrap();
        }
        db.reset_executions();

        let rows = rt.block_on(cache.run10("tables", LOOKUP_TEN, &keys, 60)).unwrap();
        prop_assert_eq!(rows.len(), keys.len());
        prop_assert_eq!(db.execution_count(), fresh.len().div_ceil(BATCH_WIDTH));

        let cached: HashSet<&String> = cached.iter().collect();
        for execution in db.executions() {
            for param in execution.real_params() {
                let key = param.as_str().unwrap().to_string();
                prop_assert!(!cached.contains(&key));
            }
        }
    });
}
