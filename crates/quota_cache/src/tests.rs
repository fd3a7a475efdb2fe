// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cross-module scenarios for caches and their manager.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tick::ClockControl;
use tracing_test::traced_test;

use crate::table::Table;
use crate::{Cache, CacheKind, CachedValue, Manager, Rejected};

const MIB: u64 = 1024 * 1024;

fn key(i: u32) -> Vec<u8> {
    format!("key-{i}").into_bytes()
}

/// Sum of the sizes of the values a lookup can still find.
fn owned_bytes(cache: &Cache, keys: impl IntoIterator<Item = u32>) -> u64 {
    keys.into_iter()
        .filter_map(|i| cache.lookup(&key(i)).value().map(CachedValue::size))
        .sum()
}

#[test]
fn usage_equals_owned_values_when_quiescent() {
    let manager = Manager::builder().initial_log_size(8).build();
    let cache = manager.cache_builder().limit(MIB).build();

    for i in 0..300 {
        cache.insert(&key(i), &[1; 64]).expect("insert");
    }
    for i in (0..300).step_by(3) {
        cache.insert(&key(i), &[2; 200]).expect("replace");
    }
    for i in (0..300).step_by(7) {
        let _ = cache.remove(&key(i));
    }

    assert_eq!(cache.usage(), owned_bytes(&cache, 0..300));
}

#[test]
fn lease_survives_concurrent_eviction() {
    let manager = Manager::builder().initial_log_size(4).build();
    let cache = manager.cache_builder().limit(16 * 1024).build();

    cache.insert(b"pinned", b"original").expect("insert");
    let lease = cache.lookup(b"pinned");
    assert!(lease.found());

    let writers: Vec<_> = (0..4_u32)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..2_000 {
                    let _ = cache.insert(&key(t * 10_000 + i), &[0; 128]);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer");
    }

    assert_eq!(lease.value().map(CachedValue::value), Some(&b"original"[..]));
    assert!(cache.stats().evictions > 0);
    assert!(cache.usage() <= 16 * 1024);

    drop(lease);
    assert_eq!(cache.usage(), owned_bytes(&cache, (0..4).flat_map(|t| (0..2_000).map(move |i| t * 10_000 + i))) + pinned_size(&cache));
}

fn pinned_size(cache: &Cache) -> u64 {
    cache.lookup(b"pinned").value().map_or(0, CachedValue::size)
}

#[test]
fn bounded_cache_without_growth_evicts() {
    let manager = Manager::builder().build();
    let cache = manager.cache_builder().limit(MIB).allow_growth(false).build();

    let stored = (0..4_000).filter(|i| cache.insert(&key(*i), &[7; 1024]).is_ok()).count();
    assert!(stored > 0);

    let stats = cache.stats();
    assert!(stats.evictions > 0);
    assert!(stats.usage <= MIB);

    assert!(!cache.resize(2 * MIB), "growth is disabled");
    assert_eq!(cache.limit(), MIB);
}

#[test]
fn shrink_evicts_down_to_new_limit() {
    let manager = Manager::builder().build();
    let cache = manager.cache_builder().limit(MIB).build();
    for i in 0..500 {
        cache.insert(&key(i), &[3; 1024]).expect("insert");
    }
    let allocation = manager.stats().allocation;

    assert!(cache.resize(128 * 1024));
    assert_eq!(cache.limit(), 128 * 1024);
    assert!(cache.usage() <= 128 * 1024);
    assert_eq!(manager.stats().allocation, allocation - (MIB - 128 * 1024));
}

#[test]
fn growth_is_granted_within_the_global_budget() {
    let manager = Manager::builder().global_limit(4 * MIB).initial_log_size(4).build();
    let cache = manager.cache_builder().limit(MIB).allow_growth(true).build();

    assert!(cache.resize(2 * MIB));
    assert_eq!(cache.limit(), 2 * MIB);
    assert!(!cache.resize(8 * MIB), "beyond the global budget");
    assert_eq!(cache.limit(), 2 * MIB);
}

#[test]
fn internal_growth_is_rate_limited() {
    let control = ClockControl::new();
    let manager = Manager::builder()
        .clock(control.to_clock())
        .min_cache_limit(4096)
        .resize_cooldown(Duration::from_secs(1))
        .build();
    let cache = manager.cache_builder().limit(4096).allow_growth(true).build();

    let mut next = 0;
    let mut fill = |count: u32| {
        for _ in 0..count {
            let _ = cache.insert(&key(next), &[0; 512]);
            next += 1;
        }
    };

    fill(10);
    assert_eq!(cache.limit(), 8192, "first pressure grows the cache");

    fill(40);
    assert_eq!(cache.limit(), 8192, "further growth waits for the cooldown");

    control.advance(Duration::from_secs(2));
    fill(40);
    assert_eq!(cache.limit(), 16_384);
}

#[test]
fn migration_preserves_contents() {
    let manager = Manager::builder().initial_log_size(4).build();
    let cache = manager.cache_builder().limit(MIB).build();

    for i in 0..60 {
        cache.insert(&key(i), &i.to_le_bytes()).expect("insert");
    }
    let before: Vec<u32> = (0..60).filter(|i| cache.lookup(&key(*i)).found()).collect();
    let usage = cache.usage();
    let allocation = manager.stats().allocation;

    assert!(manager.request_migrate(&cache, 5));

    let after: Vec<u32> = (0..60).filter(|i| cache.lookup(&key(*i)).found()).collect();
    assert_eq!(before, after);
    assert_eq!(cache.stats().log_size, 5);
    assert_eq!(cache.usage(), usage);
    assert_eq!(
        manager.stats().allocation,
        allocation - Table::memory_for(4) + Table::memory_for(5)
    );
    assert!(cache.can_migrate());
}

#[test]
fn migration_is_refused_when_already_at_size() {
    let manager = Manager::builder().initial_log_size(6).build();
    let cache = manager.cache_builder().build();
    assert!(!manager.request_migrate(&cache, 6));
    assert!(!manager.request_migrate(&cache, 40), "beyond the largest table");
}

#[test]
fn background_migration_keeps_serving() {
    let manager = Manager::builder().initial_log_size(4).background_tasks(true).build();
    let cache = manager.cache_builder().limit(MIB).build();
    for i in 0..60 {
        cache.insert(&key(i), b"value").expect("insert");
    }
    let before: Vec<u32> = (0..60).filter(|i| cache.lookup(&key(*i)).found()).collect();

    assert!(manager.request_migrate(&cache, 6));
    let during: Vec<u32> = (0..60).filter(|i| cache.lookup(&key(*i)).found()).collect();
    assert_eq!(before, during);

    while !cache.can_migrate() {
        thread::yield_now();
    }
    assert_eq!(cache.stats().log_size, 6);
    let after: Vec<u32> = (0..60).filter(|i| cache.lookup(&key(*i)).found()).collect();
    assert_eq!(before, after);
}

#[test]
fn concurrent_readers_during_migration_never_miss_stable_keys() {
    let manager = Manager::builder().initial_log_size(4).background_tasks(true).build();
    let cache = manager.cache_builder().limit(MIB).build();
    for i in 0..40 {
        cache.insert(&key(i), b"stable").expect("insert");
    }
    let stable: Vec<u32> = (0..40).filter(|i| cache.lookup(&key(*i)).found()).collect();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let stop = Arc::clone(&stop);
            let stable = stable.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for i in &stable {
                        assert!(cache.lookup(&key(*i)).found(), "key {i} vanished");
                    }
                }
            })
        })
        .collect();

    for log_size in [5, 6, 7] {
        assert!(manager.request_migrate(&cache, log_size));
        while !cache.can_migrate() {
            thread::yield_now();
        }
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().expect("reader");
    }
}

#[test]
fn shutdown_drains_operations() {
    let manager = Manager::builder().build();
    let cache = manager.cache_builder().limit(MIB).build();
    let barrier = Arc::new(Barrier::new(5));

    let workers: Vec<_> = (0..4_u32)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut i = 0;
                loop {
                    match cache.insert(&key(t * 100_000 + i), b"value") {
                        Err(Rejected::NotOperational) => break,
                        _ => i += 1,
                    }
                    let _ = cache.lookup(&key(t * 100_000 + i / 2));
                }
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(10));
    cache.shutdown();

    assert!(!cache.is_operational());
    assert_eq!(cache.limit(), 0);
    assert_eq!(cache.usage(), 0);
    assert!(!cache.lookup(&key(0)).found());
    assert_eq!(cache.insert(b"late", b"value"), Err(Rejected::NotOperational));
    assert!(!cache.resize(2 * MIB));
    assert_eq!(manager.stats().caches, 0);
    assert_eq!(manager.stats().allocation, 0);

    for worker in workers {
        worker.join().expect("worker");
    }
}

#[test]
fn concurrent_shutdown_tears_down_once() {
    let manager = Manager::builder().build();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&destroyed);
    let cache = manager
        .cache_builder()
        .on_destroy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    cache.insert(b"k", b"v").expect("insert");

    let barrier = Arc::new(Barrier::new(2));
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.shutdown();
                assert!(!cache.is_operational());
                assert_eq!(cache.usage(), 0);
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("shutdown thread");
    }

    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    drop(cache);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn begin_shutdown_refuses_new_operations() {
    let manager = Manager::builder().build();
    let cache = manager.cache_builder().build();
    cache.insert(b"k", b"v").expect("insert");

    cache.begin_shutdown();
    assert!(!cache.lookup(b"k").found());
    assert_eq!(cache.insert(b"k2", b"v"), Err(Rejected::NotOperational));
    assert_eq!(manager.stats().caches, 1, "quota is returned by the teardown");

    cache.shutdown();
    assert_eq!(manager.stats().caches, 0);
}

#[test]
fn dropping_the_last_handle_unregisters() {
    let manager = Manager::builder().build();
    let cache = manager.cache_builder().build();
    assert_eq!(manager.stats().caches, 1);
    drop(cache);
    assert_eq!(manager.stats().caches, 0);
    assert_eq!(manager.stats().allocation, 0);
}

#[test]
#[traced_test]
fn refused_registration_yields_inert_cache() {
    let manager = Manager::builder().global_limit(64 * 1024).build();
    let cache = manager.cache_builder().limit(MIB).build();

    assert!(logs_contain("cache registration refused"));
    assert!(!cache.is_operational());
    assert_eq!(cache.limit(), 0);
    assert_eq!(cache.insert(b"k", b"v"), Err(Rejected::NotOperational));
    assert!(!cache.lookup(b"k").found());
    assert!(!cache.resize(2 * MIB));
    cache.shutdown();
    assert_eq!(manager.stats().caches, 0);
}

#[test]
fn transactional_banish_expires_with_the_term() {
    let manager = Manager::builder().build();
    let cache = manager.cache_builder().kind(CacheKind::Transactional).build();
    cache.insert(b"row", b"v1").expect("insert");

    let writer = manager.begin_transaction(false);
    assert!(cache.banish(b"row"));
    assert!(!cache.lookup(b"row").found());
    assert_eq!(cache.insert(b"row", b"v2"), Err(Rejected::Banished));
    assert_eq!(cache.insert(b"other", b"v"), Ok(()));
    drop(writer);

    assert_eq!(cache.insert(b"row", b"v3"), Ok(()));
    assert_eq!(cache.lookup(b"row").copy().map(|v| v.value().to_vec()), Some(b"v3".to_vec()));
}

#[test]
fn banish_markers_survive_migration() {
    let manager = Manager::builder().initial_log_size(4).build();
    let cache = manager.cache_builder().kind(CacheKind::Transactional).build();

    let writer = manager.begin_transaction(false);
    assert!(!cache.banish(b"row"));
    assert!(manager.request_migrate(&cache, 5));
    assert_eq!(cache.insert(b"row", b"v"), Err(Rejected::Banished));
    drop(writer);

    assert_eq!(cache.insert(b"row", b"v"), Ok(()));
}

#[test]
fn plain_banish_is_a_remove() {
    let manager = Manager::builder().build();
    let cache = manager.cache_builder().build();
    cache.insert(b"row", b"v").expect("insert");
    assert!(cache.banish(b"row"));
    assert_eq!(cache.insert(b"row", b"v"), Ok(()));
}

#[test]
fn invalid_values_are_rejected() {
    let manager = Manager::builder().build();
    let cache = manager.cache_builder().build();
    assert_eq!(cache.insert(b"", b"v"), Err(Rejected::InvalidValue));
    assert_eq!(cache.usage(), 0);
}

#[test]
fn manager_stats_sum_cache_usage() {
    let manager = Manager::builder().build();
    let first = manager.cache_builder().build();
    let second = manager.cache_builder().build();
    first.insert(b"a", b"1").expect("insert");
    second.insert(b"b", b"22").expect("insert");

    let stats = manager.stats();
    assert_eq!(stats.caches, 2);
    assert_eq!(stats.usage, first.usage() + second.usage());
    assert!(stats.allocation <= stats.global_limit);
}

#[test]
fn rebalancer_thread_stops_with_its_handle() {
    let manager = Manager::builder().build();
    let idle = manager.cache_builder().limit(MIB).build();

    let rebalancer = manager.spawn_rebalancer(Duration::from_millis(1)).expect("spawn");
    while idle.limit() == MIB {
        thread::yield_now();
    }
    drop(rebalancer);

    assert_eq!(idle.limit(), 4096);
}
