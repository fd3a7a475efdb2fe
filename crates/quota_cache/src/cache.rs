// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-cache façade.
//!
//! This module provides [`Cache`], which ties together the lifecycle [`State`], the shared
//! accounting record and the bucket table, and [`CacheStats`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use tracing::{Level, event};

use crate::bucket::{Bucket, CacheKind, PLAIN_SLOTS};
use crate::error::Rejected;
use crate::frequency::{FrequencyBuffer, Stat, evictions_dominate};
use crate::manager::{CacheId, Manager};
use crate::metadata::Metadata;
use crate::state::{OperationGuard, State};
use crate::table::Table;
use crate::value::{CachedValue, Finding};

/// Seed of the bucket placement hash.
const HASH_SEED: u32 = 0xdead_beef;

/// Hashes a key for bucket placement.
///
/// The result is never zero; zero is reserved to mean "no hash".
///
/// # Examples
///
/// ```
/// assert_ne!(quota_cache::hash_key(b""), 0);
/// assert_eq!(quota_cache::hash_key(b"key"), quota_cache::hash_key(b"key"));
/// ```
#[must_use]
pub fn hash_key(key: &[u8]) -> u32 {
    xxhash_rust::xxh32::xxh32(key, HASH_SEED).max(1)
}

fn signed(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// A size-bounded key/value cache whose quota is granted by a [`Manager`].
///
/// Caches are created through [`Manager::cache_builder`] and shared as `Arc<Cache>`. All
/// operations are safe to call concurrently. Once shutdown has begun every operation turns
/// into a no-op that reports "not operational".
///
/// # Examples
///
/// ```
/// use quota_cache::Manager;
///
/// let manager = Manager::builder().global_limit(64 * 1024 * 1024).build();
/// let cache = manager.cache_builder().limit(1024 * 1024).build();
///
/// cache.insert(b"answer", b"42").expect("room for one value");
/// let finding = cache.lookup(b"answer");
/// assert_eq!(finding.value().map(|v| v.value()), Some(&b"42"[..]));
///
/// cache.shutdown();
/// assert!(!cache.lookup(b"answer").found());
/// ```
pub struct Cache {
    id: CacheId,
    kind: CacheKind,
    allow_growth: bool,
    manager: Arc<Manager>,
    metadata: Arc<Metadata>,
    state: State,
    /// Active table. Empty once shut down.
    table: ArcSwapOption<Table>,
    /// Table being drained by a migration.
    retiring: ArcSwapOption<Table>,
    sampler: FrequencyBuffer,
    insertions: AtomicU64,
    /// Completed migrations, bumped before the retiring table is dropped.
    migrations: AtomicU64,
    evict_cursor: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    weak_self: Weak<Self>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("allow_growth", &self.allow_growth)
            .field("lifecycle", &self.state.lock().lifecycle())
            .finish_non_exhaustive()
    }
}

/// Parts handed to [`Cache::new`] by the manager.
pub(crate) struct Registered {
    pub id: CacheId,
    pub metadata: Arc<Metadata>,
    pub log_size: u32,
}

impl Cache {
    /// Builds the cache around a registration, or inert if there is none.
    pub(crate) fn new(
        weak_self: Weak<Self>,
        manager: Arc<Manager>,
        kind: CacheKind,
        allow_growth: bool,
        registered: Option<Registered>,
    ) -> Self {
        let sampler = FrequencyBuffer::new(manager.settings().sampler_capacity);
        let (id, metadata, state, table) = match registered {
            Some(registered) => (
                registered.id,
                registered.metadata,
                State::new(),
                Some(Arc::new(Table::new(kind, registered.log_size))),
            ),
            None => (CacheId::UNREGISTERED, Arc::new(Metadata::new(0, 0, 0)), State::inert(), None),
        };

        Self {
            id,
            kind,
            allow_growth,
            manager,
            metadata,
            state,
            table: ArcSwapOption::new(table),
            retiring: ArcSwapOption::empty(),
            sampler,
            insertions: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            evict_cursor: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            weak_self,
        }
    }

    /// Identifier assigned at registration.
    #[must_use]
    pub fn id(&self) -> CacheId {
        self.id
    }

    /// Bucket discipline of this cache.
    #[must_use]
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    /// Whether the cache may ask for more memory on its own.
    #[must_use]
    pub fn allows_growth(&self) -> bool {
        self.allow_growth
    }

    pub(crate) fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Returns `true` until shutdown begins.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.state.lock().is_operational()
    }

    fn start_operation(&self) -> Option<OperationGuard<'_>> {
        self.state.lock().start_operation()
    }

    /// Opens an operation that outlives the current borrow, for work handed to another thread.
    pub(crate) fn start_detached_operation(&self) -> Option<DetachedOperation> {
        let cache = self.weak_self.upgrade()?;
        let started = self.state.lock().start_operation_detached();
        started.then_some(DetachedOperation { cache })
    }

    fn term(&self) -> u64 {
        match self.kind {
            CacheKind::Plain => 0,
            CacheKind::Transactional => self.manager.transactions().term(),
        }
    }

    /// Looks up `key`, returning a lease on the value if present.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Finding {
        let Some(_operation) = self.start_operation() else {
            return Finding::none();
        };

        let found = self.find_entry(hash_key(key), key);
        self.record_stat(if found.is_some() { Stat::Hit } else { Stat::Miss });
        Finding::new(found)
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejected`] reason when the insert had no effect.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), Rejected> {
        let value = CachedValue::new(key, value).map_err(|_| Rejected::InvalidValue)?;
        self.insert_value(value)
    }

    /// Stores a prepared [`CachedValue`], replacing any previous value under its key.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejected`] reason when the insert had no effect.
    pub fn insert_value(&self, value: CachedValue) -> Result<(), Rejected> {
        let _operation = self.start_operation().ok_or(Rejected::NotOperational)?;

        let size = value.size();
        let hash = hash_key(value.key());
        let term = self.term();

        if !self.reserve(size) && !(self.request_resize(0, true) && self.reserve(size)) {
            let soft_limit = self.metadata.lock().soft_limit();
            if size > soft_limit {
                return Err(Rejected::OverLimit);
            }
            self.free_memory(soft_limit - size);
            if !self.reserve(size) {
                return Err(Rejected::OverLimit);
            }
        }

        let displaced = match self.store(hash, Arc::new(value), term) {
            Ok(displaced) => displaced,
            Err(rejected) => {
                self.reclaim_memory(size);
                return Err(rejected);
            }
        };

        let mut freed = 0;
        if let Some(replaced) = displaced.replaced {
            freed += replaced.size();
        }
        if let Some(evicted) = displaced.evicted {
            freed += evicted.size();
            self.record_stat(Stat::Eviction);
        }

        if !self.reclaim_memory(freed) {
            self.request_resize(0, true);
        }
        self.request_migrate(0);
        Ok(())
    }

    /// Removes `key`. Returns `true` if a value was removed.
    pub fn remove(&self, key: &[u8]) -> bool {
        let Some(_operation) = self.start_operation() else {
            return false;
        };

        let hash = hash_key(key);
        let removed = self.take_from_tables(hash, |bucket| bucket.remove(hash, key));
        self.release(&removed)
    }

    /// Removes `key` and prevents it from being inserted again during the current
    /// transaction term.
    ///
    /// On a plain cache this is the same as [`remove`](Self::remove). Returns `true` if a
    /// value was removed.
    pub fn banish(&self, key: &[u8]) -> bool {
        let Some(_operation) = self.start_operation() else {
            return false;
        };

        let hash = hash_key(key);
        let term = self.term();
        let removed = self.take_from_tables(hash, |bucket| bucket.banish(hash, key, term));
        self.release(&removed)
    }

    fn release(&self, values: &[Arc<CachedValue>]) -> bool {
        let freed: u64 = values.iter().map(|value| value.size()).sum();
        if values.is_empty() {
            return false;
        }
        self.reclaim_memory(freed);
        true
    }

    /// Looks in the active table, then in a retiring one.
    ///
    /// A bucket flagged as migrated belongs to a table that has been replaced, and a change of
    /// the migration count means a retiring table vanished while we looked. Either way the
    /// entry may have moved behind our back, so the search starts over.
    fn find_entry(&self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        loop {
            let migrations = self.migrations.load(Ordering::SeqCst);
            let table = self.table.load_full()?;
            let Some(primary) = table.with_bucket(hash, |bucket| (!bucket.is_migrated()).then(|| bucket.find(hash, key)))
            else {
                continue;
            };
            if primary.is_some() {
                return primary;
            }

            match self.retiring.load_full() {
                Some(retiring) => {
                    if let Some(found) = retiring.with_bucket(hash, |bucket| (!bucket.is_migrated()).then(|| bucket.find(hash, key))) {
                        return found;
                    }
                }
                None if self.migrations.load(Ordering::SeqCst) == migrations => return None,
                None => {}
            }
        }
    }

    /// Applies `take` to the key's bucket in every table that may hold the key.
    fn take_from_tables(&self, hash: u32, take: impl Fn(&mut Bucket) -> Option<Arc<CachedValue>>) -> Vec<Arc<CachedValue>> {
        let mut taken = Vec::new();
        loop {
            let migrations = self.migrations.load(Ordering::SeqCst);
            let Some(table) = self.table.load_full() else {
                return taken;
            };
            let Some(primary) = table.with_bucket(hash, |bucket| (!bucket.is_migrated()).then(|| take(bucket))) else {
                continue;
            };
            taken.extend(primary);

            match self.retiring.load_full() {
                Some(retiring) => {
                    if let Some(old) = retiring.with_bucket(hash, |bucket| (!bucket.is_migrated()).then(|| take(bucket))) {
                        taken.extend(old);
                        return taken;
                    }
                }
                None if self.migrations.load(Ordering::SeqCst) == migrations => return taken,
                None => {}
            }
        }
    }

    fn store(&self, hash: u32, value: Arc<CachedValue>, term: u64) -> Result<crate::bucket::Displaced, Rejected> {
        loop {
            let table = self.table.load_full().ok_or(Rejected::NotOperational)?;

            if self.kind == CacheKind::Transactional
                && let Some(retiring) = self.retiring.load_full()
                && retiring.with_bucket(hash, |bucket| !bucket.is_migrated() && bucket.is_banished(hash, term))
            {
                return Err(Rejected::Banished);
            }

            let value = Arc::clone(&value);
            if let Some(result) = table.with_bucket(hash, |bucket| (!bucket.is_migrated()).then(|| bucket.insert(hash, value, term))) {
                return result;
            }
        }
    }

    /// The soft limit in bytes, or `0` if the cache is not operational.
    #[must_use]
    pub fn limit(&self) -> u64 {
        let state = self.state.lock();
        if !state.is_operational() {
            return 0;
        }
        self.metadata.lock_under(&state).soft_limit()
    }

    /// Bytes currently charged to the cache, or `0` if the cache is not operational.
    #[must_use]
    pub fn usage(&self) -> u64 {
        let state = self.state.lock();
        if !state.is_operational() {
            return 0;
        }
        self.metadata.lock_under(&state).usage()
    }

    /// Asks the manager for a new limit.
    ///
    /// Waits for any resize already in flight, then submits the request. Returns `true` if the
    /// resize was carried out. Growth is refused for caches created without growth.
    pub fn resize(&self, requested_limit: u64) -> bool {
        let Some(_operation) = self.start_operation() else {
            return false;
        };

        self.request_resize(requested_limit, false)
    }

    /// Submits a resize to the manager.
    ///
    /// Internal requests come from memory pressure on the insert path: they give up after a
    /// bounded number of lock attempts, respect the growth flag and the rate limit, and give up
    /// when another resize is in flight. External requests wait for that resize instead.
    /// `requested_limit == 0` asks for double the current hard limit.
    pub(crate) fn request_resize(&self, requested_limit: u64, internal: bool) -> bool {
        let settings = self.manager.settings();
        let state = if internal {
            self.state.try_lock(settings.internal_lock_tries)
        } else {
            Some(self.state.lock())
        };
        let Some(mut state) = state else {
            return false;
        };
        if !internal {
            state.wait_while_resizing();
        }
        if !state.is_operational() || state.is_resizing() {
            return false;
        }

        let now = self.manager.clock().instant();
        let new_limit = {
            let metadata = self.metadata.lock_under(&state);
            if internal && !(self.allow_growth && metadata.resize_allowed_at(now)) {
                return false;
            }

            let new_limit = if requested_limit > 0 {
                requested_limit
            } else {
                metadata.hard_limit().saturating_mul(2)
            };
            if new_limit > metadata.hard_limit() && !self.allow_growth {
                return false;
            }
            new_limit
        };

        state.set_resizing(true);
        drop(state);

        let resized = self.manager.request_resize(self, new_limit);

        self.state.lock().set_resizing(false);
        resized
    }

    /// Considers a migration to a table of `2^requested_log_size` buckets.
    ///
    /// Only every `migrate_sample_mask + 1`-th call does any work, and only when recent
    /// outcomes are dominated by evictions. `requested_log_size == 0` asks for one step larger
    /// than the current table.
    pub(crate) fn request_migrate(&self, requested_log_size: u32) -> bool {
        let settings = self.manager.settings();
        let count = self.insertions.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if count & settings.migrate_sample_mask != 0 {
            return false;
        }
        if !evictions_dominate(&self.sampler.frequencies()) {
            return false;
        }

        let Some(state) = self.state.try_lock(settings.internal_lock_tries) else {
            return false;
        };
        if !state.is_operational() || state.is_migrating() {
            return false;
        }

        let now = self.manager.clock().instant();
        let new_log_size = {
            let metadata = self.metadata.lock_under(&state);
            if metadata.is_migrating() || !metadata.migrate_allowed_at(now) {
                return false;
            }
            if requested_log_size > 0 {
                requested_log_size
            } else {
                metadata.log_size() + 1
            }
        };
        drop(state);

        let migrated = self.manager.request_migrate(self, new_log_size);
        if migrated {
            self.sampler.clear();
        }
        migrated
    }

    /// Moves every entry into a new table of `2^log_size` buckets.
    ///
    /// Runs on behalf of the manager inside an open operation. Lookups keep working
    /// throughout: the new table is consulted first and the old one serves as fallback until
    /// it has been drained.
    pub(crate) fn migrate(&self, log_size: u32) {
        let target = Arc::new(Table::new(self.kind, log_size));

        let source = {
            let mut state = self.state.lock();
            let source = self.table.load_full();
            match source {
                Some(source) if state.set_migrating(true) => {
                    self.retiring.store(Some(Arc::clone(&source)));
                    self.table.store(Some(Arc::clone(&target)));
                    source
                }
                _ => {
                    drop(state);
                    self.manager.finish_migration(self, None);
                    return;
                }
            }
        };

        event!(Level::DEBUG, cache.id = %self.id, from = source.log_size(), to = log_size, "migration started");
        let summary = source.migrate_into(&target, self.term());

        {
            let mut state = self.state.lock();
            self.migrations.fetch_add(1, Ordering::SeqCst);
            self.retiring.store(None);
            state.set_migrating(false);
        }

        let released: u64 = summary.released.iter().map(|value| value.size()).sum();
        drop(summary.released);
        event!(
            Level::DEBUG,
            cache.id = %self.id,
            log_size,
            moved = summary.moved,
            released,
            "migration finished"
        );

        self.manager.finish_migration(
            self,
            Some(MigrationOutcome {
                log_size,
                old_table_memory: source.memory_usage(),
                released,
            }),
        );
    }

    /// Records an outcome code for the migration heuristic and the statistics.
    pub(crate) fn record_stat(&self, stat: Stat) {
        self.sampler.insert_record(stat);
        let counter = match stat {
            Stat::Hit => &self.hits,
            Stat::Miss => &self.misses,
            Stat::Eviction => &self.evictions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Share of evictions in the recent sample window, between `0.0` and `1.0`.
    pub(crate) fn eviction_pressure(&self) -> f64 {
        let frequencies = self.sampler.frequencies();
        let total: u64 = frequencies.iter().map(|(_, count)| count).sum();
        let evictions = frequencies
            .iter()
            .find(|(stat, _)| *stat == Stat::Eviction)
            .map_or(0, |(_, count)| *count);
        ratio(evictions, total).unwrap_or(0.0)
    }

    fn reserve(&self, size: u64) -> bool {
        self.metadata.lock().adjust_usage_if_allowed(signed(size))
    }

    /// Gives `size` bytes back. Returns `true` if usage is now within the soft limit.
    pub(crate) fn reclaim_memory(&self, size: u64) -> bool {
        let mut metadata = self.metadata.lock();
        metadata.adjust_usage_if_allowed(-signed(size));
        metadata.soft_limit() >= metadata.usage()
    }

    /// Evicts least recently used, unborrowed entries until usage is at most `target`.
    ///
    /// Returns `true` if the target was reached.
    pub(crate) fn free_memory(&self, target: u64) -> bool {
        let tables: Vec<Arc<Table>> = [self.retiring.load_full(), self.table.load_full()]
            .into_iter()
            .flatten()
            .collect();

        for table in &tables {
            let steps = table.bucket_len() * PLAIN_SLOTS;
            for _ in 0..steps {
                if self.metadata.lock().usage() <= target {
                    return true;
                }

                let index = self.evict_cursor.fetch_add(1, Ordering::Relaxed) % table.bucket_len();
                let victim = table.with_bucket_at(index, |bucket| if bucket.is_migrated() { None } else { bucket.evict() });
                if let Some(victim) = victim {
                    self.reclaim_memory(victim.size());
                    self.record_stat(Stat::Eviction);
                }
            }
        }

        self.metadata.lock().usage() <= target
    }

    /// Whether a resize could start right now.
    #[must_use]
    pub fn can_resize(&self) -> bool {
        let state = self.state.lock();
        state.is_operational() && !state.is_resizing() && !self.metadata.lock_under(&state).is_resizing()
    }

    /// Whether a migration could start right now.
    #[must_use]
    pub fn can_migrate(&self) -> bool {
        let state = self.state.lock();
        state.is_operational() && !state.is_migrating() && !self.metadata.lock_under(&state).is_migrating()
    }

    /// Snapshot of the cache's counters and accounting.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (limit, usage, log_size) = {
            let state = self.state.lock();
            if state.is_operational() {
                let metadata = self.metadata.lock_under(&state);
                (metadata.soft_limit(), metadata.usage(), metadata.log_size())
            } else {
                (0, 0, 0)
            }
        };

        let frequencies = self.sampler.frequencies();
        let count_of = |wanted: Stat| {
            frequencies
                .iter()
                .find(|(stat, _)| *stat == wanted)
                .map_or(0, |(_, count)| *count)
        };
        let window_hits = count_of(Stat::Hit);
        let window_lookups = window_hits + count_of(Stat::Miss);

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let entries = [self.retiring.load_full(), self.table.load_full()]
            .into_iter()
            .flatten()
            .map(|table| table.entries())
            .sum();

        CacheStats {
            limit,
            usage,
            log_size,
            entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            lifetime_hit_rate: ratio(hits, hits + misses),
            window_hit_rate: ratio(window_hits, window_lookups),
        }
    }

    /// Marks the cache as shutting down. Operations already running complete; new ones are
    /// refused. Idempotent.
    pub fn begin_shutdown(&self) {
        self.state.lock().begin_shutdown();
    }

    /// Shuts the cache down: waits for running operations, releases the table and returns the
    /// quota to the manager.
    ///
    /// Idempotent. When called concurrently, one caller performs the teardown and every
    /// caller returns only once it is complete.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if !state.claim_teardown() {
            state.wait_for_shutdown();
            return;
        }

        state.wait_for_operations();

        self.retiring.store(None);
        if let Some(table) = self.table.swap(None) {
            let released = table.clear();
            drop(released);
        }
        let on_destroy = self.manager.unregister(self.id);

        state.finish_shutdown();
        drop(state);
        event!(Level::DEBUG, cache.id = %self.id, "cache shut down");

        if let Some(on_destroy) = on_destroy {
            on_destroy(self.id);
        }
    }

    /// Shuts down a shared cache handle.
    pub fn destroy(cache: Arc<Self>) {
        cache.shutdown();
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[expect(clippy::cast_precision_loss, reason = "rates do not need full integer precision")]
fn ratio(part: u64, whole: u64) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64)
}

/// Result of a completed migration, reported to the manager.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MigrationOutcome {
    pub log_size: u32,
    pub old_table_memory: u64,
    pub released: u64,
}

/// An operation kept open while work runs on another thread. Closes on drop.
#[derive(Debug)]
pub(crate) struct DetachedOperation {
    cache: Arc<Cache>,
}

impl DetachedOperation {
    pub fn cache(&self) -> &Cache {
        &self.cache
    }
}

impl Drop for DetachedOperation {
    fn drop(&mut self) {
        self.cache.state.end_operation();
    }
}

/// Counters and accounting of a single cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    /// Soft limit in bytes.
    pub limit: u64,
    /// Bytes currently charged.
    pub usage: u64,
    /// Table size exponent.
    pub log_size: u32,
    /// Stored entries. Locks every bucket in turn.
    pub entries: usize,
    /// Lookups that found their key since creation.
    pub hits: u64,
    /// Lookups that missed since creation.
    pub misses: u64,
    /// Entries evicted since creation.
    pub evictions: u64,
    /// `hits / (hits + misses)` since creation.
    pub lifetime_hit_rate: Option<f64>,
    /// Hit rate over the recent sample window.
    pub window_hit_rate: Option<f64>,
}
