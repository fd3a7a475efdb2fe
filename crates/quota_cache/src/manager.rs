// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Global memory arbitration.
//!
//! The [`Manager`] owns the global budget and the registry of caches. Every byte a cache may
//! use (its hard limit plus its bucket table) is allocated from the budget at registration or
//! through an approved resize or migration, and is returned at unregistration.
//!
//! Lock order is cache state, then the registry, then a single cache's accounting record.
//! The registry lock is never held while a cache's state lock is taken, and never while an
//! `Arc<Cache>` that may be the last handle is dropped.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tick::Clock;
use tracing::{Level, event, warn};

use crate::builder::CacheBuilder;
use crate::cache::{Cache, MigrationOutcome, Registered};
use crate::error::RegistrationError;
use crate::metadata::Metadata;
use crate::rebalancer::Rebalancer;
use crate::table::{MAX_LOG_SIZE, Table};
use crate::transaction::{Transaction, TransactionManager};

/// Identifies a registered cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(u64);

impl CacheId {
    /// Identifier carried by caches whose registration was refused.
    pub const UNREGISTERED: Self = Self(0);

    /// The raw identifier.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Share of evictions among recent outcomes above which a cache is considered starved.
const GROWTH_PRESSURE: f64 = 0.25;

/// Callback invoked with the cache's id once it has been unregistered.
pub(crate) type Deleter = Box<dyn FnOnce(CacheId) + Send>;

/// Values fixed when the manager is built.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub min_cache_limit: u64,
    pub min_log_size: u32,
    pub max_log_size: u32,
    pub initial_log_size: u32,
    pub resize_cooldown: Duration,
    pub migrate_cooldown: Duration,
    pub internal_lock_tries: u32,
    pub migrate_sample_mask: u64,
    pub sampler_capacity: usize,
    pub background_tasks: bool,
}

struct Registration {
    cache: Weak<Cache>,
    metadata: Arc<Metadata>,
    allow_growth: bool,
    on_destroy: Option<Deleter>,
}

struct Registry {
    global_limit: u64,
    allocation: u64,
    next_id: u64,
    accepting: bool,
    caches: HashMap<CacheId, Registration>,
}

impl Registry {
    fn available(&self) -> u64 {
        self.global_limit.saturating_sub(self.allocation)
    }

    fn release(&mut self, bytes: u64) {
        self.allocation = self.allocation.saturating_sub(bytes);
    }
}

/// Arbitrates a global memory budget between caches.
///
/// Create one with [`Manager::builder`], then create caches from it with
/// [`Manager::cache_builder`]. Caches keep the manager alive.
///
/// # Examples
///
/// ```
/// use quota_cache::Manager;
///
/// let manager = Manager::builder().global_limit(8 * 1024 * 1024).build();
/// let first = manager.cache_builder().limit(1024 * 1024).build();
/// let second = manager.cache_builder().limit(1024 * 1024).build();
///
/// let stats = manager.stats();
/// assert_eq!(stats.caches, 2);
/// assert!(stats.allocation >= 2 * 1024 * 1024);
///
/// manager.shutdown();
/// assert!(!first.is_operational());
/// assert!(!second.is_operational());
/// ```
pub struct Manager {
    settings: Settings,
    clock: Clock,
    transactions: TransactionManager,
    registry: Mutex<Registry>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("Manager")
            .field("global_limit", &registry.global_limit)
            .field("allocation", &registry.allocation)
            .field("caches", &registry.caches.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Returns a builder with default settings.
    #[must_use]
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Returns a builder for a cache managed by this manager.
    #[must_use]
    pub fn cache_builder(self: &Arc<Self>) -> CacheBuilder {
        CacheBuilder::new(Arc::clone(self))
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The transaction manager whose term governs banishing in transactional caches.
    #[must_use]
    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Opens a transaction. Shorthand for `self.transactions().begin(read_only)`.
    #[must_use]
    pub fn begin_transaction(&self, read_only: bool) -> Transaction<'_> {
        self.transactions.begin(read_only)
    }

    /// Admits a cache, allocating its limit and initial table from the budget.
    pub(crate) fn register(
        &self,
        cache: Weak<Cache>,
        limit: u64,
        allow_growth: bool,
        on_destroy: Option<Deleter>,
    ) -> Result<Registered, RegistrationError> {
        let limit = limit.max(self.settings.min_cache_limit);
        let log_size = self.settings.initial_log_size;
        let table_memory = Table::memory_for(log_size);
        let requested = limit.saturating_add(table_memory);

        let mut registry = self.registry.lock();
        let available = if registry.accepting { registry.available() } else { 0 };
        if requested > available {
            return Err(RegistrationError::new(requested, available));
        }

        registry.next_id += 1;
        let id = CacheId(registry.next_id);
        let metadata = Arc::new(Metadata::new(limit, log_size, table_memory));
        registry.allocation += requested;
        registry.caches.insert(
            id,
            Registration {
                cache,
                metadata: Arc::clone(&metadata),
                allow_growth,
                on_destroy,
            },
        );
        drop(registry);

        event!(Level::DEBUG, cache.id = %id, limit, log_size, "cache registered");
        Ok(Registered { id, metadata, log_size })
    }

    /// Removes a cache and returns its allocation to the budget.
    ///
    /// Hands back the deleter so the caller can run it once no cache lock is held.
    #[must_use]
    pub(crate) fn unregister(&self, id: CacheId) -> Option<Deleter> {
        let removed = {
            let mut registry = self.registry.lock();
            let removed = registry.caches.remove(&id);
            if let Some(registration) = &removed {
                let allocation = registration.metadata.lock().allocation();
                registry.release(allocation);
            }
            removed
        };

        let registration = removed?;
        event!(Level::DEBUG, cache.id = %id, "cache unregistered");
        registration.on_destroy
    }

    /// Decides a resize and carries it out.
    ///
    /// Growth is granted when the budget can cover it. A shrink below current usage lowers the
    /// soft limit first, evicts down to it, and only then lowers the hard limit. If leased
    /// entries keep usage above the new limit the soft limit is put back and nothing changes.
    pub(crate) fn request_resize(&self, cache: &Cache, new_limit: u64) -> bool {
        let new_limit = new_limit.max(self.settings.min_cache_limit);
        let next_request = self.clock.instant() + self.settings.resize_cooldown;
        let previous_soft;

        {
            let mut registry = self.registry.lock();
            if !registry.caches.contains_key(&cache.id()) {
                return false;
            }

            let mut metadata = cache.metadata().lock();
            metadata.set_next_resize_request(next_request);
            let hard = metadata.hard_limit();

            if new_limit > hard {
                let extra = new_limit - hard;
                if extra > registry.available() {
                    event!(Level::DEBUG, cache.id = %cache.id(), limit = new_limit, "resize rejected");
                    return false;
                }
                registry.allocation += extra;
                let resized = metadata.adjust_limits(new_limit, new_limit);
                drop(metadata);
                drop(registry);
                event!(Level::DEBUG, cache.id = %cache.id(), limit = new_limit, "cache grown");
                return resized;
            }

            if new_limit == hard {
                return false;
            }

            if metadata.adjust_limits(new_limit, new_limit) {
                registry.release(hard - new_limit);
                drop(metadata);
                drop(registry);
                event!(Level::DEBUG, cache.id = %cache.id(), limit = new_limit, "cache shrunk");
                return true;
            }

            previous_soft = metadata.soft_limit();
            metadata.set_soft_limit(new_limit);
            metadata.set_resizing(true);
        }

        cache.free_memory(new_limit);

        let mut registry = self.registry.lock();
        let mut metadata = cache.metadata().lock();
        metadata.set_resizing(false);
        let hard = metadata.hard_limit();
        let shrunk = metadata.adjust_limits(new_limit, new_limit);
        if !shrunk {
            // Leased entries kept usage above the new limit.
            metadata.set_soft_limit(previous_soft);
        } else if registry.caches.contains_key(&cache.id()) {
            registry.release(hard.saturating_sub(new_limit));
        }
        drop(metadata);
        drop(registry);

        event!(Level::DEBUG, cache.id = %cache.id(), limit = new_limit, shrunk, "cache shrink finished");
        shrunk
    }

    /// Decides a migration to a table of `2^log_size` buckets and dispatches it.
    ///
    /// The new table is reserved in the budget before the migration starts.
    pub(crate) fn request_migrate(&self, cache: &Cache, log_size: u32) -> bool {
        if !(self.settings.min_log_size..=self.settings.max_log_size).contains(&log_size) {
            return false;
        }

        let table_memory = Table::memory_for(log_size);
        let next_request = self.clock.instant() + self.settings.migrate_cooldown;

        {
            let mut registry = self.registry.lock();
            if !registry.caches.contains_key(&cache.id()) {
                return false;
            }

            let mut metadata = cache.metadata().lock();
            if metadata.is_migrating() || metadata.log_size() == log_size {
                return false;
            }
            metadata.set_next_migrate_request(next_request);

            if table_memory > registry.available() {
                event!(Level::DEBUG, cache.id = %cache.id(), log_size, "migration rejected");
                return false;
            }

            registry.allocation += table_memory;
            metadata.reserve_table(table_memory);
            metadata.set_migrating(true);
        }

        if !self.settings.background_tasks {
            cache.migrate(log_size);
            return true;
        }

        let Some(operation) = cache.start_detached_operation() else {
            self.finish_migration(cache, None);
            return false;
        };

        let spawned = std::thread::Builder::new()
            .name("quota-cache-migrate".to_owned())
            .spawn(move || operation.cache().migrate(log_size));
        match spawned {
            Ok(_) => true,
            Err(error) => {
                warn!(cache.id = %cache.id(), %error, "failed to spawn migration thread");
                self.finish_migration(cache, None);
                false
            }
        }
    }

    /// Settles the budget after a migration. `None` means it never ran.
    pub(crate) fn finish_migration(&self, cache: &Cache, outcome: Option<MigrationOutcome>) {
        let mut registry = self.registry.lock();
        let registered = registry.caches.contains_key(&cache.id());
        let mut metadata = cache.metadata().lock();

        match outcome {
            Some(outcome) => {
                metadata.change_table(outcome.log_size, Table::memory_for(outcome.log_size));
                metadata.release_usage(outcome.released);
                if registered {
                    registry.release(outcome.old_table_memory);
                }
            }
            None => {
                let pending = metadata.pending_table_memory();
                metadata.reserve_table(0);
                if registered {
                    registry.release(pending);
                }
            }
        }
        metadata.set_migrating(false);
    }

    /// Moves quota from idle caches to caches under eviction pressure.
    ///
    /// Caches using less than a quarter of their limit, and not starved, are shrunk to twice
    /// their usage. Caches that allow growth and whose recent outcomes are at least a quarter
    /// evictions may then double, as far as the freed budget allows. Only one cache's
    /// accounting is locked at a time.
    pub fn rebalance(&self) -> RebalanceReport {
        let candidates: Vec<(CacheId, Weak<Cache>, bool)> = self
            .registry
            .lock()
            .caches
            .iter()
            .map(|(id, registration)| (*id, registration.cache.clone(), registration.allow_growth))
            .collect();

        let mut report = RebalanceReport::default();

        for (id, weak, _) in &candidates {
            let Some(cache) = weak.upgrade() else {
                continue;
            };
            if cache.eviction_pressure() >= GROWTH_PRESSURE {
                continue;
            }
            let mut registry = self.registry.lock();
            if !registry.caches.contains_key(id) {
                continue;
            }
            let mut metadata = cache.metadata().lock();
            if metadata.is_resizing() || metadata.is_migrating() {
                continue;
            }

            let hard = metadata.hard_limit();
            let usage = metadata.usage();
            if usage.saturating_mul(4) >= hard {
                continue;
            }
            let target = usage.saturating_mul(2).max(self.settings.min_cache_limit);
            if target < hard && metadata.adjust_limits(target, target) {
                registry.release(hard - target);
                report.shrunk += 1;
                report.reclaimed += hard - target;
            }
        }

        for (id, weak, allow_growth) in &candidates {
            if !allow_growth {
                continue;
            }
            let Some(cache) = weak.upgrade() else {
                continue;
            };
            if cache.eviction_pressure() < GROWTH_PRESSURE {
                continue;
            }

            let mut registry = self.registry.lock();
            if !registry.caches.contains_key(id) {
                continue;
            }
            let mut metadata = cache.metadata().lock();
            if metadata.is_resizing() || metadata.is_migrating() {
                continue;
            }

            let hard = metadata.hard_limit();
            let extra = hard.min(registry.available());
            if extra > 0 && metadata.adjust_limits(hard + extra, hard + extra) {
                registry.allocation += extra;
                report.grown += 1;
                report.granted += extra;
            }
        }

        event!(
            Level::DEBUG,
            shrunk = report.shrunk,
            reclaimed = report.reclaimed,
            grown = report.grown,
            granted = report.granted,
            "rebalanced"
        );
        report
    }

    /// Runs [`rebalance`](Self::rebalance) every `interval` on a background thread until the
    /// returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns the error of spawning the thread.
    pub fn spawn_rebalancer(self: &Arc<Self>, interval: Duration) -> std::io::Result<Rebalancer> {
        Rebalancer::spawn(Arc::downgrade(self), interval)
    }

    /// Changes the global budget. Refused if current allocations do not fit.
    pub fn set_global_limit(&self, global_limit: u64) -> bool {
        let mut registry = self.registry.lock();
        if registry.allocation > global_limit {
            return false;
        }
        registry.global_limit = global_limit;
        drop(registry);

        event!(Level::DEBUG, global_limit, "global limit changed");
        true
    }

    /// Snapshot of the global accounting.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let registry = self.registry.lock();
        ManagerStats {
            global_limit: registry.global_limit,
            allocation: registry.allocation,
            caches: registry.caches.len(),
            usage: registry.caches.values().map(|registration| registration.metadata.lock().usage()).sum(),
        }
    }

    /// Shuts down every registered cache and refuses further registrations.
    pub fn shutdown(&self) {
        let caches: Vec<Weak<Cache>> = {
            let mut registry = self.registry.lock();
            registry.accepting = false;
            registry.caches.values().map(|registration| registration.cache.clone()).collect()
        };

        let count = caches.len();
        for cache in caches.iter().filter_map(Weak::upgrade) {
            cache.shutdown();
        }
        event!(Level::DEBUG, caches = count, "manager shut down");
    }
}

/// Aggregate accounting of a [`Manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    /// The global budget in bytes.
    pub global_limit: u64,
    /// Bytes allocated to caches, limits and tables included.
    pub allocation: u64,
    /// Number of registered caches.
    pub caches: usize,
    /// Sum of the usage of all registered caches.
    pub usage: u64,
}

/// What a [`Manager::rebalance`] pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Caches whose limit was lowered.
    pub shrunk: usize,
    /// Bytes returned to the budget by shrinking.
    pub reclaimed: u64,
    /// Caches whose limit was raised.
    pub grown: usize,
    /// Bytes handed out by growing.
    pub granted: u64,
}

/// Builder for a [`Manager`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use quota_cache::Manager;
///
/// let manager = Manager::builder()
///     .global_limit(512 * 1024 * 1024)
///     .initial_log_size(10)
///     .resize_cooldown(Duration::from_millis(10))
///     .build();
/// assert_eq!(manager.stats().global_limit, 512 * 1024 * 1024);
/// ```
#[derive(Debug)]
pub struct ManagerBuilder {
    global_limit: u64,
    settings: Settings,
    clock: Option<Clock>,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Defaults:
    /// - `global_limit`: 256 MiB
    /// - `min_cache_limit`: 4 KiB
    /// - `min_log_size` / `initial_log_size` / `max_log_size`: 4 / 8 / 24
    /// - `resize_cooldown`: 100 ms, `migrate_cooldown`: 1 s
    /// - `internal_lock_tries`: 10
    /// - `migrate_sample_mask`: `0xFFF`
    /// - `sampler_capacity`: 1024
    /// - `background_tasks`: off
    #[must_use]
    pub fn new() -> Self {
        Self {
            global_limit: 256 * 1024 * 1024,
            settings: Settings {
                min_cache_limit: 4 * 1024,
                min_log_size: 4,
                max_log_size: 24,
                initial_log_size: 8,
                resize_cooldown: Duration::from_millis(100),
                migrate_cooldown: Duration::from_secs(1),
                internal_lock_tries: 10,
                migrate_sample_mask: 0xFFF,
                sampler_capacity: 1024,
                background_tasks: false,
            },
            clock: None,
        }
    }

    /// Sets the global budget in bytes.
    #[must_use]
    pub const fn global_limit(mut self, bytes: u64) -> Self {
        self.global_limit = bytes;
        self
    }

    /// Sets the smallest limit a cache is given or shrunk to.
    #[must_use]
    pub const fn min_cache_limit(mut self, bytes: u64) -> Self {
        self.settings.min_cache_limit = bytes;
        self
    }

    /// Sets the smallest table size exponent a migration may target.
    #[must_use]
    pub const fn min_log_size(mut self, log_size: u32) -> Self {
        self.settings.min_log_size = log_size;
        self
    }

    /// Sets the largest table size exponent a migration may target.
    #[must_use]
    pub const fn max_log_size(mut self, log_size: u32) -> Self {
        self.settings.max_log_size = log_size;
        self
    }

    /// Sets the table size exponent of new caches.
    #[must_use]
    pub const fn initial_log_size(mut self, log_size: u32) -> Self {
        self.settings.initial_log_size = log_size;
        self
    }

    /// Sets the minimum time between two resize requests of one cache.
    #[must_use]
    pub const fn resize_cooldown(mut self, cooldown: Duration) -> Self {
        self.settings.resize_cooldown = cooldown;
        self
    }

    /// Sets the minimum time between two migration requests of one cache.
    #[must_use]
    pub const fn migrate_cooldown(mut self, cooldown: Duration) -> Self {
        self.settings.migrate_cooldown = cooldown;
        self
    }

    /// Sets how often opportunistic paths try the state lock before giving up.
    #[must_use]
    pub const fn internal_lock_tries(mut self, tries: u32) -> Self {
        self.settings.internal_lock_tries = tries;
        self
    }

    /// Sets the insertion sampling mask of the migration heuristic.
    ///
    /// The heuristic runs on every `mask + 1`-th insertion. Values that are not of the form
    /// `2^k - 1` are rounded up to the next one.
    #[must_use]
    pub const fn migrate_sample_mask(mut self, mask: u64) -> Self {
        self.settings.migrate_sample_mask = mask;
        self
    }

    /// Sets how many recent outcomes each cache samples.
    #[must_use]
    pub const fn sampler_capacity(mut self, capacity: usize) -> Self {
        self.settings.sampler_capacity = capacity;
        self
    }

    /// Sets the clock used for rate limiting.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Runs migrations on a dedicated thread instead of on the inserting thread.
    #[must_use]
    pub const fn background_tasks(mut self, enabled: bool) -> Self {
        self.settings.background_tasks = enabled;
        self
    }

    /// Builds the manager.
    #[must_use]
    pub fn build(self) -> Arc<Manager> {
        let mut settings = self.settings;
        settings.max_log_size = settings.max_log_size.min(MAX_LOG_SIZE);
        settings.min_log_size = settings.min_log_size.min(settings.max_log_size);
        settings.initial_log_size = settings.initial_log_size.clamp(settings.min_log_size, settings.max_log_size);
        settings.internal_lock_tries = settings.internal_lock_tries.max(1);
        settings.migrate_sample_mask = settings
            .migrate_sample_mask
            .checked_add(1)
            .and_then(u64::checked_next_power_of_two)
            .map_or(u64::MAX, |boundary| boundary - 1);

        let clock = self
            .clock
            .unwrap_or_else(|| tick::runtime::InactiveClock::default().activate().0);

        Arc::new(Manager {
            settings,
            clock,
            transactions: TransactionManager::new(),
            registry: Mutex::new(Registry {
                global_limit: self.global_limit,
                allocation: 0,
                next_id: 0,
                accepting: true,
                caches: HashMap::new(),
            }),
        })
    }
}
