// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Size-bounded concurrent byte caches that share a global memory budget.
//!
//! This crate provides [`Cache`], an in-process key/value cache for opaque byte strings, and
//! [`Manager`], which hands out memory to any number of caches from one global budget. It
//! combines several techniques:
//!
//! 1. **Quota Arbitration:** Every cache holds a hard limit allocated from the manager. Caches
//!    may ask for more under pressure, and idle caches can be shrunk to feed busy ones.
//! 2. **Bucketed Storage:** Entries live in a power-of-two table of small, independently
//!    locked buckets ordered by recency.
//! 3. **Online Migration:** Tables grow or shrink while serving requests. Readers consult the
//!    new table first and fall back to the old one until it has been drained.
//! 4. **Leased Values:** A lookup returns a [`Finding`], a counted lease that keeps the value
//!    alive after it has been evicted, replaced or removed.
//! 5. **Transactional Banishing:** [`CacheKind::Transactional`] caches refuse to re-insert a
//!    banished key until the [`TransactionManager`] term moves on.
//!
//! # Architecture
//!
//! Each cache carries three tiers of locks, always taken in this order:
//!
//! - **State:** lifecycle (operational, shutting down, shut down) and the structural flags.
//!   Every operation registers itself here so shutdown can drain it.
//! - **Accounting:** usage and limits, shared with the manager.
//! - **Bucket:** one lock per bucket, taken last and never held while calling out.
//!
//! The manager's registry lock sits between the first two. Inserts charge their size before
//! the value is placed and release whatever was replaced or evicted afterwards, so usage
//! equals the summed sizes of the owned values once the cache is quiescent.
//!
//! When an insert cannot be admitted the cache first evicts least recently used entries that
//! nobody is borrowing, and, if growth is allowed, asks the manager for double its limit.
//! Every 4096th insertion the cache inspects a sample of recent outcomes; if evictions clearly
//! dominate, it asks the manager for a table twice as large.
//!
//! # Performance Characteristics
//!
//! | Metric | Complexity | Notes |
//! | :--- | :--- | :--- |
//! | **Lookup** | $O(1)$ | One bucket lock, two during a migration. |
//! | **Insertion** | Amortized $O(1)$ | Includes potential eviction within the bucket. |
//! | **Free memory** | $O(n)$ buckets | Only when the soft limit is reached. |
//! | **Migration** | $O(n)$ entries | Runs inline or on a background thread. |
//! | **Concurrency** | Per-bucket `Mutex` | Buckets are cache-line aligned. |
//!
//! # Example
//!
//! ```
//! use quota_cache::{Manager, Rejected};
//!
//! let manager = Manager::builder().global_limit(16 * 1024 * 1024).build();
//! let cache = manager.cache_builder().limit(1024 * 1024).build();
//!
//! cache.insert(b"user:1", b"alice")?;
//!
//! let finding = cache.lookup(b"user:1");
//! assert!(finding.found());
//!
//! // The lease stays valid after removal.
//! assert!(cache.remove(b"user:1"));
//! assert_eq!(finding.value().map(|v| v.value()), Some(&b"alice"[..]));
//! assert!(!cache.lookup(b"user:1").found());
//!
//! cache.shutdown();
//! assert_eq!(cache.insert(b"user:2", b"bob"), Err(Rejected::NotOperational));
//! # Ok::<(), Rejected>(())
//! ```
//!
//! # Transactional Caches
//!
//! ```
//! use quota_cache::{CacheKind, Manager, Rejected};
//!
//! let manager = Manager::builder().build();
//! let cache = manager.cache_builder().kind(CacheKind::Transactional).build();
//!
//! let writer = manager.begin_transaction(false);
//! cache.banish(b"row:7");
//! assert_eq!(cache.insert(b"row:7", b"stale"), Err(Rejected::Banished));
//! drop(writer);
//!
//! assert_eq!(cache.insert(b"row:7", b"fresh"), Ok(()));
//! ```

mod bucket;
mod builder;
mod cache;
mod error;
mod frequency;
mod manager;
mod metadata;
mod rebalancer;
mod state;
mod table;
mod transaction;
mod value;

pub use bucket::CacheKind;
pub use builder::CacheBuilder;
pub use cache::{Cache, CacheStats, hash_key};
pub use error::{RegistrationError, Rejected, ValueError};
pub use frequency::Stat;
pub use manager::{CacheId, Manager, ManagerBuilder, ManagerStats, RebalanceReport};
pub use rebalancer::Rebalancer;
pub use transaction::{Transaction, TransactionManager};
pub use value::{CachedValue, Finding, MAX_KEY_SIZE, MAX_VALUE_SIZE};

#[cfg(test)]
mod tests;
