// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bucket disciplines.
//!
//! A bucket is a handful of slots kept in recency order (slot 0 is the most recently used).
//! The set of disciplines is closed, so it is modelled as the [`Bucket`] enum:
//!
//! - [`Bucket::Plain`] stores entries and nothing else.
//! - [`Bucket::Transactional`] stores fewer entries and additionally keeps banish markers,
//!   which refuse re-insertion of keys written by transactions of the current term.
//!
//! Buckets never touch accounting. Every operation hands displaced values back to the
//! caller, who adjusts usage after the bucket lock has been released.

use std::sync::Arc;

use crate::error::Rejected;
use crate::value::CachedValue;

/// Entry slots of a plain bucket.
pub(crate) const PLAIN_SLOTS: usize = 5;

/// Entry slots of a transactional bucket.
pub(crate) const TRANSACTIONAL_SLOTS: usize = 3;

/// Banish marker slots of a transactional bucket.
pub(crate) const BANISH_SLOTS: usize = 4;

/// Bytes charged against the global budget for each bucket of a table.
pub(crate) const BUCKET_BYTES: u64 = 64;

/// Which bucket discipline a cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheKind {
    /// Plain key/value buckets.
    #[default]
    Plain,
    /// Buckets with banish markers for transactional isolation.
    Transactional,
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub hash: u32,
    pub value: Arc<CachedValue>,
}

impl Slot {
    fn matches(&self, hash: u32, key: &[u8]) -> bool {
        self.hash == hash && self.value.same_key(key)
    }

    /// Only the bucket holds this value.
    fn is_unborrowed(&self) -> bool {
        Arc::strong_count(&self.value) == 1
    }
}

/// Values pushed out of a bucket by an insertion.
#[derive(Debug, Default)]
pub(crate) struct Displaced {
    /// Previous value stored under the same key.
    pub replaced: Option<Arc<CachedValue>>,
    /// Least recently used value evicted to make room.
    pub evicted: Option<Arc<CachedValue>>,
}

/// What a migration did with an incoming entry.
#[derive(Debug)]
pub(crate) enum Adoption {
    /// Stored; possibly evicting a resident value.
    Stored { evicted: Option<Arc<CachedValue>> },
    /// Not stored, because a newer value exists, the key is banished, or the bucket is pinned.
    Dropped(Arc<CachedValue>),
}

/// Contents removed from a bucket by migration.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    /// Entries, most recently used first.
    pub slots: Vec<Slot>,
    pub banished: Vec<u32>,
    pub fully_banished: bool,
}

/// Slots in recency order.
#[derive(Debug)]
struct Entries {
    slots: Vec<Slot>,
    capacity: usize,
}

impl Entries {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn position(&self, hash: u32, key: &[u8]) -> Option<usize> {
        self.slots.iter().position(|slot| slot.matches(hash, key))
    }

    fn promote(&mut self, index: usize) {
        self.slots[..=index].rotate_right(1);
    }

    fn find(&mut self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        let index = self.position(hash, key)?;
        self.promote(index);
        Some(Arc::clone(&self.slots[0].value))
    }

    fn contains(&self, hash: u32, key: &[u8]) -> bool {
        self.position(hash, key).is_some()
    }

    fn remove(&mut self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        let index = self.position(hash, key)?;
        Some(self.slots.remove(index).value)
    }

    /// Removes the least recently used value nobody else is holding.
    fn evict(&mut self) -> Option<Arc<CachedValue>> {
        let index = self.slots.iter().rposition(Slot::is_unborrowed)?;
        Some(self.slots.remove(index).value)
    }

    fn insert(&mut self, hash: u32, value: Arc<CachedValue>) -> Result<Displaced, Rejected> {
        if let Some(index) = self.position(hash, value.key()) {
            self.promote(index);
            let replaced = std::mem::replace(&mut self.slots[0].value, value);
            return Ok(Displaced {
                replaced: Some(replaced),
                evicted: None,
            });
        }

        let mut displaced = Displaced::default();
        if self.slots.len() >= self.capacity {
            displaced.evicted = Some(self.evict().ok_or(Rejected::Busy)?);
        }
        self.slots.insert(0, Slot { hash, value });
        Ok(displaced)
    }

    /// Stores a migrated entry behind the resident ones, never replacing a resident value.
    fn adopt(&mut self, hash: u32, value: Arc<CachedValue>) -> Adoption {
        if self.contains(hash, value.key()) {
            return Adoption::Dropped(value);
        }

        let mut evicted = None;
        if self.slots.len() >= self.capacity {
            match self.evict() {
                Some(victim) => evicted = Some(victim),
                None => return Adoption::Dropped(value),
            }
        }
        self.slots.push(Slot { hash, value });
        Adoption::Stored { evicted }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Entries only.
#[derive(Debug)]
pub(crate) struct PlainBucket {
    entries: Entries,
    migrated: bool,
}

/// Entries plus banish markers valid for a single transaction term.
#[derive(Debug)]
pub(crate) struct TransactionalBucket {
    entries: Entries,
    migrated: bool,
    banish_term: u64,
    banished: Vec<u32>,
    fully_banished: bool,
}

impl TransactionalBucket {
    /// Forgets markers written in an earlier term.
    fn refresh_term(&mut self, term: u64) {
        if term > self.banish_term {
            self.banished.clear();
            self.fully_banished = false;
            self.banish_term = term;
        }
    }

    fn is_banished(&self, hash: u32) -> bool {
        self.fully_banished || self.banished.contains(&hash)
    }

    fn mark(&mut self, hash: u32) {
        if self.fully_banished || self.banished.contains(&hash) {
            return;
        }
        if self.banished.len() < BANISH_SLOTS {
            self.banished.push(hash);
        } else {
            self.fully_banished = true;
            self.banished.clear();
        }
    }
}

#[derive(Debug)]
pub(crate) enum Bucket {
    Plain(PlainBucket),
    Transactional(TransactionalBucket),
}

impl Bucket {
    pub fn new(kind: CacheKind) -> Self {
        match kind {
            CacheKind::Plain => Self::Plain(PlainBucket {
                entries: Entries::new(PLAIN_SLOTS),
                migrated: false,
            }),
            CacheKind::Transactional => Self::Transactional(TransactionalBucket {
                entries: Entries::new(TRANSACTIONAL_SLOTS),
                migrated: false,
                banish_term: 0,
                banished: Vec::with_capacity(BANISH_SLOTS),
                fully_banished: false,
            }),
        }
    }

    fn entries(&self) -> &Entries {
        match self {
            Self::Plain(bucket) => &bucket.entries,
            Self::Transactional(bucket) => &bucket.entries,
        }
    }

    fn entries_mut(&mut self) -> &mut Entries {
        match self {
            Self::Plain(bucket) => &mut bucket.entries,
            Self::Transactional(bucket) => &mut bucket.entries,
        }
    }

    /// The bucket was drained by a migration; its table is retiring.
    pub fn is_migrated(&self) -> bool {
        match self {
            Self::Plain(bucket) => bucket.migrated,
            Self::Transactional(bucket) => bucket.migrated,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn find(&mut self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        self.entries_mut().find(hash, key)
    }

    pub fn insert(&mut self, hash: u32, value: Arc<CachedValue>, term: u64) -> Result<Displaced, Rejected> {
        if let Self::Transactional(bucket) = self {
            bucket.refresh_term(term);
            if bucket.is_banished(hash) {
                return Err(Rejected::Banished);
            }
        }
        self.entries_mut().insert(hash, value)
    }

    /// Whether inserts of `hash` are refused during `term`.
    pub fn is_banished(&mut self, hash: u32, term: u64) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Transactional(bucket) => {
                bucket.refresh_term(term);
                bucket.is_banished(hash)
            }
        }
    }

    pub fn remove(&mut self, hash: u32, key: &[u8]) -> Option<Arc<CachedValue>> {
        self.entries_mut().remove(hash, key)
    }

    /// Removes `key` and, for transactional buckets, banishes it for `term`.
    pub fn banish(&mut self, hash: u32, key: &[u8], term: u64) -> Option<Arc<CachedValue>> {
        if let Self::Transactional(bucket) = self {
            bucket.refresh_term(term);
            bucket.mark(hash);
        }
        self.remove(hash, key)
    }

    /// Banishes a hash without touching entries (migration of markers).
    pub fn banish_hash(&mut self, hash: u32, term: u64) {
        if let Self::Transactional(bucket) = self {
            bucket.refresh_term(term);
            bucket.mark(hash);
        }
    }

    /// Banishes every key of this bucket for `term`.
    pub fn banish_all(&mut self, term: u64) {
        if let Self::Transactional(bucket) = self {
            bucket.refresh_term(term);
            bucket.fully_banished = true;
            bucket.banished.clear();
        }
    }

    pub fn evict(&mut self) -> Option<Arc<CachedValue>> {
        self.entries_mut().evict()
    }

    pub fn adopt(&mut self, hash: u32, value: Arc<CachedValue>, term: u64) -> Adoption {
        if let Self::Transactional(bucket) = self {
            bucket.refresh_term(term);
            if bucket.is_banished(hash) {
                return Adoption::Dropped(value);
            }
        }
        self.entries_mut().adopt(hash, value)
    }

    /// Empties the bucket for migration and marks it migrated.
    ///
    /// Markers from an earlier term than `term` are already expired and are not carried over.
    pub fn drain(&mut self, term: u64) -> Drained {
        match self {
            Self::Plain(bucket) => {
                bucket.migrated = true;
                Drained {
                    slots: std::mem::take(&mut bucket.entries.slots),
                    ..Drained::default()
                }
            }
            Self::Transactional(bucket) => {
                bucket.refresh_term(term);
                bucket.migrated = true;
                Drained {
                    slots: std::mem::take(&mut bucket.entries.slots),
                    banished: std::mem::take(&mut bucket.banished),
                    fully_banished: std::mem::replace(&mut bucket.fully_banished, false),
                }
            }
        }
    }

    /// Drops every entry, returning them for accounting.
    pub fn clear(&mut self) -> Vec<Arc<CachedValue>> {
        self.entries_mut().slots.drain(..).map(|slot| slot.value).collect()
    }
}
