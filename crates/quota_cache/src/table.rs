// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bucket tables.
//!
//! A table is `2^log_size` independently locked buckets. A key's bucket is selected by the
//! top `log_size` bits of its hash, so growing a table by one step splits every bucket into
//! two adjacent ones.
//!
//! Bucket locks are the lowest lock tier. They are only reachable through closures
//! ([`Table::with_bucket`]), which keeps each critical section confined to bucket data.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bucket::{Adoption, BUCKET_BYTES, Bucket, CacheKind};
use crate::value::CachedValue;

/// Largest supported table, one bucket per hash value.
pub(crate) const MAX_LOG_SIZE: u32 = 32;

/// A bucket padded to its own cache line so neighbouring locks do not share one.
#[repr(align(64))]
#[derive(Debug)]
struct BucketCell(Mutex<Bucket>);

#[derive(Debug)]
pub(crate) struct Table {
    log_size: u32,
    buckets: Box<[BucketCell]>,
}

/// Result of draining one table into another.
#[derive(Debug, Default)]
pub(crate) struct MigrationSummary {
    /// Entries that now live in the target table.
    pub moved: usize,
    /// Values that left the cache during the move (stale, banished or evicted).
    pub released: Vec<Arc<CachedValue>>,
}

impl Table {
    pub fn new(kind: CacheKind, log_size: u32) -> Self {
        let log_size = log_size.min(MAX_LOG_SIZE);
        let buckets = (0..Self::bucket_count(log_size))
            .map(|_| BucketCell(Mutex::new(Bucket::new(kind))))
            .collect();
        Self { log_size, buckets }
    }

    fn bucket_count(log_size: u32) -> usize {
        1_usize << log_size
    }

    /// Bytes a table of the given size charges against the global budget.
    pub fn memory_for(log_size: u32) -> u64 {
        (1_u64 << log_size.min(MAX_LOG_SIZE)) * BUCKET_BYTES
    }

    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    pub fn memory_usage(&self) -> u64 {
        Self::memory_for(self.log_size)
    }

    pub fn bucket_len(&self) -> usize {
        self.buckets.len()
    }

    fn index_of(&self, hash: u32) -> usize {
        hash.checked_shr(MAX_LOG_SIZE - self.log_size).unwrap_or(0) as usize
    }

    /// Runs `f` with the bucket responsible for `hash` locked.
    pub fn with_bucket<R>(&self, hash: u32, f: impl FnOnce(&mut Bucket) -> R) -> R {
        self.with_bucket_at(self.index_of(hash), f)
    }

    /// Runs `f` with the bucket at `index` locked.
    pub fn with_bucket_at<R>(&self, index: usize, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let mut bucket = self.buckets[index].0.lock();
        f(&mut bucket)
    }

    /// Number of stored entries. Locks every bucket in turn.
    pub fn entries(&self) -> usize {
        self.buckets.iter().map(|cell| cell.0.lock().len()).sum()
    }

    /// Moves every entry and banish marker into `target`, bucket by bucket.
    ///
    /// Each source bucket stays locked while its contents are placed, and is marked migrated
    /// before it is released. A reader that finds a key in neither table can therefore
    /// detect the race by the migrated flag and retry against `target`.
    pub fn migrate_into(&self, target: &Self, term: u64) -> MigrationSummary {
        let mut summary = MigrationSummary::default();

        for (index, cell) in self.buckets.iter().enumerate() {
            let mut source = cell.0.lock();
            let drained = source.drain(term);

            // Oldest first so that the most recent entry ends closest to the front.
            for slot in drained.slots.into_iter().rev() {
                match target.with_bucket(slot.hash, |bucket| bucket.adopt(slot.hash, slot.value, term)) {
                    Adoption::Stored { evicted } => {
                        summary.moved += 1;
                        summary.released.extend(evicted);
                    }
                    Adoption::Dropped(value) => summary.released.push(value),
                }
            }

            if drained.fully_banished {
                for target_index in self.target_range(index, target) {
                    target.with_bucket_at(target_index, |bucket| bucket.banish_all(term));
                }
            } else {
                for hash in drained.banished {
                    target.with_bucket(hash, |bucket| bucket.banish_hash(hash, term));
                }
            }

            drop(source);
        }

        summary
    }

    /// Buckets of `target` that cover the hash range of our bucket `index`.
    fn target_range(&self, index: usize, target: &Self) -> std::ops::Range<usize> {
        if target.log_size >= self.log_size {
            let shift = target.log_size - self.log_size;
            (index << shift)..((index + 1) << shift)
        } else {
            let start = index >> (self.log_size - target.log_size);
            start..start + 1
        }
    }

    /// Empties every bucket, returning the values for accounting.
    pub fn clear(&self) -> Vec<Arc<CachedValue>> {
        self.buckets.iter().flat_map(|cell| cell.0.lock().clear()).collect()
    }
}
