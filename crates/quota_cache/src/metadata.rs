// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-cache accounting record.
//!
//! The record is shared between a [`Cache`](crate::Cache) and the [`Manager`](crate::Manager)
//! registration that owns its quota. It is the middle lock tier: it may be taken while the
//! state lock is held, and bucket locks are never held while it is taken.

use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::state::StateGuard;

#[derive(Debug)]
pub(crate) struct Metadata {
    inner: Mutex<Accounting>,
}

#[derive(Debug)]
pub(crate) struct Accounting {
    soft_limit: u64,
    hard_limit: u64,
    usage: u64,
    log_size: u32,
    table_memory: u64,
    /// Memory reserved for a table that a running migration is filling.
    pending_table_memory: u64,
    /// Set only while the manager evicts down to a lowered soft limit. Suspends admission up
    /// to the hard limit.
    resizing: bool,
    /// Set from the manager granting a migration until it has settled the budget for it.
    migrating: bool,
    next_resize_request: Option<Instant>,
    next_migrate_request: Option<Instant>,
}

impl Metadata {
    pub fn new(limit: u64, log_size: u32, table_memory: u64) -> Self {
        Self {
            inner: Mutex::new(Accounting {
                soft_limit: limit,
                hard_limit: limit,
                usage: 0,
                log_size,
                table_memory,
                pending_table_memory: 0,
                resizing: false,
                migrating: false,
                next_resize_request: None,
                next_migrate_request: None,
            }),
        }
    }

    /// Locks the record without holding the state lock (manager-side paths).
    pub fn lock(&self) -> MetadataGuard<'_> {
        MetadataGuard(self.inner.lock())
    }

    /// Locks the record beneath a held state lock.
    pub fn lock_under<'a>(&'a self, _state: &'a StateGuard<'_>) -> MetadataGuard<'a> {
        self.lock()
    }
}

pub(crate) struct MetadataGuard<'a>(MutexGuard<'a, Accounting>);

impl MetadataGuard<'_> {
    pub fn soft_limit(&self) -> u64 {
        self.0.soft_limit
    }

    pub fn hard_limit(&self) -> u64 {
        self.0.hard_limit
    }

    pub fn usage(&self) -> u64 {
        self.0.usage
    }

    pub fn log_size(&self) -> u32 {
        self.0.log_size
    }

    pub fn table_memory(&self) -> u64 {
        self.0.table_memory
    }

    /// Bytes this cache holds against the global budget.
    pub fn allocation(&self) -> u64 {
        self.0.hard_limit + self.0.table_memory + self.0.pending_table_memory
    }

    pub fn pending_table_memory(&self) -> u64 {
        self.0.pending_table_memory
    }

    pub fn reserve_table(&mut self, table_memory: u64) {
        self.0.pending_table_memory = table_memory;
    }

    pub fn is_resizing(&self) -> bool {
        self.0.resizing
    }

    pub fn is_migrating(&self) -> bool {
        self.0.migrating
    }

    pub fn set_resizing(&mut self, value: bool) {
        self.0.resizing = value;
    }

    pub fn set_migrating(&mut self, value: bool) {
        self.0.migrating = value;
    }

    /// Applies a usage change unless it would break the limits.
    ///
    /// Releases always succeed. Growth is admitted up to the soft limit, or up to the hard
    /// limit when no shrink is in progress.
    pub fn adjust_usage_if_allowed(&mut self, delta: i64) -> bool {
        let magnitude = delta.unsigned_abs();
        if delta < 0 {
            self.0.usage = self.0.usage.saturating_sub(magnitude);
            return true;
        }

        let usage = self.0.usage.saturating_add(magnitude);
        if usage <= self.0.soft_limit || (usage <= self.0.hard_limit && !self.0.resizing) {
            self.0.usage = usage;
            true
        } else {
            false
        }
    }

    pub fn release_usage(&mut self, bytes: u64) {
        self.0.usage = self.0.usage.saturating_sub(bytes);
    }

    /// Sets both limits. Refused when `soft > hard` or current usage would exceed `hard`.
    pub fn adjust_limits(&mut self, soft: u64, hard: u64) -> bool {
        if soft > hard || self.0.usage > hard {
            return false;
        }
        self.0.soft_limit = soft;
        self.0.hard_limit = hard;
        true
    }

    /// Lowers only the soft limit, leaving the hard limit as the ceiling until usage drops.
    pub fn set_soft_limit(&mut self, soft: u64) {
        self.0.soft_limit = soft.min(self.0.hard_limit);
    }

    /// Installs a new table, consuming any reservation made for it.
    pub fn change_table(&mut self, log_size: u32, table_memory: u64) {
        self.0.log_size = log_size;
        self.0.table_memory = table_memory;
        self.0.pending_table_memory = 0;
    }

    pub fn resize_allowed_at(&self, now: Instant) -> bool {
        self.0.next_resize_request.is_none_or(|next| now >= next)
    }

    pub fn migrate_allowed_at(&self, now: Instant) -> bool {
        self.0.next_migrate_request.is_none_or(|next| now >= next)
    }

    pub fn set_next_resize_request(&mut self, at: Instant) {
        self.0.next_resize_request = Some(at);
    }

    pub fn set_next_migrate_request(&mut self, at: Instant) {
        self.0.next_migrate_request = Some(at);
    }
}
