// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transaction terms for transactional caches.
//!
//! The term is a counter that is odd while at least one write-sensitive transaction is open
//! and even otherwise. Banish markers in transactional buckets are stamped with the term in
//! which they were written and expire as soon as the term moves on, which happens when the
//! last sensitive transaction ends or the first one of a new batch begins.

use parking_lot::Mutex;

/// Tracks open transactions and the current term.
#[derive(Debug, Default)]
pub struct TransactionManager {
    counters: Mutex<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    open_reads: u64,
    open_writes: u64,
    open_sensitive: u64,
    term: u64,
}

impl TransactionManager {
    /// Creates a manager at term zero with no open transactions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction; it ends when the returned guard is dropped.
    ///
    /// Writing transactions are always sensitive. Read-only transactions become sensitive
    /// when they start while a writer is open, since they may observe its effects.
    ///
    /// # Examples
    ///
    /// ```
    /// use quota_cache::TransactionManager;
    ///
    /// let transactions = TransactionManager::new();
    /// assert_eq!(transactions.term(), 0);
    ///
    /// let writer = transactions.begin(false);
    /// assert_eq!(writer.term(), 1);
    /// drop(writer);
    ///
    /// assert_eq!(transactions.term(), 2);
    /// ```
    pub fn begin(&self, read_only: bool) -> Transaction<'_> {
        let mut counters = self.counters.lock();
        if read_only {
            counters.open_reads += 1;
        } else {
            counters.open_writes += 1;
        }

        let sensitive = !read_only || counters.open_writes > 0;
        if sensitive {
            counters.open_sensitive += 1;
            if counters.term % 2 == 0 {
                counters.term += 1;
            }
        }

        Transaction {
            manager: self,
            term: counters.term,
            read_only,
            sensitive,
        }
    }

    /// The current term.
    #[must_use]
    pub fn term(&self) -> u64 {
        self.counters.lock().term
    }

    /// Number of open transactions as `(read_only, writing)`.
    #[must_use]
    pub fn open_transactions(&self) -> (u64, u64) {
        let counters = self.counters.lock();
        (counters.open_reads, counters.open_writes)
    }

    fn end(&self, read_only: bool, sensitive: bool) {
        let mut counters = self.counters.lock();
        if read_only {
            counters.open_reads -= 1;
        } else {
            counters.open_writes -= 1;
        }

        if sensitive {
            counters.open_sensitive -= 1;
            if counters.open_sensitive == 0 && counters.term % 2 == 1 {
                counters.term += 1;
            }
        }
    }
}

/// An open transaction. Ends on drop.
#[derive(Debug)]
pub struct Transaction<'a> {
    manager: &'a TransactionManager,
    term: u64,
    read_only: bool,
    sensitive: bool,
}

impl Transaction<'_> {
    /// Term observed when the transaction began.
    #[must_use]
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Whether the transaction was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the transaction holds the term open.
    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.manager.end(self.read_only, self.sensitive);
    }
}
