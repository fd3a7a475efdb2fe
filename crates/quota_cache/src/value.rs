// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cached values and the leases handed out by lookups.
//!
//! A [`CachedValue`] lives behind an [`Arc`]. The bucket slot that stores it owns one
//! strong reference and every live [`Finding`] owns another. Evicting an entry only drops
//! the slot's reference, so the bytes are released exactly once, by whichever holder lets
//! go last. No spinning on a reference count is ever needed.

use std::sync::Arc;

use crate::error::ValueError;

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 0x00FF_FFFF;

/// Largest accepted value, in bytes.
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Fixed per-entry overhead charged on top of the key and value bytes.
const ENTRY_OVERHEAD: u64 = size_of::<CachedValue>() as u64;

/// An immutable key/value record, the unit of storage and of memory accounting.
///
/// # Examples
///
/// ```
/// use quota_cache::CachedValue;
///
/// let value = CachedValue::new(b"key", b"value").expect("sizes are valid");
/// assert_eq!(value.key(), b"key");
/// assert_eq!(value.value(), b"value");
/// assert!(value.size() > 8);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct CachedValue {
    key: Box<[u8]>,
    value: Box<[u8]>,
}

impl CachedValue {
    /// Builds a record from key and value bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError`] if the key is empty, the key exceeds [`MAX_KEY_SIZE`] bytes or
    /// the value exceeds [`MAX_VALUE_SIZE`] bytes.
    pub fn new(key: &[u8], value: &[u8]) -> Result<Self, ValueError> {
        if key.is_empty() {
            return Err(ValueError::new("key must not be empty"));
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(ValueError::new("key exceeds the maximum key size"));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(ValueError::new("value exceeds the maximum value size"));
        }

        Ok(Self {
            key: key.into(),
            value: value.into(),
        })
    }

    /// The key bytes.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value bytes.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Bytes charged against the owning cache for this record.
    #[must_use]
    pub fn size(&self) -> u64 {
        ENTRY_OVERHEAD + self.key.len() as u64 + self.value.len() as u64
    }

    /// Returns `true` if this record is stored under `key`.
    #[must_use]
    pub fn same_key(&self, key: &[u8]) -> bool {
        *self.key == *key
    }

    /// Deep copy, independent of any lease on the original.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

impl std::fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedValue")
            .field("key_len", &self.key.len())
            .field("value_len", &self.value.len())
            .field("size", &self.size())
            .finish()
    }
}

/// A lease on a [`CachedValue`] returned by [`Cache::lookup`](crate::Cache::lookup).
///
/// While a finding is alive the value it refers to stays readable, even if the entry is
/// evicted, replaced or its table is migrated away in the meantime. Cloning takes a new
/// lease; moving transfers it.
#[derive(Clone, Default)]
pub struct Finding {
    value: Option<Arc<CachedValue>>,
}

impl Finding {
    pub(crate) fn new(value: Option<Arc<CachedValue>>) -> Self {
        Self { value }
    }

    /// A finding that refers to nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns `true` if the lookup produced a value.
    #[must_use]
    pub fn found(&self) -> bool {
        self.value.is_some()
    }

    /// The borrowed value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&CachedValue> {
        self.value.as_deref()
    }

    /// Deep copy of the borrowed value, if any.
    #[must_use]
    pub fn copy(&self) -> Option<CachedValue> {
        self.value.as_deref().map(CachedValue::copy)
    }

    /// Releases the current lease and takes one on `other`'s value instead.
    pub fn reset(&mut self, other: &Self) {
        self.value.clone_from(&other.value);
    }

    /// Releases the current lease, leaving the finding empty.
    pub fn clear(&mut self) {
        self.value = None;
    }
}

impl std::fmt::Debug for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finding").field("value", &self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;

    #[test]
    fn rejects_invalid_sizes() {
        assert!(CachedValue::new(b"", b"value").is_err());
        let long_key = vec![7_u8; MAX_KEY_SIZE + 1];
        let error = CachedValue::new(&long_key, b"").expect_err("key is too long");
        assert_eq!(error.reason(), "key exceeds the maximum key size");
        assert!(CachedValue::new(b"k", b"").is_ok());
    }

    #[test]
    fn size_counts_key_value_and_overhead() {
        let value = CachedValue::new(b"abc", b"defgh").expect("valid");
        assert_eq!(value.size(), ENTRY_OVERHEAD + 8);
        assert!(value.same_key(b"abc"));
        assert!(!value.same_key(b"abd"));
    }

    #[test]
    fn finding_keeps_value_alive_after_owner_drops() {
        let owner = Arc::new(CachedValue::new(b"key", b"value").expect("valid"));
        let weak: Weak<CachedValue> = Arc::downgrade(&owner);

        let finding = Finding::new(Some(Arc::clone(&owner)));
        assert_eq!(Arc::strong_count(&owner), 2);

        // The bucket lets go of its reference.
        drop(owner);
        assert!(weak.upgrade().is_some());
        assert_eq!(finding.value().map(CachedValue::value), Some(&b"value"[..]));

        drop(finding);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn clone_takes_a_new_lease_and_move_does_not() {
        let owner = Arc::new(CachedValue::new(b"key", b"value").expect("valid"));
        let first = Finding::new(Some(Arc::clone(&owner)));
        let second = first.clone();
        assert_eq!(Arc::strong_count(&owner), 3);

        let moved = second;
        assert_eq!(Arc::strong_count(&owner), 3);

        let mut empty = Finding::none();
        assert!(!empty.found());
        empty.reset(&moved);
        assert!(empty.found());
        assert_eq!(Arc::strong_count(&owner), 4);

        empty.clear();
        drop(first);
        drop(moved);
        assert_eq!(Arc::strong_count(&owner), 1);
    }

    #[test]
    fn copy_is_independent() {
        let owner = Arc::new(CachedValue::new(b"key", b"value").expect("valid"));
        let finding = Finding::new(Some(Arc::clone(&owner)));
        let copy = finding.copy().expect("found");
        assert_eq!(Arc::strong_count(&owner), 2);
        assert_eq!(copy, *owner);
        assert!(Finding::none().copy().is_none());
    }
}
