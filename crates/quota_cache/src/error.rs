// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error and rejection types.
//!
//! Real failures (a cache that cannot be registered, a value that cannot be built) are
//! [`ohno`] errors. Outcomes that are expected under contention, such as an insert that
//! loses against the memory limit, are reported through the lightweight [`Rejected`] enum.

use std::fmt;

/// The [`Manager`](crate::Manager) refused to register a cache.
///
/// Cache creation never surfaces this error to the caller. The cache is created in the
/// permanently shut-down state instead and every operation on it becomes a no-op.
/// [`CacheBuilder::try_build`](crate::CacheBuilder::try_build) returns it for callers that
/// want to observe the refusal.
#[ohno::error]
#[display("cache registration refused: requested {requested} bytes with {available} bytes available")]
pub struct RegistrationError {
    requested: u64,
    available: u64,
}

impl RegistrationError {
    /// Number of bytes the registration asked for, including the initial table.
    #[must_use]
    pub fn requested(&self) -> u64 {
        self.requested
    }

    /// Number of bytes left in the global budget when the request was evaluated.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.available
    }
}

/// A [`CachedValue`](crate::CachedValue) could not be constructed.
#[ohno::error]
#[display("invalid cached value: {reason}")]
pub struct ValueError {
    reason: &'static str,
}

impl ValueError {
    /// Short description of the violated constraint.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// Why an insert had no effect.
///
/// All variants describe steady-state outcomes that callers are expected to handle, not
/// faults. The type implements [`std::error::Error`] so it composes with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejected {
    /// The cache is shutting down, shut down, or was never registered.
    NotOperational,
    /// The key is banished for the current transaction term.
    Banished,
    /// The memory limit could not accommodate the value even after eviction.
    OverLimit,
    /// Every slot of the target bucket is currently borrowed.
    Busy,
    /// The key or value violates the size constraints of a [`CachedValue`](crate::CachedValue).
    InvalidValue,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotOperational => "cache is not operational",
            Self::Banished => "key is banished for the current transaction term",
            Self::OverLimit => "cache memory limit reached",
            Self::Busy => "all candidate slots are in use",
            Self::InvalidValue => "key or value size out of range",
        };
        f.write_str(text)
    }
}

impl std::error::Error for Rejected {}
