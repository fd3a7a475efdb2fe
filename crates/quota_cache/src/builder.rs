// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::bucket::CacheKind;
use crate::cache::Cache;
use crate::error::RegistrationError;
use crate::manager::{CacheId, Deleter, Manager};

/// Builder for a [`Cache`] registered with a [`Manager`].
///
/// # Examples
///
/// ```
/// use quota_cache::{CacheKind, Manager};
///
/// let manager = Manager::builder().build();
/// let cache = manager
///     .cache_builder()
///     .kind(CacheKind::Transactional)
///     .limit(4 * 1024 * 1024)
///     .allow_growth(true)
///     .on_destroy(|id| println!("cache {id} released"))
///     .build();
///
/// assert_eq!(cache.kind(), CacheKind::Transactional);
/// assert_eq!(cache.limit(), 4 * 1024 * 1024);
/// ```
pub struct CacheBuilder {
    manager: Arc<Manager>,
    kind: CacheKind,
    limit: u64,
    allow_growth: bool,
    on_destroy: Option<Deleter>,
}

impl fmt::Debug for CacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("kind", &self.kind)
            .field("limit", &self.limit)
            .field("allow_growth", &self.allow_growth)
            .field("on_destroy", &self.on_destroy.is_some())
            .finish_non_exhaustive()
    }
}

impl CacheBuilder {
    /// Defaults:
    /// - `kind`: [`CacheKind::Plain`]
    /// - `limit`: 1 MiB
    /// - `allow_growth`: false
    pub(crate) fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            kind: CacheKind::Plain,
            limit: 1024 * 1024,
            allow_growth: false,
            on_destroy: None,
        }
    }

    /// Sets the bucket discipline.
    #[must_use]
    pub const fn kind(mut self, kind: CacheKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the initial limit in bytes. Raised to the manager's minimum if smaller.
    #[must_use]
    pub const fn limit(mut self, bytes: u64) -> Self {
        self.limit = bytes;
        self
    }

    /// Lets the cache ask for more memory when it runs full.
    #[must_use]
    pub const fn allow_growth(mut self, allow: bool) -> Self {
        self.allow_growth = allow;
        self
    }

    /// Registers a callback run once the cache has been unregistered.
    #[must_use]
    pub fn on_destroy(mut self, on_destroy: impl FnOnce(CacheId) + Send + 'static) -> Self {
        self.on_destroy = Some(Box::new(on_destroy));
        self
    }

    /// Builds the cache.
    ///
    /// If the manager refuses the registration the failure is logged and the returned cache
    /// is permanently shut down: lookups miss, inserts are rejected and limits read zero.
    #[must_use]
    pub fn build(self) -> Arc<Cache> {
        let (cache, _) = self.create();
        cache
    }

    /// Builds the cache, reporting a refused registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] if the global budget cannot cover the limit plus the
    /// initial table, or if the manager has been shut down.
    pub fn try_build(self) -> Result<Arc<Cache>, RegistrationError> {
        match self.create() {
            (_, Some(error)) => Err(error),
            (cache, None) => Ok(cache),
        }
    }

    fn create(self) -> (Arc<Cache>, Option<RegistrationError>) {
        let Self {
            manager,
            kind,
            limit,
            allow_growth,
            on_destroy,
        } = self;

        let mut failure = None;
        let cache = Arc::new_cyclic(|weak| {
            let registered = match manager.register(weak.clone(), limit, allow_growth, on_destroy) {
                Ok(registered) => Some(registered),
                Err(error) => {
                    warn!(requested = error.requested(), available = error.available(), "cache registration refused");
                    failure = Some(error);
                    None
                }
            };
            Cache::new(weak.clone(), Arc::clone(&manager), kind, allow_growth, registered)
        });

        (cache, failure)
    }
}
