// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-cache lifecycle state.
//!
//! The lifecycle is a small state machine guarded by the top lock tier:
//!
//! ```text
//! Operational { migrating, resizing } --begin_shutdown--> ShuttingDown { teardown_claimed: false }
//!            \                                                    |
//!             `------------------shutdown------------------------+--> ShuttingDown { teardown_claimed: true }
//!                                                                                  |
//!                                                                   (open operations drained)
//!                                                                                  v
//!                                                                              Shutdown
//! ```
//!
//! Alongside the lock lives the open-operation counter. An operation can only be opened while
//! the lock is held and the state is operational, which is what lets shutdown drain them.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

/// Lifecycle of a cache. Structural flags only exist while operational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Operational {
        /// Set from the table swap until the old table has been drained.
        migrating: bool,
        /// Set for a whole resize request, from the cache's decision until the manager returns.
        resizing: bool,
    },
    ShuttingDown { teardown_claimed: bool },
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct State {
    lifecycle: Mutex<Lifecycle>,
    open_operations: AtomicU64,
}

impl State {
    pub fn new() -> Self {
        Self::with_lifecycle(Lifecycle::Operational {
            migrating: false,
            resizing: false,
        })
    }

    /// State of a cache that could not be registered and must never serve requests.
    pub fn inert() -> Self {
        Self::with_lifecycle(Lifecycle::Shutdown)
    }

    fn with_lifecycle(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle: Mutex::new(lifecycle),
            open_operations: AtomicU64::new(0),
        }
    }

    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            state: self,
            lifecycle: self.lifecycle.lock(),
        }
    }

    /// Tries to take the lock up to `tries` times, yielding between attempts.
    pub fn try_lock(&self, tries: u32) -> Option<StateGuard<'_>> {
        for attempt in 0..tries {
            if let Some(lifecycle) = self.lifecycle.try_lock() {
                return Some(StateGuard { state: self, lifecycle });
            }
            if attempt + 1 < tries {
                std::thread::yield_now();
            }
        }
        None
    }

    pub fn open_operations(&self) -> u64 {
        self.open_operations.load(Ordering::Acquire)
    }

    /// Closes an operation opened through [`StateGuard::start_operation_detached`].
    pub fn end_operation(&self) {
        let previous = self.open_operations.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "operation counter underflow");
    }
}

/// Proof that the state lock is held.
pub(crate) struct StateGuard<'a> {
    state: &'a State,
    lifecycle: MutexGuard<'a, Lifecycle>,
}

impl<'a> StateGuard<'a> {
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle
    }

    pub fn is_operational(&self) -> bool {
        matches!(*self.lifecycle, Lifecycle::Operational { .. })
    }

    pub fn is_migrating(&self) -> bool {
        matches!(*self.lifecycle, Lifecycle::Operational { migrating: true, .. })
    }

    pub fn is_resizing(&self) -> bool {
        matches!(*self.lifecycle, Lifecycle::Operational { resizing: true, .. })
    }

    /// Sets or clears the migrating flag. Returns `false` if the cache is not operational.
    pub fn set_migrating(&mut self, value: bool) -> bool {
        match &mut *self.lifecycle {
            Lifecycle::Operational { migrating, .. } => {
                *migrating = value;
                true
            }
            _ => false,
        }
    }

    /// Sets or clears the resizing flag. Returns `false` if the cache is not operational.
    pub fn set_resizing(&mut self, value: bool) -> bool {
        match &mut *self.lifecycle {
            Lifecycle::Operational { resizing, .. } => {
                *resizing = value;
                true
            }
            _ => false,
        }
    }

    /// Opens an operation that shutdown must wait for. `None` if not operational.
    pub fn start_operation(&self) -> Option<OperationGuard<'a>> {
        self.start_operation_detached().then_some(OperationGuard { state: self.state })
    }

    /// Opens an operation whose end is signalled through [`State::end_operation`].
    pub fn start_operation_detached(&self) -> bool {
        if !self.is_operational() {
            return false;
        }
        self.state.open_operations.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// `Operational` becomes `ShuttingDown`. Any other state is left alone.
    pub fn begin_shutdown(&mut self) {
        if self.is_operational() {
            *self.lifecycle = Lifecycle::ShuttingDown { teardown_claimed: false };
        }
    }

    /// Claims the right to tear the cache down.
    ///
    /// Exactly one caller receives `true`; it must eventually call [`Self::finish_shutdown`].
    pub fn claim_teardown(&mut self) -> bool {
        match *self.lifecycle {
            Lifecycle::Operational { .. } | Lifecycle::ShuttingDown { teardown_claimed: false } => {
                *self.lifecycle = Lifecycle::ShuttingDown { teardown_claimed: true };
                true
            }
            Lifecycle::ShuttingDown { teardown_claimed: true } | Lifecycle::Shutdown => false,
        }
    }

    /// Releases and re-takes the lock, yielding, until no operation is open.
    pub fn wait_for_operations(&mut self) {
        while self.state.open_operations() > 0 {
            MutexGuard::unlocked(&mut self.lifecycle, std::thread::yield_now);
        }
    }

    /// Releases and re-takes the lock, yielding, while another resize request is in flight.
    pub fn wait_while_resizing(&mut self) {
        while self.is_resizing() {
            MutexGuard::unlocked(&mut self.lifecycle, std::thread::yield_now);
        }
    }

    /// Releases and re-takes the lock, yielding, until another caller finished the teardown.
    pub fn wait_for_shutdown(&mut self) {
        while *self.lifecycle != Lifecycle::Shutdown {
            MutexGuard::unlocked(&mut self.lifecycle, std::thread::yield_now);
        }
    }

    pub fn finish_shutdown(&mut self) {
        *self.lifecycle = Lifecycle::Shutdown;
    }
}

/// An open operation; closes itself on drop.
#[derive(Debug)]
pub(crate) struct OperationGuard<'a> {
    state: &'a State,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.state.end_operation();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn new_state_is_operational() {
        let state = State::new();
        let guard = state.lock();
        assert!(guard.is_operational());
        assert!(!guard.is_migrating());
        assert!(!guard.is_resizing());
    }

    #[test]
    fn inert_state_refuses_operations() {
        let state = State::inert();
        let guard = state.lock();
        assert!(!guard.is_operational());
        assert!(guard.start_operation().is_none());
        assert_eq!(state.open_operations(), 0);
    }

    #[test]
    fn structural_flags_only_exist_while_operational() {
        let state = State::new();
        let mut guard = state.lock();
        assert!(guard.set_migrating(true));
        assert!(guard.is_migrating());
        assert!(guard.set_resizing(true));
        assert!(guard.is_resizing());

        guard.begin_shutdown();
        assert!(!guard.is_migrating());
        assert!(!guard.set_resizing(true));
        assert_eq!(guard.lifecycle(), Lifecycle::ShuttingDown { teardown_claimed: false });
    }

    #[test]
    fn operation_guard_counts_open_operations() {
        let state = State::new();
        let guard = state.lock();
        let first = guard.start_operation().expect("operational");
        let second = guard.start_operation().expect("operational");
        drop(guard);
        assert_eq!(state.open_operations(), 2);
        drop(first);
        drop(second);
        assert_eq!(state.open_operations(), 0);
    }

    #[test]
    fn begin_shutdown_is_idempotent() {
        let state = State::new();
        let mut guard = state.lock();
        guard.begin_shutdown();
        guard.begin_shutdown();
        assert_eq!(guard.lifecycle(), Lifecycle::ShuttingDown { teardown_claimed: false });
        guard.finish_shutdown();
        guard.begin_shutdown();
        assert_eq!(guard.lifecycle(), Lifecycle::Shutdown);
    }

    #[test]
    fn only_one_caller_claims_teardown() {
        let state = State::new();
        let mut guard = state.lock();
        assert!(guard.claim_teardown());
        assert!(!guard.claim_teardown());
        guard.finish_shutdown();
        assert!(!guard.claim_teardown());
    }

    #[test]
    fn try_lock_gives_up_when_contended() {
        let state = State::new();
        let held = state.lock();
        assert!(state.try_lock(10).is_none());
        assert!(state.try_lock(0).is_none());
        drop(held);
        assert!(state.try_lock(1).is_some());
    }

    #[test]
    fn wait_for_operations_lets_the_operation_finish() {
        let state = Arc::new(State::new());
        let guard = state.lock();
        assert!(guard.start_operation_detached());
        drop(guard);

        let finished = Arc::new(AtomicBool::new(false));
        let worker = {
            let state = Arc::clone(&state);
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                // The worker needs the lock to be released by the waiter at least once.
                let _guard = state.lock();
                finished.store(true, Ordering::Release);
                state.end_operation();
            })
        };

        let mut guard = state.lock();
        assert!(guard.claim_teardown());
        guard.wait_for_operations();
        assert!(finished.load(Ordering::Acquire));
        guard.finish_shutdown();
        drop(guard);

        worker.join().expect("worker should not panic");
        assert_eq!(state.open_operations(), 0);
    }
}
