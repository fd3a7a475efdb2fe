// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Eviction statistics sampler.
//!
//! A [`FrequencyBuffer`] is a ring of the most recent outcome codes. Writers overwrite slots
//! round-robin with relaxed atomics, so recording a sample never blocks. Readers aggregate the
//! ring into per-code counts on demand; the result is an approximation, which is all the
//! migration heuristic needs.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Outcome codes recorded by the bucket logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Stat {
    /// A lookup found its key.
    Hit = 1,
    /// A lookup did not find its key.
    Miss = 2,
    /// An entry was evicted to make room.
    Eviction = 3,
}

impl Stat {
    const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Hit),
            2 => Some(Self::Miss),
            3 => Some(Self::Eviction),
            _ => None,
        }
    }
}

/// Marks a slot that has not been written since construction or the last clear.
const EMPTY: u8 = 0;

/// Fixed-capacity ring of recent [`Stat`] codes.
#[derive(Debug)]
pub(crate) struct FrequencyBuffer {
    slots: Box<[AtomicU8]>,
    cursor: AtomicUsize,
    mask: usize,
}

impl FrequencyBuffer {
    /// Creates a buffer holding at least `capacity` samples (rounded up to a power of two).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity).map(|_| AtomicU8::new(EMPTY)).collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
            mask: capacity - 1,
        }
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn insert_record(&self, stat: Stat) {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) & self.mask;
        self.slots[index].store(stat as u8, Ordering::Relaxed);
    }

    /// Per-code counts over the current window, most frequent first.
    ///
    /// Codes that do not occur in the window are omitted.
    pub fn frequencies(&self) -> Vec<(Stat, u64)> {
        let mut counts = [0_u64; 4];
        for slot in &*self.slots {
            counts[usize::from(slot.load(Ordering::Relaxed))] += 1;
        }

        let mut frequencies: Vec<(Stat, u64)> = counts
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count > 0)
            .filter_map(|(code, &count)| {
                let code = u8::try_from(code).ok()?;
                Stat::from_code(code).map(|stat| (stat, count))
            })
            .collect();

        frequencies.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        frequencies
    }

    pub fn clear(&self) {
        for slot in &*self.slots {
            slot.store(EMPTY, Ordering::Relaxed);
        }
    }
}

/// Decides whether a window of samples is dominated by evictions.
///
/// True when eviction is the only recorded code, or when eviction is the most frequent
/// code and occurs more than `16` times as often as the runner-up.
pub(crate) fn evictions_dominate(frequencies: &[(Stat, u64)]) -> bool {
    const DOMINANCE_FACTOR: u64 = 16;

    match frequencies {
        [(Stat::Eviction, _)] => true,
        [(Stat::Eviction, top), (_, second), ..] => *top > second.saturating_mul(DOMINANCE_FACTOR),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(FrequencyBuffer::new(1000).capacity(), 1024);
        assert_eq!(FrequencyBuffer::new(0).capacity(), 1);
    }

    #[test]
    fn empty_buffer_has_no_frequencies() {
        let buffer = FrequencyBuffer::new(16);
        assert!(buffer.frequencies().is_empty());
    }

    #[test]
    fn frequencies_are_sorted_most_frequent_first() {
        let buffer = FrequencyBuffer::new(16);
        for _ in 0..3 {
            buffer.insert_record(Stat::Hit);
        }
        for _ in 0..5 {
            buffer.insert_record(Stat::Miss);
        }
        buffer.insert_record(Stat::Eviction);

        assert_eq!(
            buffer.frequencies(),
            vec![(Stat::Miss, 5), (Stat::Hit, 3), (Stat::Eviction, 1)]
        );
    }

    #[test]
    fn ring_overwrites_oldest_samples() {
        let buffer = FrequencyBuffer::new(4);
        for _ in 0..4 {
            buffer.insert_record(Stat::Hit);
        }
        for _ in 0..4 {
            buffer.insert_record(Stat::Eviction);
        }

        assert_eq!(buffer.frequencies(), vec![(Stat::Eviction, 4)]);
    }

    #[test]
    fn clear_forgets_everything() {
        let buffer = FrequencyBuffer::new(8);
        buffer.insert_record(Stat::Eviction);
        buffer.clear();
        assert!(buffer.frequencies().is_empty());
    }

    #[test]
    fn sole_eviction_code_dominates() {
        assert!(evictions_dominate(&[(Stat::Eviction, 3)]));
        assert!(!evictions_dominate(&[(Stat::Hit, 3)]));
        assert!(!evictions_dominate(&[]));
    }

    #[test]
    fn dominance_requires_more_than_sixteen_times_the_runner_up() {
        assert!(evictions_dominate(&[(Stat::Eviction, 170), (Stat::Hit, 10)]));
        assert!(!evictions_dominate(&[(Stat::Eviction, 160), (Stat::Hit, 10)]));
        assert!(!evictions_dominate(&[(Stat::Eviction, 64), (Stat::Hit, 16)]));
        assert!(!evictions_dominate(&[(Stat::Miss, 400), (Stat::Eviction, 10)]));
    }
}
