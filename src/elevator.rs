//! # Elevator ordering
//!
//! Operations collected in one scheduler iteration come from many owners and arrive in no
//! particular order. Before dispatch they are arranged into sweeps:
//!
//! - Sort by offset ascending, longer first on equal offsets.
//! - Walk the sorted list and keep an operation in the current sweep only if it starts at or
//!   after the end of the previous one kept. Anything overlapping is deferred.
//! - The deferred operations form the next sweep, again starting from offset 0, and so on.
//!
//! Inside one sweep the device head only moves forward and no two operations overlap, so an
//! operation never runs before another one covering an earlier part of the same range.

use crate::tasks::IoOperation;

/// A contiguous device range.
pub trait Extent {
    fn start(&self) -> u64;

    fn len(&self) -> u64;

    #[inline(always)]
    fn end(&self) -> u64 {
        self.start() + self.len()
    }
}

impl Extent for IoOperation {
    #[inline(always)]
    fn start(&self) -> u64 {
        self.offset()
    }

    #[inline(always)]
    fn len(&self) -> u64 {
        self.length()
    }
}

impl Extent for (u64, u64) {
    #[inline(always)]
    fn start(&self) -> u64 {
        self.0
    }

    #[inline(always)]
    fn len(&self) -> u64 {
        self.1
    }
}

/// Split `items` into sweeps of increasing, non-overlapping ranges.
pub fn elevator_sweeps<T: Extent>(mut items: Vec<T>) -> Vec<Vec<T>> {
    items.sort_by(|a, b| a.start().cmp(&b.start()).then_with(|| b.len().cmp(&a.len())));
    let mut sweeps = Vec::new();
    while !items.is_empty() {
        let mut sweep = Vec::with_capacity(items.len());
        let mut deferred = Vec::new();
        let mut end = 0;
        for item in items.drain(..) {
            if item.start() >= end {
                end = item.end();
                sweep.push(item);
            } else {
                deferred.push(item);
            }
        }
        sweeps.push(sweep);
        items = deferred;
    }
    sweeps
}

/// Reorder `items` in place into dispatch order, returning the number of sweeps.
pub fn elevator_sort<T: Extent>(items: &mut Vec<T>) -> usize {
    let sweeps = elevator_sweeps(std::mem::take(items));
    let count = sweeps.len();
    for sweep in sweeps {
        items.extend(sweep);
    }
    count
}
