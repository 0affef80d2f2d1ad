//! # Load Balancer
//!
//! Lock-free choice of which instance serves the next session.
//!
//! Each instance has a usage counter in its own cache line. `acquire` scans every
//! slot once, starting from a per-thread cursor, and claims the first idle slot with
//! a 0 → 1 compare-and-swap. When no slot is idle it increments the slot with the
//! fewest users seen during the scan. That minimum may be stale by the time the
//! increment lands; the choice is a heuristic, never a wait.
//!
//! For every index, outstanding `acquire` results minus completed `free` calls
//! equals the counter.

use std::cell::Cell;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

thread_local! {
    static CURSOR: Cell<usize> = const { Cell::new(0) };
}

#[repr(align(64))]
#[derive(Debug, Default)]
struct Slot {
    uses: AtomicU64,
}

/// Per-instance in-flight usage counters.
#[derive(Debug)]
pub struct LoadBalancer {
    slots: Box<[Slot]>,
}

impl LoadBalancer {
    pub fn new(n: usize) -> Self {
        Self {
            slots: (0..n).map(|_| Slot::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Picks an instance and records one more user on it. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if the balancer has no slots.
    pub fn acquire(&self) -> usize {
        let n = self.slots.len();
        assert!(n > 0, "load balancer has no slots");

        CURSOR.with(|cursor| {
            let mut idx = cursor.get() % n;
            let mut min_uses = u64::MAX;
            let mut min_idx = idx;

            for _ in 0..n {
                match self.slots[idx].uses.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => {
                        cursor.set(idx + 1);
                        return idx;
                    }
                    Err(prev) if prev < min_uses => {
                        min_uses = prev;
                        min_idx = idx;
                    }
                    Err(_) => {}
                }
                idx = (idx + 1) % n;
            }

            // Everything is busy: fall back to the least used slot we saw.
            self.slots[min_idx].uses.fetch_add(1, Ordering::SeqCst);
            cursor.set(min_idx + 1);
            min_idx
        })
    }

    /// Returns one use of `index`.
    pub fn free(&self, index: usize) {
        let prev = self.slots[index].uses.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "free of idle slot {}", index);
    }

    /// Current number of users of `index`.
    pub fn usage(&self, index: usize) -> u64 {
        self.slots[index].uses.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.slots.iter().map(|slot| slot.uses.load(Ordering::SeqCst)).collect()
    }
}
