//! Epoch-based protection and reclamation.
//!
//! Threads that touch shared structures hold a slot in a fixed table and
//! periodically publish the global epoch into it. A resource retired at
//! epoch E may be reclaimed once every occupied slot has published an
//! epoch >= E+1: at that point no thread can still hold a reference
//! obtained before the retire.
//!
//! Reclamation work is expressed as drain actions registered by [`bump`]:
//! the global epoch is incremented and the action runs exactly once, on
//! whichever thread first observes that the table has drained past it.
//!
//! [`bump`]: LightEpoch::bump

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of concurrently held slots. Exceeding it is a
/// programming error (more live sessions than the table admits).
pub const TABLE_SIZE: usize = 128;

/// Capacity of the pending drain-action list.
const DRAIN_LIST_SIZE: usize = 16;

/// Slot value meaning "unoccupied".
const FREE: u64 = 0;

/// A claimed position in the epoch table. Held by one session at a time;
/// returned to the table with [`LightEpoch::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(usize);

#[repr(align(64))]
struct Entry {
    /// FREE, or the epoch this slot last published.
    epoch: AtomicU64,
}

struct DrainAction {
    /// 0 when the slot is free; otherwise the epoch the action waits for.
    trigger: AtomicU64,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

pub struct LightEpoch {
    current: AtomicU64,
    /// Highest epoch known to be drained (every slot has moved past it).
    safe: AtomicU64,
    table: Box<[Entry]>,
    drain: Box<[DrainAction]>,
    /// Count of occupied drain slots; lets `protect` skip the scan.
    drain_count: AtomicU64,
}

impl LightEpoch {
    pub fn new() -> Self {
        let table = (0..TABLE_SIZE)
            .map(|_| Entry {
                epoch: AtomicU64::new(FREE),
            })
            .collect();
        let drain = (0..DRAIN_LIST_SIZE)
            .map(|_| DrainAction {
                trigger: AtomicU64::new(0),
                action: Mutex::new(None),
            })
            .collect();
        Self {
            current: AtomicU64::new(1),
            safe: AtomicU64::new(0),
            table,
            drain,
            drain_count: AtomicU64::new(0),
        }
    }

    /// The current global epoch.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Claim a free slot. Panics if all `TABLE_SIZE` slots are held.
    pub fn acquire(&self) -> Slot {
        for (idx, entry) in self.table.iter().enumerate() {
            let cur = self.current.load(Ordering::Acquire);
            if entry
                .epoch
                .compare_exchange(FREE, cur, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Slot(idx);
            }
        }
        panic!("epoch table exhausted: more than {TABLE_SIZE} live sessions");
    }

    /// Release a slot and opportunistically drain.
    pub fn release(&self, slot: Slot) {
        self.table[slot.0].epoch.store(FREE, Ordering::Release);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.try_drain();
        }
    }

    /// Publish the current global epoch into `slot` and run any drain
    /// actions that became safe. Returns the epoch now protected.
    pub fn protect(&self, slot: Slot) -> u64 {
        let cur = self.current.load(Ordering::Acquire);
        self.table[slot.0].epoch.store(cur, Ordering::SeqCst);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.try_drain();
        }
        cur
    }

    pub fn is_protected(&self, slot: Slot) -> bool {
        self.table[slot.0].epoch.load(Ordering::Acquire) != FREE
    }

    /// Increment the global epoch and register `action` to run once every
    /// occupied slot has observed the new epoch.
    ///
    /// If the drain list is full this spins draining until a slot frees;
    /// callers are expected to hold a protected slot of their own so the
    /// spin cannot starve the table.
    pub fn bump(&self, action: Box<dyn FnOnce() + Send>) {
        let trigger = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        let mut action = Some(action);
        loop {
            for slot in self.drain.iter() {
                if slot.trigger.load(Ordering::Acquire) != 0 {
                    continue;
                }
                {
                    let mut guard = slot.action.lock();
                    // Re-check under the lock: a racing bump may have won
                    // the slot.
                    if slot.trigger.load(Ordering::Acquire) != 0 || guard.is_some() {
                        continue;
                    }
                    *guard = action.take();
                }
                // The lock is released before draining: a drain action may
                // itself bump, and the list must be re-lockable by then.
                slot.trigger.store(trigger, Ordering::Release);
                self.drain_count.fetch_add(1, Ordering::AcqRel);
                self.try_drain();
                return;
            }
            // List is full: drain on behalf of the registered actions and retry.
            self.try_drain();
            std::hint::spin_loop();
        }
    }

    /// Epoch such that everything retired at or before it has drained.
    pub fn safe_to_reclaim(&self) -> u64 {
        self.compute_safe()
    }

    fn compute_safe(&self) -> u64 {
        let mut safe = self.current.load(Ordering::Acquire);
        for entry in self.table.iter() {
            let e = entry.epoch.load(Ordering::Acquire);
            if e != FREE && e < safe {
                safe = e;
            }
        }
        // Monotone publish; concurrent computations may race, keep the max.
        self.safe.fetch_max(safe, Ordering::AcqRel);
        self.safe.load(Ordering::Acquire)
    }

    fn try_drain(&self) {
        let safe = self.compute_safe();
        for slot in self.drain.iter() {
            let trigger = slot.trigger.load(Ordering::Acquire);
            if trigger == 0 || trigger > safe {
                continue;
            }
            // Claim the action under the lock; the trigger is cleared last
            // so a concurrent bump cannot reuse the slot mid-run.
            let action = {
                let mut guard = slot.action.lock();
                if slot.trigger.load(Ordering::Acquire) != trigger {
                    continue;
                }
                guard.take()
            };
            if let Some(action) = action {
                action();
                slot.trigger.store(0, Ordering::Release);
                self.drain_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LightEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightEpoch")
            .field("current", &self.current.load(Ordering::Relaxed))
            .field("safe", &self.safe.load(Ordering::Relaxed))
            .field("pending_drains", &self.drain_count.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn acquire_release_reuses_slots() {
        let epoch = LightEpoch::new();
        let a = epoch.acquire();
        let b = epoch.acquire();
        assert_ne!(a, b);
        epoch.release(a);
        let c = epoch.acquire();
        assert_eq!(a, c);
        epoch.release(b);
        epoch.release(c);
    }

    #[test]
    fn drain_waits_for_all_slots() {
        let epoch = LightEpoch::new();
        let fired = Arc::new(AtomicBool::new(false));

        let holder = epoch.acquire();
        epoch.protect(holder);

        let observer = epoch.acquire();
        epoch.protect(observer);

        let f = fired.clone();
        epoch.bump(Box::new(move || f.store(true, Ordering::SeqCst)));

        // `holder` still protects the pre-bump epoch.
        epoch.protect(observer);
        assert!(!fired.load(Ordering::SeqCst));

        // Once both slots move past the bump the action runs.
        epoch.protect(holder);
        epoch.protect(observer);
        assert!(fired.load(Ordering::SeqCst));

        epoch.release(holder);
        epoch.release(observer);
    }

    #[test]
    fn drain_runs_immediately_when_idle() {
        let epoch = LightEpoch::new();
        let slot = epoch.acquire();
        epoch.protect(slot);

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        epoch.bump(Box::new(move || f.store(true, Ordering::SeqCst)));

        epoch.protect(slot);
        assert!(fired.load(Ordering::SeqCst));
        epoch.release(slot);
    }

    #[test]
    fn bump_survives_full_drain_list() {
        let epoch = LightEpoch::new();
        let slot = epoch.acquire();
        epoch.protect(slot);

        let count = Arc::new(AtomicU64::new(0));
        for _ in 0..64 {
            let c = count.clone();
            epoch.bump(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
            epoch.protect(slot);
        }
        epoch.protect(slot);
        assert_eq!(count.load(Ordering::SeqCst), 64);
        epoch.release(slot);
    }
}
