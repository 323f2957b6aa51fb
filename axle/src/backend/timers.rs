// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Monotonic deadline heap shared by both built-in engines.
//!
//! Removal is lazy: [`remove`] marks the slot dead and the next heap
//! traversal discards it. Slots are never reused within a loop instance, so
//! a dead mark cannot collide with a later insertion.
//!
//! [`remove`]: TimerHeap::remove

use super::{BackendSlot, FireDetail, Readiness, ReadyBatch};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: Instant,
    slot: BackendSlot,
    interval: Duration,
    persist: bool,
}

/// Min-heap of timer deadlines keyed on [`Instant`].
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<Entry>>,
    dead: HashSet<BackendSlot>,
}

impl TimerHeap {
    /// Arm `slot` to expire `interval` from `now`. With `persist` the heap
    /// re-arms it itself on every expiry (an engine with natively recurring
    /// timers); without, one expiry and it is gone.
    pub(crate) fn insert(
        &mut self,
        slot: BackendSlot,
        interval: Duration,
        persist: bool,
        now: Instant,
    ) {
        self.heap.push(Reverse(Entry {
            deadline: now + interval,
            slot,
            interval,
            persist,
        }));
    }

    pub(crate) fn remove(&mut self, slot: BackendSlot) {
        // Only mark slots still armed; an already-expired slot (the facade
        // re-arm path dels one every fire) must not accumulate dead marks.
        if self.heap.iter().any(|Reverse(entry)| entry.slot == slot) {
            self.dead.insert(slot);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.dead.clear();
    }

    /// Time until the earliest live deadline, or `None` when no timers are
    /// armed. Zero when a deadline has already passed.
    pub(crate) fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let Some(&Reverse(top)) = self.heap.peek() else {
                return None;
            };
            if self.dead.remove(&top.slot) {
                let _ = self.heap.pop();
                continue;
            }
            return Some(top.deadline.saturating_duration_since(now));
        }
    }

    /// Pop every deadline at or before `now` into `ready`, re-arming
    /// persistent entries.
    pub(crate) fn collect_expired(&mut self, now: Instant, ready: &mut ReadyBatch) {
        loop {
            let Some(&Reverse(top)) = self.heap.peek() else {
                return;
            };
            if self.dead.remove(&top.slot) {
                let _ = self.heap.pop();
                continue;
            }
            if top.deadline > now {
                return;
            }
            let _ = self.heap.pop();
            ready.push(Readiness {
                slot: top.slot,
                detail: FireDetail::Plain,
            });
            if top.persist {
                self.heap.push(Reverse(Entry {
                    deadline: now + top.interval,
                    ..top
                }));
            }
        }
    }
}
