//! Min-heap of timer deadlines.
//!
//! Generalizes the `tick_ms` + `BinaryHeap<Task>` shape queen-io's own
//! `plus/timer.rs` stubbed out (reversed `Ord` over a `(deadline, token)`
//! pair to turn `std::collections::BinaryHeap`'s max-heap into a min-heap)
//! into a complete timer queue with insertion-order tiebreaking and O(log N)
//! cancel by back-pointer, the way `original_source`'s retired
//! `utility/timerqueue.hpp` paired a deadline-ordered queue with a handle a
//! caller could cancel directly instead of scanning for it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::handler::HandlerId;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
struct Entry {
    deadline: Instant,
    seq: u64,
    handler: HandlerId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) behaves as a min-heap on
        // deadline, with the insertion sequence breaking ties so equal
        // deadlines fire in the order they were armed.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of `(deadline, handler)` pairs supporting cancel by handle.
///
/// Cancellation is implemented by tombstoning: `cancel` marks the entry's
/// slot dead and the root is lazily skipped in `pop_expired`. This keeps
/// `cancel` O(log N) (a `HashMap` lookup plus no heap restructuring) without
/// the bookkeeping a fully indexed binary heap would need, at the cost of
/// tombstoned entries resting in the heap until their deadline passes.
pub struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    live: std::collections::HashMap<HandlerId, u64>,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap {
            heap: BinaryHeap::new(),
            next_seq: 0,
            live: std::collections::HashMap::new(),
        }
    }

    /// Arms a timer for `handler`, firing at `deadline`. Replaces any
    /// previously armed timer for the same handler.
    pub fn add(&mut self, deadline: Instant, handler: HandlerId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(handler, seq);
        self.heap.push(Entry {
            deadline,
            seq,
            handler,
        });
    }

    /// Cancels the timer owned by `handler`, if any. A no-op if the handler
    /// has no timer armed — matching the spec's "`cancel(timer);
    /// cancel(timer)` is a no-op" law.
    pub fn cancel(&mut self, handler: HandlerId) {
        self.live.remove(&handler);
    }

    pub fn is_armed(&self, handler: HandlerId) -> bool {
        self.live.contains_key(&handler)
    }

    /// Pops every entry whose deadline is at or before `now`, skipping
    /// canceled (tombstoned) entries and any entry superseded by a later
    /// `add` for the same handler.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<HandlerId> {
        let mut fired = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }

            let entry = self.heap.pop().expect("peek just confirmed Some");

            match self.live.get(&entry.handler) {
                Some(&seq) if seq == entry.seq => {
                    self.live.remove(&entry.handler);
                    fired.push(entry.handler);
                }
                _ => {
                    // Canceled, or superseded by a newer `add` — drop.
                }
            }
        }

        fired
    }

    /// Deadline of the earliest live timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|e| self.live.get(&e.handler) == Some(&e.seq))
            .map(|e| e.deadline)
            .min()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        TimerHeap::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handler::HandlerId;
    use std::time::Duration;

    fn id(index: usize) -> HandlerId {
        HandlerId::for_test(index, 0)
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.add(base + Duration::from_millis(30), id(1));
        heap.add(base + Duration::from_millis(10), id(2));
        heap.add(base + Duration::from_millis(20), id(3));

        let fired = heap.pop_expired(base + Duration::from_millis(25));
        assert_eq!(fired, vec![id(2), id(3)]);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut heap = TimerHeap::new();
        let deadline = Instant::now();
        heap.add(deadline, id(1));
        heap.add(deadline, id(2));
        heap.add(deadline, id(3));

        let fired = heap.pop_expired(deadline);
        assert_eq!(fired, vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut heap = TimerHeap::new();
        let deadline = Instant::now();
        heap.add(deadline, id(1));

        heap.cancel(id(1));
        heap.cancel(id(1));

        assert!(heap.pop_expired(deadline).is_empty());
    }

    #[test]
    fn cancel_then_rearm_only_fires_once() {
        let mut heap = TimerHeap::new();
        let deadline = Instant::now();
        heap.add(deadline, id(1));
        heap.cancel(id(1));
        heap.add(deadline, id(1));

        assert_eq!(heap.pop_expired(deadline), vec![id(1)]);
    }
}
