//! Cooperative run-to-completion task queue.
//!
//! Tasks are ordered by due time, then by submission order. The queue never
//! runs anything itself; the owner pops due tasks and runs them one at a time.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use core::cmp::Ordering;

use embassy_time::{Duration, Instant};

/// A posted callback. Receives the context that owns the scheduler.
pub type Task<Ctx> = Box<dyn FnOnce(&mut Ctx)>;

struct Entry<Ctx> {
    due: Instant,
    seq: u64,
    task: Task<Ctx>,
}

impl<Ctx> PartialEq for Entry<Ctx> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<Ctx> Eq for Entry<Ctx> {}

impl<Ctx> PartialOrd for Entry<Ctx> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Ctx> Ord for Entry<Ctx> {
    // Reversed: `BinaryHeap` is a max-heap and the earliest entry must be on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Scheduler<Ctx> {
    queue: BinaryHeap<Entry<Ctx>>,
    next_seq: u64,
}

impl<Ctx> Default for Scheduler<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> Scheduler<Ctx> {
    pub fn new() -> Self {
        Self { queue: BinaryHeap::new(), next_seq: 0 }
    }

    /// Queue `task` to run as soon as the loop gets to it.
    pub fn post(&mut self, now: Instant, task: Task<Ctx>) {
        self.push(now, task);
    }

    /// Queue `task` to run no earlier than `delay` after `now`.
    pub fn post_after(&mut self, now: Instant, delay: Duration, task: Task<Ctx>) {
        self.push(now + delay, task);
    }

    fn push(&mut self, due: Instant, task: Task<Ctx>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Entry { due, seq, task });
    }

    /// Submission sequence number the next posted task will get.
    ///
    /// Passing this to [`Scheduler::pop_due`] at the start of a dispatch cycle
    /// keeps tasks posted during the cycle for the next one.
    pub fn horizon(&self) -> u64 {
        self.next_seq
    }

    /// Earliest task that is due at `now` and was posted before `horizon`.
    pub fn pop_due(&mut self, now: Instant, horizon: u64) -> Option<Task<Ctx>> {
        let head = self.queue.peek()?;
        if head.due > now || head.seq >= horizon {
            return None;
        }
        self.queue.pop().map(|entry| entry.task)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue.peek().map(|entry| entry.due)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
