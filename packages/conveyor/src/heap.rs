//! Priority ordering for queued jobs.
//!
//! [`PriorityQueue`] keeps job ids ordered by priority (descending) with a
//! FIFO tie-break on a monotonic sequence counter assigned at insertion.
//! Entries carrying a `not_before` timestamp (retry backoff, scheduled
//! submissions) wait in a separate due-time min-heap and only become
//! eligible once due, so `pop`/`peek` never surface a job early and never
//! scan.
//!
//! Removal (cancellation of a queued job) is lazy: the id is tombstoned and
//! discarded when it reaches the top of a heap.
//!
//! Amortized O(log n) push/pop.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Pushing onto a queue that was shut down.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("priority queue is closed")]
pub struct QueueClosedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    id: Uuid,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins; equal priority falls back to the
        // earlier sequence number (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayedEntry {
    not_before: DateTime<Utc>,
    entry: ReadyEntry,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.not_before
            .cmp(&other.not_before)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority-ordered set of queued job ids with delayed-entry support.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    members: HashSet<Uuid>,
    tombstones: HashSet<Uuid>,
    seq: u64,
    closed: bool,
}

impl PriorityQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job id at the given priority.
    ///
    /// An entry with a future `not_before` stays ineligible until due.
    /// Re-inserting an id that is already queued is a no-op.
    pub fn push(
        &mut self,
        id: Uuid,
        priority: i32,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), QueueClosedError> {
        if self.closed {
            return Err(QueueClosedError);
        }
        if !self.members.insert(id) {
            return Ok(());
        }
        self.tombstones.remove(&id);
        self.seq += 1;
        let entry = ReadyEntry {
            priority,
            seq: self.seq,
            id,
        };
        match not_before {
            Some(t) if t > Utc::now() => {
                self.delayed.push(Reverse(DelayedEntry {
                    not_before: t,
                    entry,
                }));
            }
            _ => self.ready.push(entry),
        }
        Ok(())
    }

    /// Remove and return the highest-priority eligible id.
    pub fn pop(&mut self) -> Option<Uuid> {
        self.promote_due(Utc::now());
        while let Some(entry) = self.ready.pop() {
            if self.tombstones.remove(&entry.id) {
                continue;
            }
            self.members.remove(&entry.id);
            return Some(entry.id);
        }
        None
    }

    /// The highest-priority eligible id, without removing it.
    pub fn peek(&mut self) -> Option<Uuid> {
        self.promote_due(Utc::now());
        while let Some(entry) = self.ready.peek() {
            if self.tombstones.contains(&entry.id) {
                let entry = *entry;
                self.ready.pop();
                self.tombstones.remove(&entry.id);
                continue;
            }
            return Some(entry.id);
        }
        None
    }

    /// Remove a specific id from the queue. Returns whether it was present.
    pub fn remove(&mut self, id: Uuid) -> bool {
        if self.members.remove(&id) {
            self.tombstones.insert(id);
            true
        } else {
            false
        }
    }

    /// When the earliest delayed entry becomes eligible, if any.
    ///
    /// Dispatchers use this to park precisely instead of polling.
    pub fn next_run_at(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse(top)) = self.delayed.peek() {
            if self.tombstones.contains(&top.entry.id) {
                let id = top.entry.id;
                self.delayed.pop();
                self.tombstones.remove(&id);
                continue;
            }
            return Some(top.not_before);
        }
        None
    }

    /// Number of queued ids (eligible and delayed).
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether no ids are queued.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Refuse further pushes. Existing entries remain poppable.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Move due delayed entries into the ready heap.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(top)) = self.delayed.peek() {
            if top.not_before > now {
                break;
            }
            let Reverse(due) = self.delayed.pop().expect("peeked entry exists");
            if self.tombstones.remove(&due.entry.id) {
                continue;
            }
            self.ready.push(due.entry);
        }
    }
}
