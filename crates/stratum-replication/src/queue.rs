//! Sequence-number-indexed operation queue.
//!
//! The queue buffers operations between producer and consumer frontiers:
//!
//! ```text
//!        completed window          committed        out-of-order tail
//!  ──────┬────────────────┬──────────────┬──────┬───────gap───────┬──
//!        │                │              │      │                 │
//!   first_available   next_to_be     last_committed            last
//!   _completed        _completed
//! ```
//!
//! Enqueue accepts out-of-order sequence numbers up to a capacity and
//! memory limit; `commit` advances the contiguous visible frontier;
//! `complete` advances the acknowledged frontier and moves items into the
//! completed window, where they are retained for catching up slow remotes
//! until window bounds or admission pressure reclaims them.
//!
//! The queue holds no lock of its own; the owning component serializes
//! access and drops released operation references outside its lock.
//!
//! # Admission
//!
//! `try_enqueue` admits in two phases with fixed ordering:
//!
//! 1. **Memory** (when a memory limit is set): if the new total would
//!    exceed the limit, first verify that reclaiming the whole completed
//!    window plus dropping every droppable out-of-order operation *could*
//!    fit the item; if not, fail without mutating. Otherwise reclaim
//!    completed head items one at a time until the item fits, then drop
//!    out-of-order uncommitted operations above the incoming sequence
//!    number, highest first.
//! 2. **Count**: if the span from the completed head to the new last
//!    sequence number exceeds capacity, grow (power-of-two, up to the
//!    maximum) before touching the completed window; only then reclaim
//!    completed head items. Reclamation is not rolled back when the
//!    enqueue still fails.
//!
//! Duplicate enqueue at an occupied slot is accepted and deduplicated;
//! enqueue at or below the completed head reports
//! [`Status::StaleOperation`].

use std::collections::BTreeMap;
use std::sync::Arc;

use stratum_types::{Lsn, Operation, Status};

// ============================================================================
// Options
// ============================================================================

/// Construction-time settings of a queue.
#[derive(Debug, Clone)]
pub struct OperationQueueOptions {
    /// Initial capacity; rounded up to a power of two, minimum 1.
    pub initial_size: u64,

    /// Capacity ceiling; 0 means unbounded by count.
    pub max_size: u64,

    /// Memory ceiling in payload bytes; 0 means unbounded.
    pub max_memory_size: u64,

    /// Count bound of the completed window; 0 keeps completed items until
    /// admission pressure reclaims them.
    pub max_completed_size: u64,

    /// Memory bound of the completed window; 0 means unbounded.
    pub max_completed_memory_size: u64,

    /// Release operations immediately when they complete instead of
    /// retaining a completed window.
    pub clean_on_complete: bool,

    /// Treat enqueue as commit: the committed frontier follows the
    /// contiguous filled prefix automatically.
    pub ignore_commit: bool,
}

impl Default for OperationQueueOptions {
    fn default() -> Self {
        Self {
            initial_size: 64,
            max_size: 1024,
            max_memory_size: 0,
            max_completed_size: 0,
            max_completed_memory_size: 0,
            clean_on_complete: false,
            ignore_commit: false,
        }
    }
}

/// Outcome of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The slot was already occupied; the queue is unchanged.
    Duplicate,
}

// ============================================================================
// Queue
// ============================================================================

/// Bounded, sequence-number-indexed buffer of reference-counted operations.
pub struct OperationQueue {
    name: String,
    options: OperationQueueOptions,
    items: BTreeMap<i64, Arc<Operation>>,

    start_seq: i64,
    first_available_completed: i64,
    next_to_be_completed: i64,
    last_committed: i64,
    last: i64,

    capacity: u64,
    capacity_change_count: u64,
    total_memory: u64,
    completed_memory: u64,
    completed_count: u64,
    dropped_out_of_order: u64,
}

impl OperationQueue {
    pub fn new(name: impl Into<String>, start_seq: Lsn, options: OperationQueueOptions) -> Self {
        let start = start_seq.get();
        let capacity = ceiling_power_of_2(options.initial_size.max(1));
        Self {
            name: name.into(),
            options,
            items: BTreeMap::new(),
            start_seq: start,
            first_available_completed: start - 1,
            next_to_be_completed: start,
            last_committed: start - 1,
            last: start - 1,
            capacity,
            capacity_change_count: 0,
            total_memory: 0,
            completed_memory: 0,
            completed_count: 0,
            dropped_out_of_order: 0,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_sequence_number(&self) -> Lsn {
        Lsn::new(self.start_seq)
    }

    /// Head of the completed window: everything at or below this sequence
    /// number has been released.
    pub fn last_removed_sequence_number(&self) -> Lsn {
        Lsn::new(self.first_available_completed)
    }

    pub fn next_to_be_completed_sequence_number(&self) -> Lsn {
        Lsn::new(self.next_to_be_completed)
    }

    pub fn last_committed_sequence_number(&self) -> Lsn {
        Lsn::new(self.last_committed)
    }

    pub fn last_sequence_number(&self) -> Lsn {
        Lsn::new(self.last)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn capacity_change_count(&self) -> u64 {
        self.capacity_change_count
    }

    pub fn total_memory_size(&self) -> u64 {
        self.total_memory
    }

    pub fn completed_memory_size(&self) -> u64 {
        self.completed_memory
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn completed_count(&self) -> u64 {
        self.completed_count
    }

    pub fn dropped_out_of_order_count(&self) -> u64 {
        self.dropped_out_of_order
    }

    pub fn get(&self, lsn: Lsn) -> Option<&Arc<Operation>> {
        self.items.get(&lsn.get())
    }

    /// Committed operations with sequence numbers in `(after, last_committed]`.
    pub fn committed_after(&self, after: Lsn) -> Vec<Arc<Operation>> {
        if after.get() >= self.last_committed {
            return Vec::new();
        }
        self.items
            .range(after.get() + 1..=self.last_committed)
            .map(|(_, op)| Arc::clone(op))
            .collect()
    }

    /// Retained operations at or above `from`, in order. Includes the
    /// completed window; this is the catch-up read path.
    pub fn retained_from(&self, from: Lsn) -> Vec<Arc<Operation>> {
        self.items
            .range(from.get()..)
            .map(|(_, op)| Arc::clone(op))
            .collect()
    }

    /// The larger of the count and memory pressure ratios, as a percentage.
    /// Limits configured as 0 are ignored.
    pub fn utilization_percentage(&self) -> u64 {
        let count_pct = if self.options.max_size == 0 {
            0
        } else {
            self.items.len() as u64 * 100 / self.options.max_size
        };
        let memory_pct = if self.options.max_memory_size == 0 {
            0
        } else {
            self.total_memory * 100 / self.options.max_memory_size
        };
        count_pct.max(memory_pct)
    }

    /// The capacity the queue converges toward for its current span.
    pub fn convergent_capacity(&self) -> u64 {
        let span = self.span(self.last);
        bounded_capacity(
            ceiling_power_of_2(span.max(1)),
            self.options.initial_size,
            self.options.max_size,
        )
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Admits `op`, possibly reclaiming completed items or dropping
    /// out-of-order tail operations to make room.
    pub fn try_enqueue(&mut self, op: Arc<Operation>) -> Result<EnqueueOutcome, Status> {
        let lsn = op.lsn().get();
        if lsn <= self.first_available_completed {
            return Err(Status::StaleOperation);
        }
        if self.items.contains_key(&lsn) {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let size = op.payload_size();
        self.admit_memory(lsn, size)?;
        self.admit_count(lsn)?;

        self.items.insert(lsn, op);
        self.total_memory += size;
        self.last = self.highest_retained();
        if self.options.ignore_commit {
            self.advance_commit(self.last);
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    fn admit_memory(&mut self, lsn: i64, size: u64) -> Result<(), Status> {
        let limit = self.options.max_memory_size;
        if limit == 0 || self.total_memory + size <= limit {
            return Ok(());
        }

        // Feasibility first: reclaiming every completed item and dropping
        // every droppable out-of-order operation must fit the new item,
        // otherwise fail without mutating.
        let droppable: Vec<(i64, u64)> = self.droppable_above(lsn);
        let droppable_memory: u64 = droppable.iter().map(|(_, s)| *s).sum();
        if self.total_memory - self.completed_memory - droppable_memory + size > limit {
            tracing::debug!(
                queue = %self.name,
                lsn,
                size,
                total = self.total_memory,
                "enqueue rejected by memory limit"
            );
            return Err(Status::QueueFull);
        }

        while self.total_memory + size > limit && self.completed_count > 0 {
            self.remove_completed_head(1);
        }

        let mut drop_candidates = droppable;
        while self.total_memory + size > limit {
            let (drop_lsn, drop_size) = drop_candidates.pop().expect("feasibility checked");
            self.items.remove(&drop_lsn);
            self.total_memory -= drop_size;
            self.dropped_out_of_order += 1;
            tracing::debug!(queue = %self.name, lsn = drop_lsn, "dropped out-of-order operation for memory");
        }
        self.last = self.highest_retained().max(self.last_committed);
        Ok(())
    }

    fn admit_count(&mut self, lsn: i64) -> Result<(), Status> {
        let prospective_last = lsn.max(self.last);
        if self.span(prospective_last) <= self.capacity {
            return Ok(());
        }

        // Grow before touching the completed window.
        let target = bounded_capacity(
            ceiling_power_of_2(self.span(prospective_last)),
            self.options.initial_size,
            self.options.max_size,
        );
        if target > self.capacity {
            self.capacity = target;
            self.capacity_change_count += 1;
        }

        // Reclaim the completed window; kept even if the enqueue fails.
        while self.span(prospective_last) > self.capacity && self.completed_count > 0 {
            self.remove_completed_head(1);
        }

        if self.span(prospective_last) > self.capacity {
            tracing::debug!(
                queue = %self.name,
                lsn,
                capacity = self.capacity,
                "enqueue rejected by capacity"
            );
            return Err(Status::QueueFull);
        }
        Ok(())
    }

    // Span the ring would have to cover if `last` were the tail.
    fn span(&self, last: i64) -> u64 {
        (last - self.first_available_completed).max(0) as u64
    }

    fn highest_retained(&self) -> i64 {
        self.items
            .last_key_value()
            .map_or(self.first_available_completed, |(lsn, _)| *lsn)
            .max(self.last_committed)
    }

    /// Out-of-order uncommitted operations strictly above `lsn`, ascending.
    /// These sit beyond the first gap and can be re-offered by the sender's
    /// retry, so they are safe to shed under memory pressure.
    fn droppable_above(&self, lsn: i64) -> Vec<(i64, u64)> {
        let gap = self.first_gap();
        self.items
            .range(gap..)
            .filter(|(candidate, _)| **candidate > lsn && **candidate > self.last_committed)
            .map(|(candidate, op)| (*candidate, op.payload_size()))
            .collect()
    }

    // First unfilled sequence number at or above the committed frontier.
    fn first_gap(&self) -> i64 {
        let mut gap = self.last_committed + 1;
        while self.items.contains_key(&gap) {
            gap += 1;
        }
        gap
    }

    fn remove_completed_head(&mut self, count: u64) {
        for _ in 0..count {
            if self.completed_count == 0 {
                return;
            }
            let head = self.first_available_completed + 1;
            if let Some(op) = self.items.remove(&head) {
                let size = op.payload_size();
                self.total_memory -= size;
                self.completed_memory -= size;
            }
            self.completed_count -= 1;
            self.first_available_completed = head;
        }
    }

    // ------------------------------------------------------------------
    // Commit / complete
    // ------------------------------------------------------------------

    /// Advances the committed frontier to the highest contiguous filled
    /// sequence number at or below `up_to`. Returns `true` on any advance.
    pub fn commit(&mut self, up_to: Lsn) -> bool {
        self.advance_commit(up_to.get())
    }

    /// Commits everything contiguous.
    pub fn commit_all(&mut self) -> bool {
        self.advance_commit(self.last)
    }

    fn advance_commit(&mut self, up_to: i64) -> bool {
        let mut advanced = false;
        while self.last_committed < up_to {
            let next = self.last_committed + 1;
            if !self.items.contains_key(&next) {
                break;
            }
            self.last_committed = next;
            advanced = true;
        }
        advanced
    }

    /// Advances the completed frontier through committed operations at or
    /// below `up_to`, moving them into the completed window (or releasing
    /// them under clean-on-complete). Returns `true` on any advance.
    pub fn complete(&mut self, up_to: Lsn) -> bool {
        let target = up_to.get().min(self.last_committed);
        let mut advanced = false;
        while self.next_to_be_completed <= target {
            let lsn = self.next_to_be_completed;
            let size = self
                .items
                .get(&lsn)
                .map(|op| op.payload_size())
                .expect("committed slot must be occupied");
            self.next_to_be_completed += 1;
            advanced = true;

            if self.options.clean_on_complete {
                self.items.remove(&lsn);
                self.total_memory -= size;
                self.first_available_completed = lsn;
            } else {
                self.completed_count += 1;
                self.completed_memory += size;
            }
        }

        if advanced {
            self.enforce_completed_window();
            self.maybe_shrink();
        }
        advanced
    }

    /// Completes everything committed.
    pub fn complete_all(&mut self) -> bool {
        self.complete(Lsn::new(self.last_committed))
    }

    fn enforce_completed_window(&mut self) {
        let max_count = self.options.max_completed_size;
        if max_count > 0 && self.completed_count > max_count {
            self.remove_completed_head(self.completed_count - max_count);
        }
        let max_memory = self.options.max_completed_memory_size;
        if max_memory > 0 {
            while self.completed_memory > max_memory && self.completed_count > 0 {
                self.remove_completed_head(1);
            }
        }
    }

    fn maybe_shrink(&mut self) {
        let span = self.span(self.last).max(1);
        let mut changed = false;
        while span * 4 <= self.capacity
            && self.capacity / 2 >= ceiling_power_of_2(self.options.initial_size.max(1))
        {
            self.capacity /= 2;
            changed = true;
        }
        if changed {
            self.capacity_change_count += 1;
        }
    }

    // ------------------------------------------------------------------
    // Truncation
    // ------------------------------------------------------------------

    /// Force-drops completed items with sequence numbers at or below
    /// `up_to`.
    pub fn update_complete_head(&mut self, up_to: Lsn) {
        let bound = up_to.get().min(self.next_to_be_completed - 1);
        while self.first_available_completed < bound && self.completed_count > 0 {
            self.remove_completed_head(1);
        }
    }

    /// Drops every operation that has not completed (including committed
    /// ones) and shrinks the capacity toward its initial size. The abort
    /// path of a drain.
    pub fn discard_non_completed(&mut self) {
        let removed: Vec<i64> = self
            .items
            .range(self.next_to_be_completed..)
            .map(|(lsn, _)| *lsn)
            .collect();
        for lsn in removed {
            if let Some(op) = self.items.remove(&lsn) {
                self.total_memory -= op.payload_size();
            }
        }
        self.last = self.next_to_be_completed - 1;
        self.last_committed = self.last;

        let target = bounded_capacity(
            ceiling_power_of_2(self.span(self.last).max(1)),
            self.options.initial_size,
            self.options.max_size,
        );
        if target != self.capacity {
            self.capacity = target;
            self.capacity_change_count += 1;
        }
    }

    /// Drops uncommitted operations beyond the committed frontier. Used
    /// when an epoch change invalidates the out-of-order tail.
    pub fn discard_uncommitted_tail(&mut self) -> u64 {
        let removed: Vec<i64> = self
            .items
            .range(self.last_committed + 1..)
            .map(|(lsn, _)| *lsn)
            .collect();
        let count = removed.len() as u64;
        for lsn in removed {
            if let Some(op) = self.items.remove(&lsn) {
                self.total_memory -= op.payload_size();
            }
        }
        self.last = self.last_committed;
        count
    }

    // ------------------------------------------------------------------
    // Invariant check (tests and debug assertions)
    // ------------------------------------------------------------------

    /// Verifies the frontier ordering and exact memory accounting.
    pub fn check_invariants(&self) {
        assert!(self.start_seq - 1 <= self.first_available_completed);
        assert!(self.first_available_completed <= self.next_to_be_completed - 1);
        assert!(self.next_to_be_completed - 1 <= self.last_committed);
        assert!(self.last_committed <= self.last);

        let total: u64 = self.items.values().map(|op| op.payload_size()).sum();
        assert_eq!(total, self.total_memory, "total memory accounting drift");

        let completed: u64 = self
            .items
            .range(self.first_available_completed + 1..self.next_to_be_completed)
            .map(|(_, op)| op.payload_size())
            .sum();
        assert_eq!(
            completed, self.completed_memory,
            "completed memory accounting drift"
        );

        assert!(self.capacity.is_power_of_two());
        for (lsn, _) in &self.items {
            assert!(*lsn > self.first_available_completed && *lsn <= self.last);
        }
    }
}

/// Smallest power of two at or above `n`.
pub fn ceiling_power_of_2(n: u64) -> u64 {
    n.max(1).next_power_of_two()
}

// Clamp a power-of-two target into [initial, max], flooring a non-power-of-
// two max.
fn bounded_capacity(target: u64, initial: u64, max: u64) -> u64 {
    let floor = ceiling_power_of_2(initial.max(1));
    if max == 0 {
        return target.max(floor);
    }
    let ceil = prev_power_of_2(max.max(1)).max(floor);
    target.clamp(floor, ceil)
}

fn prev_power_of_2(n: u64) -> u64 {
    let mut p = 1;
    while p * 2 <= n {
        p *= 2;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use stratum_types::{Epoch, OperationMetadata};
    use test_case::test_case;

    const START: i64 = 10;

    fn op(lsn: i64, size: usize) -> Arc<Operation> {
        Operation::new(
            OperationMetadata::normal(Lsn::new(lsn), Epoch::new(1, 100)),
            vec![Bytes::from(vec![0u8; size])],
        )
    }

    fn queue(
        initial: u64,
        max: u64,
        max_memory: u64,
        clean_on_complete: bool,
        ignore_commit: bool,
    ) -> OperationQueue {
        OperationQueue::new(
            "test",
            Lsn::new(START),
            OperationQueueOptions {
                initial_size: initial,
                max_size: max,
                max_memory_size: max_memory,
                max_completed_size: 0,
                max_completed_memory_size: 0,
                clean_on_complete,
                ignore_commit,
            },
        )
    }

    fn enqueue_ok(q: &mut OperationQueue, lsn: i64, size: usize) {
        assert_eq!(q.try_enqueue(op(lsn, size)), Ok(EnqueueOutcome::Enqueued));
        q.check_invariants();
    }

    fn enqueue_full(q: &mut OperationQueue, lsn: i64, size: usize) {
        assert_eq!(q.try_enqueue(op(lsn, size)), Err(Status::QueueFull));
        q.check_invariants();
    }

    #[test]
    fn power_of_two_computations() {
        assert_eq!(ceiling_power_of_2(1 << 3), 1 << 3);
        assert_eq!(ceiling_power_of_2((1 << 4) + (1 << 6) + 1), 1 << 7);
        assert_eq!(ceiling_power_of_2((1 << 10) + (1 << 9) + (1 << 2)), 1 << 11);
        assert_eq!(ceiling_power_of_2(0), 1);
        assert_eq!(ceiling_power_of_2(1), 1);
    }

    #[test_case(true; "clean on complete")]
    #[test_case(false; "retain completed window")]
    fn in_order_fill_commit_complete(clean_on_complete: bool) {
        let mut q = queue(4, 8, 0, clean_on_complete, false);
        for lsn in START..START + 4 {
            enqueue_ok(&mut q, lsn, 100);
        }
        assert_eq!(q.last_sequence_number(), Lsn::new(START + 3));
        assert_eq!(q.total_memory_size(), 400);

        assert!(q.commit(Lsn::new(START + 3)));
        assert!(!q.commit(Lsn::new(START + 3)), "second commit is a no-op");
        assert_eq!(q.last_committed_sequence_number(), Lsn::new(START + 3));

        assert!(q.complete(Lsn::new(START + 1)));
        assert_eq!(
            q.next_to_be_completed_sequence_number(),
            Lsn::new(START + 2)
        );
        if clean_on_complete {
            assert_eq!(q.total_memory_size(), 200);
            assert_eq!(q.completed_memory_size(), 0);
            assert_eq!(q.last_removed_sequence_number(), Lsn::new(START + 1));
        } else {
            assert_eq!(q.total_memory_size(), 400);
            assert_eq!(q.completed_memory_size(), 200);
            assert_eq!(q.last_removed_sequence_number(), Lsn::new(START - 1));
        }
        q.check_invariants();
    }

    #[test]
    fn growth_is_preferred_over_reclaiming_completed() {
        // Initial 2, max 8: after two completed items, the third enqueue
        // must expand rather than clean the window.
        let mut q = queue(2, 8, 0, false, false);
        enqueue_ok(&mut q, START, 100);
        enqueue_ok(&mut q, START + 1, 100);
        q.commit(Lsn::new(START + 1));
        q.complete(Lsn::new(START + 1));
        assert_eq!(q.total_memory_size(), 200);
        assert_eq!(q.completed_memory_size(), 200);

        let changes_before = q.capacity_change_count();
        enqueue_ok(&mut q, START + 2, 100);
        assert!(q.capacity_change_count() > changes_before, "queue expanded");
        // The completed window was not touched.
        assert_eq!(q.completed_memory_size(), 200);
        assert_eq!(q.total_memory_size(), 300);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START - 1));
    }

    #[test]
    fn enqueue_with_memory_limit() {
        // Initial 4, max 8, memory 600; commit follows enqueue.
        let mut q = queue(4, 8, 600, false, true);

        // |0123
        for lsn in START..START + 4 {
            enqueue_ok(&mut q, lsn, 100);
        }
        assert_eq!(q.total_memory_size(), 400);

        // 0|123
        assert!(q.complete(Lsn::new(START)));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (400, 100));

        // 301 bytes cannot fit even if the whole window is reclaimed.
        enqueue_full(&mut q, START + 4, 301);
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (400, 100));
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START - 1));

        // Exceeds the count limit instead: grows.
        let changes = q.capacity_change_count();
        enqueue_ok(&mut q, START + 4, 100);
        assert!(q.capacity_change_count() > changes);
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (500, 100));

        // 01|234
        assert!(q.complete(Lsn::new(START + 1)));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (500, 200));

        // Reclaims exactly one completed item to fit.
        enqueue_ok(&mut q, START + 5, 198);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (598, 100));

        enqueue_ok(&mut q, START + 6, 1);
        enqueue_ok(&mut q, START + 7, 1);
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 100));

        // 1234|567
        assert!(q.complete(Lsn::new(START + 4)));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 400));

        // One byte over: one completed item reclaimed.
        enqueue_ok(&mut q, START + 8, 1);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START + 1));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (501, 300));

        // Out-of-order 399 bytes: three completed items reclaimed.
        enqueue_ok(&mut q, START + 10, 399);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START + 4));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 0));

        // 56|78.A
        assert!(q.complete(Lsn::new(START + 6)));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 199));

        // Needs the rest of the window.
        enqueue_ok(&mut q, START + 14, 199);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START + 6));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 0));

        // Dropping only operations above the incoming LSN cannot fit this.
        enqueue_full(&mut q, START + 12, 200);
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 0));

        // Fits by shedding the out-of-order tail above it.
        let dropped_before = q.dropped_out_of_order_count();
        enqueue_ok(&mut q, START + 9, 598);
        assert_eq!(q.dropped_out_of_order_count(), dropped_before + 2);
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 0));
        assert_eq!(q.last_sequence_number(), Lsn::new(START + 9));

        let changes = q.capacity_change_count();
        q.discard_non_completed();
        q.check_invariants();
        assert!(q.capacity_change_count() > changes, "discard shrinks");
    }

    #[test]
    fn enqueue_with_memory_limit_and_no_size_limit() {
        let mut q = queue(4, 0, 600, false, true);

        for lsn in START..START + 4 {
            enqueue_ok(&mut q, lsn, 100);
        }
        assert!(q.complete(Lsn::new(START + 2)));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (400, 300));

        // Infeasible even with the whole window reclaimed.
        enqueue_full(&mut q, START + 4, 501);
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (400, 300));

        // Two completed items reclaimed.
        enqueue_ok(&mut q, START + 4, 400);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START + 1));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 100));

        assert!(q.complete(Lsn::new(START + 3)));
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 200));

        // Far out-of-order enqueue: capacity grows unbounded, one completed
        // item reclaimed for memory.
        let changes = q.capacity_change_count();
        enqueue_ok(&mut q, START + 9000, 100);
        assert!(q.capacity_change_count() > changes);
        assert_eq!((q.total_memory_size(), q.completed_memory_size()), (600, 100));

        q.discard_non_completed();
        q.check_invariants();
        assert_eq!(q.capacity(), 4);
    }

    #[test]
    fn out_of_order_enqueue_and_count_reclaim() {
        let mut q = queue(4, 8, 0, false, true);

        for lsn in START..START + 4 {
            enqueue_ok(&mut q, lsn, 100);
        }
        assert!(q.complete(Lsn::new(START)));

        // Grows 4 -> 8.
        let changes = q.capacity_change_count();
        enqueue_ok(&mut q, START + 4, 100);
        assert!(q.capacity_change_count() > changes);

        assert!(q.complete(Lsn::new(START + 3)));

        // Out-of-order with room.
        enqueue_ok(&mut q, START + 6, 100);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START - 1));

        // Out-of-order needing two reclaimed completed items.
        enqueue_ok(&mut q, START + 9, 100);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START + 1));

        assert!(q.complete(Lsn::new(START + 4)));

        // Beyond capacity even after reclaiming: fails, reclamation kept.
        enqueue_full(&mut q, START + 13, 100);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(START + 4));

        // Fill the gap; the contiguous frontier advances over it.
        enqueue_ok(&mut q, START + 5, 100);
        assert_eq!(q.last_committed_sequence_number(), Lsn::new(START + 6));

        assert!(q.complete(Lsn::new(START + 6)));
        q.discard_non_completed();
        q.check_invariants();
    }

    #[test]
    fn complete_before_commit_fails() {
        let mut q = queue(4, 8, 0, false, false);
        enqueue_ok(&mut q, 1, 100);
        assert!(!q.complete_all(), "nothing committed yet");
        assert!(q.commit_all());
        assert!(q.complete_all());
        q.update_complete_head(q.next_to_be_completed_sequence_number());
        assert_eq!(q.item_count(), 0);
        q.check_invariants();
    }

    #[test]
    fn duplicate_enqueue_is_idempotent() {
        let mut q = queue(4, 8, 0, false, false);
        enqueue_ok(&mut q, START, 100);
        let memory = q.total_memory_size();
        assert_eq!(q.try_enqueue(op(START, 100)), Ok(EnqueueOutcome::Duplicate));
        assert_eq!(q.total_memory_size(), memory);
        assert_eq!(q.item_count(), 1);
        q.check_invariants();
    }

    #[test]
    fn stale_enqueue_is_rejected() {
        let mut q = queue(4, 8, 0, true, false);
        enqueue_ok(&mut q, START, 100);
        q.commit_all();
        q.complete_all();
        // Cleaned on complete: the slot is gone and below the head.
        assert_eq!(q.try_enqueue(op(START, 100)), Err(Status::StaleOperation));
        assert_eq!(q.try_enqueue(op(START - 5, 1)), Err(Status::StaleOperation));
    }

    #[test]
    fn completed_window_bounds_advance_the_head() {
        let mut q = OperationQueue::new(
            "window",
            Lsn::new(1),
            OperationQueueOptions {
                initial_size: 16,
                max_size: 16,
                max_completed_size: 2,
                ..OperationQueueOptions::default()
            },
        );
        for lsn in 1..=5 {
            enqueue_ok(&mut q, lsn, 10);
        }
        q.commit_all();
        assert!(q.complete_all());
        // Only the two most recent completed operations are retained.
        assert_eq!(q.completed_count(), 2);
        assert_eq!(q.last_removed_sequence_number(), Lsn::new(3));
        assert_eq!(q.total_memory_size(), 20);
        q.check_invariants();
    }

    #[test]
    fn discard_uncommitted_tail_drops_beyond_gap() {
        let mut q = queue(16, 16, 0, false, false);
        enqueue_ok(&mut q, START, 10);
        enqueue_ok(&mut q, START + 1, 10);
        enqueue_ok(&mut q, START + 3, 10);
        q.commit_all();
        assert_eq!(q.last_committed_sequence_number(), Lsn::new(START + 1));

        assert_eq!(q.discard_uncommitted_tail(), 1);
        assert_eq!(q.last_sequence_number(), Lsn::new(START + 1));
        assert_eq!(q.item_count(), 2);
        q.check_invariants();

        // The gap slot can be filled again afterwards.
        enqueue_ok(&mut q, START + 2, 10);
        q.commit_all();
        assert_eq!(q.last_committed_sequence_number(), Lsn::new(START + 2));
    }

    #[test]
    fn utilization_uses_the_larger_pressure() {
        let mut q = queue(4, 10, 1000, false, false);
        enqueue_ok(&mut q, START, 600);
        assert_eq!(q.utilization_percentage(), 60);
        enqueue_ok(&mut q, START + 1, 0);
        enqueue_ok(&mut q, START + 2, 0);
        enqueue_ok(&mut q, START + 3, 0);
        enqueue_ok(&mut q, START + 4, 0);
        // 5/10 items vs 600/1000 bytes.
        assert_eq!(q.utilization_percentage(), 60);
        enqueue_ok(&mut q, START + 5, 0);
        enqueue_ok(&mut q, START + 6, 0);
        assert_eq!(q.utilization_percentage(), 70);
    }

    proptest! {
        // Random interleavings of enqueue/commit/complete keep the frontier
        // ordering and the memory accounting exact.
        #[test]
        fn random_operations_hold_invariants(
            seed_ops in proptest::collection::vec((0i64..40, 1usize..200), 1..60),
            complete_every in 1usize..5,
            clean in proptest::bool::ANY,
        ) {
            let mut q = queue(4, 32, 4000, clean, false);
            for (step, (offset, size)) in seed_ops.iter().enumerate() {
                let _ = q.try_enqueue(op(START + offset, *size));
                q.check_invariants();
                if step % complete_every == 0 {
                    q.commit_all();
                    q.check_invariants();
                    q.complete_all();
                    q.check_invariants();
                }
            }
            q.commit_all();
            q.complete_all();
            q.check_invariants();
        }
    }
}
