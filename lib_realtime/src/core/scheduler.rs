//! # Run Scheduler
//!
//! A single min-heap of (instant, pipeline id) pairs drives every scheduled
//! pipeline in the engine. The tick loop pops entries whose instant has
//! passed and hands the ids to the pipeline engine; arming pushes a new
//! entry after each run.
//!
//! Entries are never removed eagerly when a pipeline is rescheduled or
//! retired. Instead the consumer validates each popped entry against the
//! pipeline's current `next_run_at` and drops the stale ones, which keeps
//! pause/resume and re-arming O(log n) instead of a heap rebuild.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One planned pipeline run. Ordering is by instant first, so equal-time
/// entries tie-break on the id and the heap stays a strict total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduledRun {
    pub at: DateTime<Utc>,
    pub pipeline_id: Uuid,
}

#[derive(Default)]
pub struct RunScheduler {
    heap: Mutex<BinaryHeap<Reverse<ScheduledRun>>>,
}

impl RunScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a run. Stale entries for the same pipeline may remain in the
    /// heap; the consumer is expected to discard them on pop.
    pub fn arm(&self, pipeline_id: Uuid, at: DateTime<Utc>) {
        self.heap
            .lock()
            .expect("Scheduler heap lock poisoned")
            .push(Reverse(ScheduledRun { at, pipeline_id }));
    }

    /// Pops every entry due at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ScheduledRun> {
        let mut heap = self.heap.lock().expect("Scheduler heap lock poisoned");
        let mut due = Vec::new();
        while let Some(Reverse(run)) = heap.peek() {
            if run.at > now {
                break;
            }
            due.push(heap.pop().expect("Peeked entry must pop").0);
        }
        due
    }

    /// The next `n` planned runs in firing order, without consuming them.
    /// Inspection only; may include entries a reschedule has obsoleted.
    pub fn next_runs(&self, n: usize) -> Vec<ScheduledRun> {
        let heap = self.heap.lock().expect("Scheduler heap lock poisoned");
        let mut sorted: Vec<ScheduledRun> = heap.iter().map(|Reverse(run)| *run).collect();
        sorted.sort();
        sorted.truncate(n);
        sorted
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("Scheduler heap lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.heap
            .lock()
            .expect("Scheduler heap lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn due_pops_earliest_first_and_only_past_entries() {
        let sched = RunScheduler::new();
        let now = Utc::now();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        sched.arm(a, now - Duration::seconds(10));
        sched.arm(b, now + Duration::seconds(60));
        sched.arm(c, now - Duration::seconds(5));

        let due = sched.due(now);
        assert_eq!(
            due.iter().map(|run| run.pipeline_id).collect::<Vec<_>>(),
            vec![a, c]
        );
        assert_eq!(sched.len(), 1, "future entry stays queued");
    }

    #[test]
    fn next_runs_inspects_without_consuming() {
        let sched = RunScheduler::new();
        let now = Utc::now();
        for offset in [30, 10, 20] {
            sched.arm(Uuid::new_v4(), now + Duration::seconds(offset));
        }

        let preview = sched.next_runs(2);
        assert_eq!(preview.len(), 2);
        assert!(preview[0].at < preview[1].at);
        assert_eq!(sched.len(), 3);
    }

    #[test]
    fn equal_instants_are_all_delivered() {
        let sched = RunScheduler::new();
        let at = Utc::now() - Duration::seconds(1);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            sched.arm(*id, at);
        }

        let due = sched.due(Utc::now());
        assert_eq!(due.len(), 3);
        for id in ids {
            assert!(due.iter().any(|run| run.pipeline_id == id));
        }
    }

    #[test]
    fn clear_empties_the_heap() {
        let sched = RunScheduler::new();
        sched.arm(Uuid::new_v4(), Utc::now());
        sched.clear();
        assert!(sched.is_empty());
    }
}
