use crate::config::SchedulingPolicy;
use crate::task::Task;
use smallvec::SmallVec;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

/// Batches extracted for rebalancing stay on the stack for typical thresholds.
pub(crate) type TaskBatch = SmallVec<[Arc<Task>; 8]>;

/// Ready-task backing queue honoring the configured ordering: FIFO, LIFO, or
/// priority order (ties broken FIFO) when priorities are enabled.
pub(crate) struct TaskQueue {
    policy: SchedulingPolicy,
    inner: Inner,
}

enum Inner {
    Deque(VecDeque<Arc<Task>>),
    Heap { heap: BinaryHeap<PriorityEntry>, seq: u64 },
}

struct PriorityEntry {
    priority: i64,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on priority; earlier submissions win ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl TaskQueue {
    pub(crate) fn new(policy: SchedulingPolicy, prioritized: bool) -> Self {
        let inner = if prioritized {
            Inner::Heap {
                heap: BinaryHeap::new(),
                seq: 0,
            }
        } else {
            Inner::Deque(VecDeque::new())
        };
        Self { policy, inner }
    }

    /// Adds a task; returns the new queue length.
    pub(crate) fn push(&mut self, task: Arc<Task>) -> usize {
        match &mut self.inner {
            Inner::Deque(deque) => {
                deque.push_back(task);
                deque.len()
            }
            Inner::Heap { heap, seq } => {
                let entry = PriorityEntry {
                    priority: task.priority(),
                    seq: *seq,
                    task,
                };
                *seq += 1;
                heap.push(entry);
                heap.len()
            }
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<Task>> {
        match &mut self.inner {
            Inner::Deque(deque) => match self.policy {
                SchedulingPolicy::Fifo => deque.pop_front(),
                SchedulingPolicy::Lifo => deque.pop_back(),
            },
            Inner::Heap { heap, .. } => heap.pop().map(|entry| entry.task),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.inner {
            Inner::Deque(deque) => deque.len(),
            Inner::Heap { heap, .. } => heap.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extracts up to `count` tasks for the parent, taken from the end
    /// opposite the dequeue end (or from the low-priority end), so the order
    /// of what remains matches the configured policy.
    pub(crate) fn extract_batch(&mut self, count: usize) -> TaskBatch {
        let count = count.min(self.len());
        let mut batch = TaskBatch::new();

        match &mut self.inner {
            Inner::Deque(deque) => {
                for _ in 0..count {
                    let task = match self.policy {
                        SchedulingPolicy::Fifo => deque.pop_back(),
                        SchedulingPolicy::Lifo => deque.pop_front(),
                    };
                    match task {
                        Some(task) => batch.push(task),
                        None => break,
                    }
                }
            }
            Inner::Heap { heap, .. } => {
                let mut entries = std::mem::take(heap).into_sorted_vec();
                // Ascending order: ship the lowest-priority entries.
                for entry in entries.drain(..count) {
                    batch.push(entry.task);
                }
                heap.extend(entries);
            }
        }

        batch
    }

    pub(crate) fn extract_all(&mut self) -> TaskBatch {
        self.extract_batch(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(queue: &mut TaskQueue) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(task) = queue.pop() {
            out.push(task.label().to_string());
        }
        out
    }

    fn push_named(queue: &mut TaskQueue, names: &[&str]) {
        for name in names {
            queue.push(Task::new(*name, |_| {}));
        }
    }

    #[rstest]
    #[case(SchedulingPolicy::Fifo, &["a", "b", "c"])]
    #[case(SchedulingPolicy::Lifo, &["c", "b", "a"])]
    fn deque_respects_policy(#[case] policy: SchedulingPolicy, #[case] expected: &[&str]) {
        let mut queue = TaskQueue::new(policy, false);
        push_named(&mut queue, &["a", "b", "c"]);
        assert_eq!(labels(&mut queue), expected);
    }

    #[test]
    fn priority_order_with_fifo_ties() {
        let mut queue = TaskQueue::new(SchedulingPolicy::Fifo, true);
        queue.push(Task::build("low").priority(1).body(|_| {}).finish());
        queue.push(Task::build("hi-1").priority(9).body(|_| {}).finish());
        queue.push(Task::build("hi-2").priority(9).body(|_| {}).finish());

        assert_eq!(labels(&mut queue), ["hi-1", "hi-2", "low"]);
    }

    #[test]
    fn batch_extraction_preserves_local_fifo_order() {
        let mut queue = TaskQueue::new(SchedulingPolicy::Fifo, false);
        push_named(&mut queue, &["a", "b", "c", "d", "e"]);

        let batch = queue.extract_batch(2);
        let batch_labels: Vec<_> = batch.iter().map(|t| t.label().to_string()).collect();
        // The newest submissions leave; the oldest keep running FIFO locally.
        assert_eq!(batch_labels, ["e", "d"]);
        assert_eq!(labels(&mut queue), ["a", "b", "c"]);
    }

    #[test]
    fn batch_extraction_ships_lowest_priority() {
        let mut queue = TaskQueue::new(SchedulingPolicy::Fifo, true);
        for (name, prio) in [("p1", 1), ("p5", 5), ("p9", 9)] {
            queue.push(Task::build(name).priority(prio).body(|_| {}).finish());
        }

        let batch = queue.extract_batch(1);
        assert_eq!(batch[0].label(), "p1");
        assert_eq!(labels(&mut queue), ["p9", "p5"]);
    }

    #[test]
    fn extract_batch_caps_at_len() {
        let mut queue = TaskQueue::new(SchedulingPolicy::Fifo, false);
        push_named(&mut queue, &["a"]);
        assert_eq!(queue.extract_batch(10).len(), 1);
        assert!(queue.is_empty());
    }
}
