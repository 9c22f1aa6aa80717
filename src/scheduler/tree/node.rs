use crate::scheduler::SchedulerHost;
use crate::scheduler::queue::TaskBatch;
use crate::scheduler::tree::leaf::LeafScheduler;
use crate::task::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

/// Upper bound on the per-leaf queue threshold; past this point overflow
/// batches stop being useful for balancing.
const THRESHOLD_CEILING: usize = 1024;

/// Interior scheduler node: aggregates the leaves' overflow, feeds leaves
/// that ran dry, and recomputes the per-leaf queue thresholds from the fleet
/// load profile.
pub(crate) struct NodeScheduler {
    inner: Mutex<NodeInner>,
    children: OnceLock<Vec<Arc<LeafScheduler>>>,
}

struct NodeInner {
    queue: VecDeque<Arc<Task>>,
    /// Leaves that requested work while the node was empty, in request order.
    hungry: VecDeque<usize>,
}

impl NodeScheduler {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(NodeInner {
                queue: VecDeque::new(),
                hungry: VecDeque::new(),
            }),
            children: OnceLock::new(),
        }
    }

    pub(crate) fn set_children(&self, children: Vec<Arc<LeafScheduler>>) {
        self.children
            .set(children)
            .unwrap_or_else(|_| panic!("scheduler tree children initialized twice"));
    }

    fn children(&self) -> &[Arc<LeafScheduler>] {
        self.children
            .get()
            .expect("scheduler tree children not initialized")
    }

    pub(crate) fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Absorbs a batch overflowed (or drained) from a child, then hands tasks
    /// straight back out to any leaves that are waiting for work.
    pub(crate) fn add_task_batch(&self, host: &dyn SchedulerHost, _from: usize, batch: TaskBatch) {
        debug_assert!(!batch.is_empty());
        {
            let mut inner = self.inner.lock();
            inner.queue.extend(batch);
        }
        self.feed_hungry(host);
    }

    /// A leaf ran out of local work. Delivery is asynchronous: either a batch
    /// goes out right now, or the leaf is recorded and fed when tasks arrive;
    /// in both cases the batch lands through the leaf's polling slot.
    pub(crate) fn child_requests_work(&self, host: &dyn SchedulerHost, child: usize) {
        let batch = {
            let mut inner = self.inner.lock();
            if inner.queue.is_empty() {
                if !inner.hungry.contains(&child) {
                    inner.hungry.push_back(child);
                }
                None
            } else {
                Some(Self::drain_batch(
                    &mut inner.queue,
                    self.children()[child].queue_threshold(),
                ))
            }
        };

        if let Some(batch) = batch {
            self.children()[child].add_task_batch(host, batch);
        }

        self.recompute_thresholds();
    }

    fn feed_hungry(&self, host: &dyn SchedulerHost) {
        loop {
            let delivery = {
                let mut inner = self.inner.lock();
                if inner.queue.is_empty() {
                    break;
                }
                match inner.hungry.pop_front() {
                    None => break,
                    Some(child) if self.children()[child].is_disabled() => continue,
                    Some(child) => {
                        let batch = Self::drain_batch(
                            &mut inner.queue,
                            self.children()[child].queue_threshold(),
                        );
                        (child, batch)
                    }
                }
            };

            let (child, batch) = delivery;
            if !batch.is_empty() {
                self.children()[child].add_task_batch(host, batch);
            }
        }

        self.recompute_thresholds();
    }

    fn drain_batch(queue: &mut VecDeque<Arc<Task>>, threshold: usize) -> TaskBatch {
        let take = queue.len().min(threshold.max(1));
        queue.drain(..take).collect()
    }

    /// Distributes the in-flight total proportionally across the non-idle
    /// leaves: monotone in load, inversely monotone in active-leaf count.
    fn recompute_thresholds(&self) {
        let children = self.children();

        let total =
            self.queued() + children.iter().map(|c| c.queued()).sum::<usize>();
        let non_idle = children
            .iter()
            .filter(|c| !c.is_idle() && !c.is_disabled())
            .count()
            .max(1);

        let threshold = (total / non_idle).clamp(1, THRESHOLD_CEILING);
        for child in children {
            child.update_queue_threshold(threshold);
        }
    }
}
