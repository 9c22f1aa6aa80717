use crate::config::SchedulerConfig;
use crate::hardware::CpuId;
use crate::scheduler::SchedulerHost;
use crate::scheduler::queue::{TaskBatch, TaskQueue};
use crate::scheduler::tree::node::NodeScheduler;
use crate::task::Task;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Per-CPU scheduler leaf.
///
/// The polling slot is the preferred channel for cross-CPU submission: a task
/// landing there wakes the owning CPU directly instead of waiting for the next
/// queue poll. The queue absorbs the rest, overflowing batches to the parent
/// whenever it grows past the dynamic threshold.
pub(crate) struct LeafScheduler {
    cpu: CpuId,
    polling_iterations: usize,

    queue_threshold: AtomicUsize,
    rebalance: AtomicBool,
    idle: AtomicBool,
    disabled: AtomicBool,

    /// Queue length mirror, readable by the parent without the leaf lock.
    queued: AtomicUsize,

    parent: Arc<NodeScheduler>,
    inner: Mutex<LeafInner>,
}

struct LeafInner {
    slot: Option<Arc<Task>>,
    queue: TaskQueue,
}

impl LeafScheduler {
    pub(crate) fn new(cpu: CpuId, cfg: &SchedulerConfig, parent: Arc<NodeScheduler>) -> Self {
        Self {
            cpu,
            polling_iterations: cfg.polling_iterations,
            queue_threshold: AtomicUsize::new(0),
            rebalance: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            parent,
            inner: Mutex::new(LeafInner {
                slot: None,
                queue: TaskQueue::new(cfg.policy, cfg.priority),
            }),
        }
    }

    pub(crate) fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub(crate) fn queue_threshold(&self) -> usize {
        self.queue_threshold.load(Ordering::Acquire)
    }

    /// Admits one ready task.
    ///
    /// `has_compute_place` means the caller already runs on this leaf's CPU,
    /// so there is nobody to wake and the polling slot can be bypassed.
    pub(crate) fn add_task(
        &self,
        host: &dyn SchedulerHost,
        task: Arc<Task>,
        has_compute_place: bool,
    ) {
        if has_compute_place {
            debug_assert!(!self.is_idle());
            self.push_with_overflow_check(host, task);
        } else {
            let mut task = Some(task);
            let was_idle;
            {
                let mut inner = self.inner.lock();
                if inner.slot.is_none() {
                    inner.slot = task.take();
                    was_idle = self.is_idle();
                } else {
                    was_idle = false;
                }
            }

            match task {
                // Landed in the polling slot.
                None => {
                    if was_idle {
                        host.wake_cpu(self.cpu);
                    }
                }
                Some(task) => self.push_with_overflow_check(host, task),
            }
        }

        // Queue is already balanced.
        self.rebalance.store(false, Ordering::Release);
    }

    /// Receives a batch pushed down by the parent. The freshest task goes to
    /// the polling slot if it is free; the rest is queued.
    pub(crate) fn add_task_batch(&self, host: &dyn SchedulerHost, mut batch: TaskBatch) {
        debug_assert!(!batch.is_empty());

        let mut landed = false;
        let mut was_idle = false;
        {
            let mut inner = self.inner.lock();
            if inner.slot.is_none() {
                inner.slot = batch.pop();
                landed = true;
                was_idle = self.is_idle();
            }
            for task in batch.drain(..) {
                inner.queue.push(task);
            }
            self.queued.store(inner.queue.len(), Ordering::Release);
        }

        if landed && was_idle {
            host.wake_cpu(self.cpu);
        }
    }

    /// Polls for a task. `do_wait` enables the bounded busy-wait on the
    /// polling slot after asking the parent for work.
    pub(crate) fn get_task(&self, host: &dyn SchedulerHost, do_wait: bool) -> Option<Arc<Task>> {
        if self.idle.swap(false, Ordering::AcqRel) {
            host.cpu_unidled(self.cpu);
        }

        if let Some(task) = self.take_slot() {
            self.rebalance.store(false, Ordering::Release);
            return Some(task);
        }

        let popped = {
            let mut inner = self.inner.lock();
            let task = inner.queue.pop();
            self.queued.store(inner.queue.len(), Ordering::Release);
            task
        };
        if let Some(task) = popped {
            if self
                .rebalance
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let threshold = self.queue_threshold();
                if self.queued() > threshold + threshold / 2 {
                    self.handle_queue_overflow(host);
                }
            }
            return Some(task);
        }

        self.rebalance.store(false, Ordering::Release);

        // The parent may deliver a batch asynchronously; poll the slot for it.
        self.parent.child_requests_work(host, self.cpu);

        let mut task = None;
        if do_wait {
            for _ in 0..self.polling_iterations {
                task = self.take_slot();
                if task.is_some() {
                    break;
                }
                std::hint::spin_loop();
            }
        } else {
            task = self.take_slot();
        }

        if task.is_none() {
            // Timed out. Re-check under the lock so a concurrent slot
            // publication cannot be missed while we go idle.
            let mut inner = self.inner.lock();
            task = inner.slot.take();
            if task.is_none() {
                self.idle.store(true, Ordering::Release);
                host.cpu_becomes_idle(self.cpu);
            }
        }

        task
    }

    /// Administrative removal of the CPU: drain everything to the parent.
    pub(crate) fn disable(&self, host: &dyn SchedulerHost) {
        self.disabled.store(true, Ordering::Release);

        if self.idle.swap(false, Ordering::AcqRel) {
            host.cpu_unidled(self.cpu);
        }

        let batch = {
            let mut inner = self.inner.lock();
            let mut batch = inner.queue.extract_all();
            // A task may have been published before the leaf was marked
            // disabled.
            if let Some(task) = inner.slot.take() {
                batch.push(task);
            }
            self.queued.store(0, Ordering::Release);
            batch
        };

        if !batch.is_empty() {
            self.parent.add_task_batch(host, self.cpu, batch);
        }
    }

    pub(crate) fn enable(&self) {
        self.disabled.store(false, Ordering::Release);
    }

    /// Called by the parent when the fleet load profile changes. A shrinking
    /// threshold flags the leaf for rebalancing on its next dequeue.
    pub(crate) fn update_queue_threshold(&self, threshold: usize) {
        if threshold < self.queue_threshold.load(Ordering::Acquire) {
            self.rebalance.store(true, Ordering::Release);
        }
        self.queue_threshold.store(threshold, Ordering::Release);
    }

    fn take_slot(&self) -> Option<Arc<Task>> {
        self.inner.lock().slot.take()
    }

    #[cfg(test)]
    pub(crate) fn slot_occupied(&self) -> bool {
        self.inner.lock().slot.is_some()
    }

    fn push_with_overflow_check(&self, host: &dyn SchedulerHost, task: Arc<Task>) {
        let len = {
            let mut inner = self.inner.lock();
            let len = inner.queue.push(task);
            self.queued.store(len, Ordering::Release);
            len
        };

        if len > self.queue_threshold.load(Ordering::Acquire) {
            self.handle_queue_overflow(host);
        }
    }

    fn handle_queue_overflow(&self, host: &dyn SchedulerHost) {
        let half = (self.queue_threshold.load(Ordering::Acquire) / 2).max(1);

        let batch = {
            let mut inner = self.inner.lock();
            let batch = inner.queue.extract_batch(half);
            self.queued.store(inner.queue.len(), Ordering::Release);
            batch
        };

        // The queue might have been emptied just a moment ago.
        if !batch.is_empty() {
            tracing::trace!(cpu = self.cpu, moved = batch.len(), "leaf queue overflow");
            self.parent.add_task_batch(host, self.cpu, batch);
        }
    }
}
