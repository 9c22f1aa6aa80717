use crate::config::{SchedulerConfig, SchedulingPolicy};
use crate::hardware::CpuId;
use crate::scheduler::SchedulerHost;
use crate::scheduler::queue::TaskQueue;
use crate::task::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Reference scheduler: one global lock guards the ready queue, the unblocked
/// queue, and the idle-CPU deque. Correctness by mutual exclusion.
pub(crate) struct NaiveScheduler {
    inner: Mutex<NaiveInner>,
}

struct NaiveInner {
    ready: TaskQueue,
    unblocked: VecDeque<Arc<Task>>,
    idle_cpus: VecDeque<CpuId>,
}

impl NaiveScheduler {
    pub(crate) fn new(policy: SchedulingPolicy, prioritized: bool) -> Self {
        Self {
            inner: Mutex::new(NaiveInner {
                ready: TaskQueue::new(policy, prioritized),
                unblocked: VecDeque::new(),
                idle_cpus: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn from_config(cfg: &SchedulerConfig) -> Self {
        Self::new(cfg.policy, cfg.priority)
    }

    /// Admits a ready task. Returns an idle CPU for the caller to wake, if
    /// one was waiting.
    pub(crate) fn add_ready_task(&self, task: Arc<Task>) -> Option<CpuId> {
        let mut inner = self.inner.lock();
        inner.ready.push(task);
        inner.idle_cpus.pop_front()
    }

    pub(crate) fn task_gets_unblocked(&self, task: Arc<Task>) -> Option<CpuId> {
        let mut inner = self.inner.lock();
        inner.unblocked.push_back(task);
        inner.idle_cpus.pop_front()
    }

    /// Unblocked tasks run before fresh ready ones. An empty poll records the
    /// CPU as idle.
    pub(crate) fn get_ready_task(&self, host: &dyn SchedulerHost, cpu: CpuId) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock();

        let task = inner.unblocked.pop_front().or_else(|| inner.ready.pop());

        match task {
            Some(task) => {
                // The CPU may still be queued from an earlier empty poll.
                inner.idle_cpus.retain(|&c| c != cpu);
                drop(inner);
                host.cpu_unidled(cpu);
                Some(task)
            }
            None => {
                if !inner.idle_cpus.contains(&cpu) {
                    inner.idle_cpus.push_back(cpu);
                }
                drop(inner);
                host.cpu_becomes_idle(cpu);
                None
            }
        }
    }

    pub(crate) fn get_idle_compute_place(
        &self,
        host: &dyn SchedulerHost,
        force: bool,
    ) -> Option<CpuId> {
        let popped = self.inner.lock().idle_cpus.pop_front();
        popped.or_else(|| if force { host.registry_first_idle() } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::RecordingHost;

    #[test]
    fn round_trip_yields_each_task_exactly_once() {
        let host = RecordingHost::default();
        let sched = NaiveScheduler::new(SchedulingPolicy::Fifo, false);
        let task = Task::new("only", |_| {});
        assert!(sched.add_ready_task(task.clone()).is_none());

        let mut seen = 0;
        for cpu in 0..4 {
            if sched.get_ready_task(&host, cpu).is_some() {
                seen += 1;
            }
        }
        assert_eq!(seen, 1);

        // Further polls return nothing and record the CPUs as idle.
        assert!(sched.get_ready_task(&host, 0).is_none());
        assert!(sched.get_ready_task(&host, 1).is_none());
    }

    #[test]
    fn add_returns_an_idle_cpu_for_wakeup() {
        let host = RecordingHost::default();
        let sched = NaiveScheduler::new(SchedulingPolicy::Fifo, false);

        assert!(sched.get_ready_task(&host, 3).is_none());
        let idle = sched.add_ready_task(Task::new("t", |_| {}));
        assert_eq!(idle, Some(3));

        // The idle entry was consumed.
        assert!(sched.add_ready_task(Task::new("u", |_| {})).is_none());
    }

    #[test]
    fn unblocked_tasks_run_before_ready_ones() {
        let host = RecordingHost::default();
        let sched = NaiveScheduler::new(SchedulingPolicy::Fifo, false);

        sched.add_ready_task(Task::new("ready", |_| {}));
        sched.task_gets_unblocked(Task::new("unblocked", |_| {}));

        let first = sched.get_ready_task(&host, 0).unwrap();
        assert_eq!(first.label(), "unblocked");
        let second = sched.get_ready_task(&host, 0).unwrap();
        assert_eq!(second.label(), "ready");
    }

    #[test]
    fn idle_compute_place_prefers_recorded_cpus() {
        let host = RecordingHost::default();
        let sched = NaiveScheduler::new(SchedulingPolicy::Fifo, false);

        assert_eq!(sched.get_idle_compute_place(&host, false), None);
        assert!(sched.get_ready_task(&host, 2).is_none());
        assert_eq!(sched.get_idle_compute_place(&host, false), Some(2));
    }
}
