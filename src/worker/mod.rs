pub(crate) mod pool;

use crate::hardware::{CpuId, CpuRegistry};
use crate::task::Task;
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Dense identifier of a worker in the pool.
pub type WorkerId = usize;

const NO_CPU: usize = usize::MAX;

thread_local! {
    static CURRENT_WORKER: Cell<Option<(WorkerId, CpuId)>> = const { Cell::new(None) };
}

pub(crate) fn set_current_worker(worker: WorkerId, cpu: CpuId) {
    CURRENT_WORKER.with(|current| current.set(Some((worker, cpu))));
}

/// The worker executing on the calling thread, if any. Poller and external
/// threads see `None`.
pub(crate) fn current_worker() -> Option<(WorkerId, CpuId)> {
    CURRENT_WORKER.with(|current| current.get())
}

pub(crate) fn current_cpu() -> Option<CpuId> {
    current_worker().map(|(_, cpu)| cpu)
}

struct ParkState {
    /// Binary-semaphore style signal counter: a resume delivered before the
    /// park is not lost.
    signals: u32,
    shutdown: bool,
}

/// Long-lived execution context bound to exactly one CPU at a time. Workers
/// migrate between CPUs by having a peer rebind their kernel affinity and
/// update `cpu_to_be_resumed_on` before signalling the condition.
pub(crate) struct WorkerThread {
    id: WorkerId,
    tid: OnceLock<Pid>,
    cpu: AtomicUsize,
    cpu_to_be_resumed_on: AtomicUsize,
    state: Mutex<ParkState>,
    resumed: Condvar,
    current_task: Mutex<Option<Arc<Task>>>,
    instrument_id: OnceLock<u64>,
}

impl WorkerThread {
    pub(crate) fn new(id: WorkerId, initial_cpu: CpuId) -> Self {
        Self {
            id,
            tid: OnceLock::new(),
            cpu: AtomicUsize::new(initial_cpu),
            cpu_to_be_resumed_on: AtomicUsize::new(NO_CPU),
            state: Mutex::new(ParkState {
                signals: 0,
                shutdown: false,
            }),
            resumed: Condvar::new(),
            current_task: Mutex::new(None),
            instrument_id: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn record_tid(&self) {
        let tid = nix::unistd::gettid();
        self.tid
            .set(tid)
            .expect("worker thread id recorded twice");
    }

    pub(crate) fn set_instrument_id(&self, id: u64) {
        let _ = self.instrument_id.set(id);
    }

    pub(crate) fn instrument_id(&self) -> u64 {
        self.instrument_id.get().copied().unwrap_or(0)
    }

    /// Parks the calling thread until a peer signals it.
    pub(crate) fn suspend(&self) {
        let mut state = self.state.lock();
        while state.signals == 0 {
            self.resumed.wait(&mut state);
        }
        state.signals -= 1;
    }

    /// Resumes this (parked) worker on `target`, rebinding its kernel
    /// affinity first if it last ran somewhere else. Always called by a peer.
    pub(crate) fn resume(&self, registry: &CpuRegistry, target: CpuId) {
        self.cpu_to_be_resumed_on.store(target, Ordering::Release);

        if self.cpu() != target
            && let Some(&tid) = self.tid.get()
        {
            bind_thread(tid, registry.cpu(target).system_id());
        }

        let mut state = self.state.lock();
        state.signals += 1;
        self.resumed.notify_one();
    }

    /// Refreshes the CPU binding after waking up; the thread may have been
    /// migrated while parked.
    pub(crate) fn update_cpu_after_resume(&self, registry: &CpuRegistry) -> CpuId {
        let next = self.cpu_to_be_resumed_on.swap(NO_CPU, Ordering::AcqRel);
        debug_assert_ne!(next, NO_CPU, "worker resumed without a target CPU");

        self.cpu.store(next, Ordering::Release);
        registry.cpu(next).set_bound_worker(self.id);
        set_current_worker(self.id, next);
        next
    }

    pub(crate) fn signal_shutdown(&self) {
        self.state.lock().shutdown = true;
    }

    pub(crate) fn must_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub(crate) fn set_current_task(&self, task: Arc<Task>) {
        *self.current_task.lock() = Some(task);
    }

    pub(crate) fn clear_current_task(&self) {
        *self.current_task.lock() = None;
    }

    pub(crate) fn has_current_task(&self) -> bool {
        self.current_task.lock().is_some()
    }

    pub(crate) fn current_task_is(&self, task: &Arc<Task>) -> bool {
        self.current_task
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, task))
    }
}

/// Binds a kernel thread to one CPU. Any failure here leaves the runtime in
/// an unrecoverable state.
pub(crate) fn bind_thread(tid: Pid, system_cpu: usize) {
    let mut set = CpuSet::new();
    set.set(system_cpu)
        .unwrap_or_else(|e| panic!("CPU {} outside the affinity universe: {}", system_cpu, e));
    sched_setaffinity(tid, &set).unwrap_or_else(|e| {
        panic!(
            "failed to bind thread {} to CPU {}: {}",
            tid, system_cpu, e
        )
    });
}

/// Binds the calling thread; used once at worker startup.
pub(crate) fn bind_current_thread(system_cpu: usize) {
    bind_thread(Pid::from_raw(0), system_cpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(WorkerThread: Send, Sync);

    #[test]
    fn resume_before_park_is_not_lost() {
        let registry = CpuRegistry::probe(Some(1)).unwrap();
        let worker = Arc::new(WorkerThread::new(0, 0));

        // Signal first, park second: suspend must return immediately.
        worker.resume(&registry, 0);

        let w = worker.clone();
        let handle = std::thread::spawn(move || {
            w.suspend();
            w.cpu_to_be_resumed_on.swap(NO_CPU, Ordering::AcqRel)
        });

        let target = handle.join().unwrap();
        assert_eq!(target, 0);
    }

    #[test]
    fn suspend_blocks_until_resumed() {
        let registry = CpuRegistry::probe(Some(1)).unwrap();
        let worker = Arc::new(WorkerThread::new(0, 0));

        let w = worker.clone();
        let handle = std::thread::spawn(move || {
            w.suspend();
        });

        std::thread::sleep(Duration::from_millis(5));
        assert!(!handle.is_finished());

        worker.resume(&registry, 0);
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_flag_is_sticky() {
        let worker = WorkerThread::new(3, 0);
        assert!(!worker.must_shutdown());
        worker.signal_shutdown();
        assert!(worker.must_shutdown());
    }
}
