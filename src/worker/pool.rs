use crate::hardware::{CpuId, CpuRegistry, CpuStatus, NO_WORKER};
use crate::runtime::Shared;
use crate::worker::{self, WorkerId, WorkerThread};
use crate::workflow;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

/// One long-lived worker per admissible CPU, plus the idle queue and the
/// distributed shutdown machinery.
pub(crate) struct ThreadPool {
    workers: Vec<Arc<WorkerThread>>,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
    idle_workers: Mutex<VecDeque<WorkerId>>,

    total_threads: usize,
    shutdown_threads: AtomicIsize,
    must_exit: AtomicBool,
    main_shutdown_controller: AtomicUsize,
}

impl ThreadPool {
    pub(crate) fn new(total_threads: usize) -> Self {
        let workers = (0..total_threads)
            .map(|id| Arc::new(WorkerThread::new(id, id)))
            .collect();

        Self {
            workers,
            handles: Mutex::new((0..total_threads).map(|_| None).collect()),
            idle_workers: Mutex::new(VecDeque::new()),
            total_threads,
            shutdown_threads: AtomicIsize::new(0),
            must_exit: AtomicBool::new(false),
            main_shutdown_controller: AtomicUsize::new(NO_WORKER),
        }
    }

    pub(crate) fn worker(&self, id: WorkerId) -> &Arc<WorkerThread> {
        &self.workers[id]
    }

    pub(crate) fn must_exit(&self) -> bool {
        self.must_exit.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn shutdown_threads(&self) -> isize {
        self.shutdown_threads.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn live_handles(&self) -> usize {
        self.handles.lock().iter().filter(|h| h.is_some()).count()
    }

    /// Launches one worker per admissible CPU, kernel-affinity-bound to it.
    /// Every worker parks right after its startup handshake; the initial
    /// resume below is what lets it enter the scheduling loop.
    pub(crate) fn initialize(&self, rt: &Arc<Shared>) {
        for (cpu_idx, worker) in self.workers.iter().enumerate() {
            let rt_for_thread = rt.clone();
            let worker_for_thread = worker.clone();

            let handle = thread::Builder::new()
                .name(format!("quarry-worker-{}", worker.id()))
                .spawn(move || worker_main(rt_for_thread, worker_for_thread, cpu_idx))
                .expect("failed to spawn worker thread");

            self.handles.lock()[worker.id()] = Some(handle);
            worker.resume(&rt.cpus, cpu_idx);
        }
    }

    pub(crate) fn add_idler(&self, worker: WorkerId) {
        self.idle_workers.lock().push_back(worker);
    }

    pub(crate) fn get_idle_worker(&self) -> Option<WorkerId> {
        self.idle_workers.lock().pop_front()
    }

    #[cfg(test)]
    pub(crate) fn idle_worker_count(&self) -> usize {
        self.idle_workers.lock().len()
    }

    /// Takes an idle worker and resumes it on `cpu`, migrating it if needed.
    /// Returns false only when the runtime is exiting and no worker will
    /// come.
    pub(crate) fn resume_on(&self, registry: &CpuRegistry, cpu: CpuId) -> bool {
        loop {
            if let Some(id) = self.get_idle_worker() {
                self.workers[id].resume(registry, cpu);
                return true;
            }
            if self.must_exit() {
                return false;
            }
            // The CPU was flagged idle but its worker has not finished
            // parking yet.
            thread::yield_now();
        }
    }

    fn take_handle(&self, worker: WorkerId) -> Option<JoinHandle<()>> {
        self.handles.lock()[worker].take()
    }

    /// Drives the shutdown protocol from the orchestrating (non-worker)
    /// thread:
    ///
    /// 1. flag `must_exit` and arm the shutdown counter,
    /// 2. elect one idle worker per accepting CPU as its shutdown
    ///    controller (the first one doubles as the main controller),
    /// 3. controllers drain the idle queue, joining workers as they go,
    /// 4. join the controllers; afterwards `shutdown_threads == 0`.
    pub(crate) fn shutdown(&self, rt: &Shared) {
        self.must_exit.store(true, Ordering::Release);
        self.shutdown_threads
            .store(self.total_threads as isize, Ordering::Release);

        let mut participating: Vec<CpuId> = Vec::new();
        for cpu in rt.cpus.iter() {
            if !cpu.accepts_work() {
                continue;
            }

            // Wait for the CPU to be started.
            while cpu.status() == CpuStatus::Starting {
                thread::yield_now();
            }

            // Workers can be lagging behind (not in the idle queue yet), but
            // we do need at least one. The ones that already started the
            // shutdown may deplete the rest.
            let mut idle = self.get_idle_worker();
            while idle.is_none() && self.shutdown_threads.load(Ordering::Acquire) > 0 {
                thread::yield_now();
                idle = self.get_idle_worker();
            }

            if let Some(controller) = idle {
                cpu.set_shutdown_controller(controller);
                let _ = self.main_shutdown_controller.compare_exchange(
                    NO_WORKER,
                    controller,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );

                let worker = &self.workers[controller];
                worker.signal_shutdown();
                worker.resume(&rt.cpus, cpu.virtual_id());

                // Reverse order: the main controller is joined last, after it
                // has absorbed every straggler.
                participating.insert(0, cpu.virtual_id());
            }
        }

        debug_assert_ne!(
            self.main_shutdown_controller.load(Ordering::Acquire),
            NO_WORKER
        );

        for cpu in participating {
            let controller = rt
                .cpus
                .cpu(cpu)
                .shutdown_controller()
                .expect("participating CPU lost its shutdown controller");
            if let Some(handle) = self.take_handle(controller) {
                handle.join().unwrap_or_else(|_| {
                    panic!("shutdown controller of CPU {} panicked", cpu)
                });
            }
        }

        debug_assert_eq!(self.shutdown_threads.load(Ordering::Acquire), 0);
        tracing::debug!("worker pool drained");
    }

    /// Runs on a worker that received the shutdown signal. Controllers keep
    /// pulling idle workers (from any CPU), migrate them here, resume and
    /// join them. A non-main controller stops when the idle queue runs dry;
    /// the main controller keeps absorbing stragglers until it is the last
    /// worker alive.
    fn thread_shutdown_sequence(&self, rt: &Shared, current: &Arc<WorkerThread>) {
        let cpu = current.cpu();

        if rt.cpus.cpu(cpu).shutdown_controller() == Some(current.id()) {
            let is_main_controller =
                self.main_shutdown_controller.load(Ordering::Acquire) == current.id();

            loop {
                if let Some(next_id) = self.get_idle_worker() {
                    let next = &self.workers[next_id];
                    debug_assert!(!next.has_current_task());

                    next.signal_shutdown();
                    next.resume(&rt.cpus, cpu);

                    let handle = self
                        .take_handle(next_id)
                        .expect("idle worker joined twice during shutdown");
                    handle.join().unwrap_or_else(|_| {
                        panic!(
                            "worker {} panicked while shutting down (joined from {})",
                            next_id,
                            current.id()
                        )
                    });
                } else if !is_main_controller {
                    // Let the main controller handle any worker that did not
                    // enter the idle queue yet.
                    break;
                } else if self.shutdown_threads.load(Ordering::Acquire) == 1 {
                    // Main controller, and also the last worker alive.
                    break;
                } else {
                    thread::yield_now();
                }
            }
        }

        self.shutdown_threads.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Body of every worker thread: bind, handshake, park; then run tasks until
/// the shutdown signal arrives.
fn worker_main(rt: Arc<Shared>, worker: Arc<WorkerThread>, initial_cpu: CpuId) {
    worker::bind_current_thread(rt.cpus.cpu(initial_cpu).system_id());
    worker.record_tid();
    worker::set_current_worker(worker.id(), initial_cpu);
    rt.cpus.cpu(initial_cpu).set_bound_worker(worker.id());

    worker.set_instrument_id(rt.instrument.created_thread());
    let instrument_id = worker.instrument_id();
    rt.cpus.cpu(initial_cpu).set_status(CpuStatus::Enabled);

    // The thread suspends itself after initialization; the activator is the
    // one to unblock it.
    worker.suspend();
    let mut cpu = worker.update_cpu_after_resume(&rt.cpus);
    rt.instrument.thread_has_resumed(instrument_id, cpu);

    loop {
        if worker.must_shutdown() {
            rt.pool.thread_shutdown_sequence(&rt, &worker);
            return;
        }

        match rt.get_ready_task(cpu) {
            Some(task) => {
                worker.set_current_task(task.clone());
                workflow::execute_task(&rt, task, cpu, rt.cluster.current_memory_node());
                worker.clear_current_task();
            }
            None => {
                rt.pool.add_idler(worker.id());
                rt.instrument.thread_will_suspend(instrument_id, cpu);
                worker.suspend();
                cpu = worker.update_cpu_after_resume(&rt.cpus);
                rt.instrument.thread_has_resumed(instrument_id, cpu);
            }
        }
    }
}
