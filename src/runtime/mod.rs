// Public API
pub mod runtime;
pub use runtime::{Builder, Runtime};

pub(crate) use runtime::RuntimeConfig;


use crate::cluster::ClusterTransport;
use crate::deps::DependencySubsystem;
use crate::hardware::{CpuId, CpuRegistry};
use crate::instrument::Instrumentation;
use crate::scheduler::{ReadyTaskHint, SchedulerHost, SchedulerSet};
use crate::task::Task;
use crate::transfer::TransferCompletion;
use crate::worker::{self, pool::ThreadPool};
use std::sync::Arc;

/// Everything the subsystems share, threaded explicitly instead of living in
/// process-wide statics. Workers, the transfer poller, and workflow
/// continuations all hold an `Arc` to it.
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,
    pub(crate) cpus: CpuRegistry,
    pub(crate) pool: ThreadPool,
    pub(crate) scheduler: SchedulerSet,
    pub(crate) transfers: TransferCompletion,
    pub(crate) deps: Arc<dyn DependencySubsystem>,
    pub(crate) cluster: Arc<dyn ClusterTransport>,
    pub(crate) instrument: Arc<dyn Instrumentation>,
}

impl Shared {
    /// Admits a ready task on behalf of the dependency subsystem (or the
    /// embedding application).
    pub(crate) fn add_ready_task(&self, task: Arc<Task>, hint: ReadyTaskHint) {
        self.instrument.enter_add_ready_task();
        self.scheduler
            .add_ready_task(self, task, worker::current_cpu(), hint);
        self.instrument.exit_add_ready_task();
    }

    pub(crate) fn task_gets_unblocked(&self, task: Arc<Task>) {
        self.scheduler
            .task_gets_unblocked(self, task, worker::current_cpu());
    }

    pub(crate) fn get_ready_task(&self, cpu: CpuId) -> Option<Arc<Task>> {
        self.instrument.enter_get_ready_task();
        let task = self.scheduler.get_ready_task(self, cpu);
        self.instrument.exit_get_ready_task();
        task
    }

    pub(crate) fn get_idle_compute_place(&self, force: bool) -> Option<CpuId> {
        self.scheduler.get_idle_compute_place(self, force)
    }
}

impl SchedulerHost for Shared {
    /// Clears the CPU's idle bit and migrates a parked worker onto it.
    fn wake_cpu(&self, cpu: CpuId) {
        self.cpus.clear_idle(cpu);
        self.pool.resume_on(&self.cpus, cpu);
    }

    fn cpu_becomes_idle(&self, cpu: CpuId) {
        self.cpus.set_idle(cpu);
    }

    fn cpu_unidled(&self, cpu: CpuId) {
        self.cpus.clear_idle(cpu);
    }

    fn registry_first_idle(&self) -> Option<CpuId> {
        self.cpus.first_idle()
    }
}
