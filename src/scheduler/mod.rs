pub(crate) mod naive;
pub(crate) mod queue;
pub(crate) mod tree;

#[cfg(test)]
pub(crate) mod tests;

use crate::config::{DevicePlaces, SchedulerConfig, SchedulerFlavor};
use crate::hardware::{CpuId, DeviceKind};
use crate::task::Task;
use anyhow::{Result, anyhow};
use naive::NaiveScheduler;
use parking_lot::Mutex;
use std::sync::Arc;
use tree::TreeScheduler;

/// Placement hint attached to a ready-task submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyTaskHint {
    #[default]
    NoHint,
    /// Prefer the given CPU's leaf.
    ForCpu(CpuId),
    /// The task is a successor of the one the submitting worker just
    /// finished; when immediate-successor mode is on it runs next on the
    /// same CPU.
    ImmediateSuccessor,
    /// The task was previously blocked and is runnable again.
    Unblocked,
}

/// What the scheduler needs from its surroundings: the per-CPU idle bits and
/// the ability to wake a parked CPU. Implemented by the runtime; tests
/// substitute a recorder.
pub(crate) trait SchedulerHost: Sync {
    fn wake_cpu(&self, cpu: CpuId);
    fn cpu_becomes_idle(&self, cpu: CpuId);
    fn cpu_unidled(&self, cpu: CpuId);
    fn registry_first_idle(&self) -> Option<CpuId>;
}

/// The two interchangeable scheduler implementations behind one contract.
pub(crate) enum ReadyScheduler {
    Naive(NaiveScheduler),
    Tree(TreeScheduler),
}

impl ReadyScheduler {
    fn new(cfg: &SchedulerConfig, cpu_count: usize) -> Self {
        match cfg.flavor {
            SchedulerFlavor::Naive => ReadyScheduler::Naive(NaiveScheduler::from_config(cfg)),
            SchedulerFlavor::Tree => ReadyScheduler::Tree(TreeScheduler::new(cfg, cpu_count)),
        }
    }

    fn add_ready_task(
        &self,
        host: &dyn SchedulerHost,
        task: Arc<Task>,
        submitter: Option<CpuId>,
        hint: ReadyTaskHint,
    ) -> Option<CpuId> {
        match self {
            ReadyScheduler::Naive(naive) => naive.add_ready_task(task),
            ReadyScheduler::Tree(tree) => tree.add_ready_task(host, task, submitter, hint),
        }
    }

    fn task_gets_unblocked(
        &self,
        host: &dyn SchedulerHost,
        task: Arc<Task>,
        submitter: Option<CpuId>,
    ) -> Option<CpuId> {
        match self {
            ReadyScheduler::Naive(naive) => naive.task_gets_unblocked(task),
            ReadyScheduler::Tree(tree) => tree.task_gets_unblocked(host, task, submitter),
        }
    }

    fn get_ready_task(&self, host: &dyn SchedulerHost, cpu: CpuId) -> Option<Arc<Task>> {
        match self {
            ReadyScheduler::Naive(naive) => naive.get_ready_task(host, cpu),
            ReadyScheduler::Tree(tree) => tree.get_ready_task(host, cpu),
        }
    }

    fn get_idle_compute_place(&self, host: &dyn SchedulerHost, force: bool) -> Option<CpuId> {
        match self {
            ReadyScheduler::Naive(naive) => naive.get_idle_compute_place(host, force),
            ReadyScheduler::Tree(tree) => tree.get_idle_compute_place(host, force),
        }
    }

    fn disable_cpu(&self, host: &dyn SchedulerHost, cpu: CpuId) {
        match self {
            // The naive scheduler has no per-CPU state to drain.
            ReadyScheduler::Naive(_) => {}
            ReadyScheduler::Tree(tree) => tree.disable_cpu(host, cpu),
        }
    }

    fn enable_cpu(&self, cpu: CpuId) {
        match self {
            ReadyScheduler::Naive(_) => {}
            ReadyScheduler::Tree(tree) => tree.enable_cpu(cpu),
        }
    }
}

/// The host scheduler plus one independent instance per configured device
/// class, all behind the same contract.
pub(crate) struct SchedulerSet {
    host_scheduler: ReadyScheduler,
    device_schedulers: Vec<Option<ReadyScheduler>>,
    /// Per-CPU immediate-successor slots, consulted before the scheduler
    /// proper.
    immediate: Vec<Mutex<Option<Arc<Task>>>>,
    immediate_successor_enabled: bool,
}

impl SchedulerSet {
    pub(crate) fn new(
        cfg: &SchedulerConfig,
        cpu_count: usize,
        devices: &DevicePlaces,
    ) -> Result<Self> {
        if devices.opencl > 0 {
            return Err(anyhow!("OpenCL is not supported yet"));
        }
        if devices.fpga > 0 {
            return Err(anyhow!("FPGA is not supported yet"));
        }

        let mut device_schedulers: Vec<Option<ReadyScheduler>> = (0..6).map(|_| None).collect();
        for kind in DeviceKind::SCHEDULED {
            let places = match kind {
                DeviceKind::Cuda => devices.cuda,
                DeviceKind::OpenAcc => devices.openacc,
                _ => 0,
            };
            if places > 0 {
                device_schedulers[kind.index()] = Some(ReadyScheduler::new(cfg, places));
            }
        }

        Ok(Self {
            host_scheduler: ReadyScheduler::new(cfg, cpu_count),
            device_schedulers,
            immediate: (0..cpu_count).map(|_| Mutex::new(None)).collect(),
            immediate_successor_enabled: cfg.immediate_successor,
        })
    }

    pub(crate) fn add_ready_task(
        &self,
        host: &dyn SchedulerHost,
        task: Arc<Task>,
        submitter: Option<CpuId>,
        hint: ReadyTaskHint,
    ) {
        match task.device() {
            DeviceKind::Host | DeviceKind::Cluster => {
                let mut task = Some(task);

                if self.immediate_successor_enabled
                    && hint == ReadyTaskHint::ImmediateSuccessor
                    && let Some(cpu) = submitter
                {
                    let mut slot = self.immediate[cpu].lock();
                    if slot.is_none() {
                        *slot = task.take();
                    }
                }

                if let Some(task) = task
                    && let Some(idle) =
                        self.host_scheduler.add_ready_task(host, task, submitter, hint)
                {
                    host.wake_cpu(idle);
                }
            }
            kind @ (DeviceKind::Cuda | DeviceKind::OpenAcc) => {
                let scheduler = self.device_schedulers[kind.index()]
                    .as_ref()
                    .unwrap_or_else(|| panic!("no scheduler configured for {:?} tasks", kind));
                // Device backends poll their scheduler themselves; idle
                // device places are not CPUs we could wake.
                let _ = scheduler.add_ready_task(host, task, None, hint);
            }
            kind @ (DeviceKind::OpenCl | DeviceKind::Fpga) => {
                panic!("{:?} is not supported yet", kind);
            }
        }
    }

    pub(crate) fn task_gets_unblocked(
        &self,
        host: &dyn SchedulerHost,
        task: Arc<Task>,
        submitter: Option<CpuId>,
    ) {
        if let Some(idle) = self
            .host_scheduler
            .task_gets_unblocked(host, task, submitter)
        {
            host.wake_cpu(idle);
        }
    }

    pub(crate) fn get_ready_task(&self, host: &dyn SchedulerHost, cpu: CpuId) -> Option<Arc<Task>> {
        if self.immediate_successor_enabled
            && let Some(task) = self.immediate[cpu].lock().take()
        {
            return Some(task);
        }

        self.host_scheduler.get_ready_task(host, cpu)
    }

    /// Polling entry point for a device backend driving `place` of the given
    /// device class.
    pub(crate) fn get_ready_device_task(
        &self,
        host: &dyn SchedulerHost,
        kind: DeviceKind,
        place: usize,
    ) -> Option<Arc<Task>> {
        self.device_schedulers[kind.index()]
            .as_ref()
            .and_then(|scheduler| scheduler.get_ready_task(host, place))
    }

    pub(crate) fn get_idle_compute_place(
        &self,
        host: &dyn SchedulerHost,
        force: bool,
    ) -> Option<CpuId> {
        self.host_scheduler.get_idle_compute_place(host, force)
    }

    pub(crate) fn disable_cpu(&self, host: &dyn SchedulerHost, cpu: CpuId) {
        self.host_scheduler.disable_cpu(host, cpu);
    }

    pub(crate) fn enable_cpu(&self, cpu: CpuId) {
        self.host_scheduler.enable_cpu(cpu);
    }
}
