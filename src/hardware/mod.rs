use crate::deps::DependencyScratch;
use crate::worker::WorkerId;
use anyhow::{Context, Result, anyhow};
use nix::sched::{CpuSet, sched_getaffinity};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Dense, 0-based identifier of an admissible CPU.
pub type CpuId = usize;

pub(crate) const NO_WORKER: usize = usize::MAX;

/// Device classes the runtime knows about. Only `Host` and `Cluster` can
/// execute tasks today; the remaining slots are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Host,
    Cuda,
    OpenAcc,
    OpenCl,
    Fpga,
    Cluster,
}

impl DeviceKind {
    pub(crate) const SCHEDULED: [DeviceKind; 2] = [DeviceKind::Cuda, DeviceKind::OpenAcc];

    pub(crate) fn index(self) -> usize {
        match self {
            DeviceKind::Host => 0,
            DeviceKind::Cuda => 1,
            DeviceKind::OpenAcc => 2,
            DeviceKind::OpenCl => 3,
            DeviceKind::Fpga => 4,
            DeviceKind::Cluster => 5,
        }
    }
}

/// A memory locality where data may reside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryPlace {
    Host,
    Device(u8),
    ClusterNode(usize),
    /// Pseudo-place meaning "tracked by the directory, not materialized
    /// anywhere yet".
    Directory,
}

impl MemoryPlace {
    pub(crate) fn is_directory(self) -> bool {
        matches!(self, MemoryPlace::Directory)
    }

    pub(crate) fn device_kind(self) -> DeviceKind {
        match self {
            MemoryPlace::Host | MemoryPlace::Directory => DeviceKind::Host,
            MemoryPlace::Device(_) => DeviceKind::Cuda,
            MemoryPlace::ClusterNode(_) => DeviceKind::Cluster,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CpuStatus {
    Starting = 0,
    Enabled = 1,
    Disabled = 2,
}

/// An admissible logical processor.
///
/// Cross references to workers are ids, never owning pointers: the pool owns
/// every worker, a CPU only remembers which one is currently bound to it.
pub struct Cpu {
    system_id: usize,
    virtual_id: CpuId,
    status: AtomicU8,
    bound_worker: AtomicUsize,
    shutdown_controller: Mutex<Option<WorkerId>>,
    scratch: Mutex<DependencyScratch>,
}

impl Cpu {
    fn new(system_id: usize, virtual_id: CpuId) -> Self {
        Self {
            system_id,
            virtual_id,
            status: AtomicU8::new(CpuStatus::Starting as u8),
            bound_worker: AtomicUsize::new(NO_WORKER),
            shutdown_controller: Mutex::new(None),
            scratch: Mutex::new(DependencyScratch::default()),
        }
    }

    pub fn system_id(&self) -> usize {
        self.system_id
    }

    pub fn virtual_id(&self) -> CpuId {
        self.virtual_id
    }

    pub(crate) fn status(&self) -> CpuStatus {
        match self.status.load(Ordering::Acquire) {
            0 => CpuStatus::Starting,
            1 => CpuStatus::Enabled,
            _ => CpuStatus::Disabled,
        }
    }

    pub(crate) fn set_status(&self, status: CpuStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Whether the shutdown orchestrator should elect a controller for this
    /// CPU. Disabled CPUs already drained their scheduler state.
    pub(crate) fn accepts_work(&self) -> bool {
        self.status() != CpuStatus::Disabled
    }

    pub(crate) fn set_bound_worker(&self, worker: WorkerId) {
        self.bound_worker.store(worker, Ordering::Release);
    }

    pub(crate) fn bound_worker(&self) -> Option<WorkerId> {
        match self.bound_worker.load(Ordering::Acquire) {
            NO_WORKER => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_shutdown_controller(&self, worker: WorkerId) {
        let mut controller = self.shutdown_controller.lock();
        debug_assert!(controller.is_none());
        *controller = Some(worker);
    }

    pub(crate) fn shutdown_controller(&self) -> Option<WorkerId> {
        *self.shutdown_controller.lock()
    }

    pub(crate) fn with_scratch<R>(&self, f: impl FnOnce(&mut DependencyScratch) -> R) -> R {
        f(&mut self.scratch.lock())
    }
}

#[derive(Debug)]
struct IdleSet {
    bits: Vec<bool>,
    count: usize,
}

/// The set of admissible CPUs, derived from the process affinity mask, plus
/// the per-CPU idle bits.
pub struct CpuRegistry {
    cpus: Vec<Cpu>,
    idle: Mutex<IdleSet>,
}

impl CpuRegistry {
    /// Reads the calling process's affinity mask and registers one `Cpu` per
    /// admissible system CPU, assigning dense virtual ids. All CPUs start
    /// non-idle.
    pub(crate) fn probe(max_cpus: Option<usize>) -> Result<Self> {
        let mask = sched_getaffinity(Pid::from_raw(0))
            .context("retrieving the affinity of the current process")?;

        let mut cpus = Vec::new();
        for system_id in 0..CpuSet::count() {
            if mask.is_set(system_id).unwrap_or(false) {
                let virtual_id = cpus.len();
                cpus.push(Cpu::new(system_id, virtual_id));
                if max_cpus.is_some_and(|cap| cpus.len() >= cap) {
                    break;
                }
            }
        }

        if cpus.is_empty() {
            return Err(anyhow!("process affinity mask contains no CPUs"));
        }

        let idle = IdleSet {
            bits: vec![false; cpus.len()],
            count: 0,
        };

        Ok(Self {
            cpus,
            idle: Mutex::new(idle),
        })
    }

    pub fn total(&self) -> usize {
        self.cpus.len()
    }

    pub(crate) fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter()
    }

    pub(crate) fn set_idle(&self, cpu: CpuId) {
        let mut idle = self.idle.lock();
        if !idle.bits[cpu] {
            idle.bits[cpu] = true;
            idle.count += 1;
        }
    }

    pub(crate) fn clear_idle(&self, cpu: CpuId) {
        let mut idle = self.idle.lock();
        if idle.bits[cpu] {
            idle.bits[cpu] = false;
            idle.count -= 1;
        }
    }

    pub(crate) fn is_idle(&self, cpu: CpuId) -> bool {
        self.idle.lock().bits[cpu]
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().count
    }

    pub(crate) fn first_idle(&self) -> Option<CpuId> {
        let idle = self.idle.lock();
        idle.bits.iter().position(|&b| b)
    }
}
