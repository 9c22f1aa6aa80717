//! Contract exported by the dependency-tracking subsystem.
//!
//! The core never decides when a task becomes ready; it only calls into this
//! trait at well-defined points of the execution workflow. The null
//! implementation lets the crate link and run without a dependency backend.

use crate::hardware::{CpuId, MemoryPlace};
use crate::task::Task;
use std::sync::Arc;

/// A contiguous address range covered by a data access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub start: usize,
    pub len: usize,
}

impl Region {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
    Reduction,
    Commutative,
    Concurrent,
}

impl AccessKind {
    /// Accesses for which data copies are not supported; they produce no-op
    /// copy steps (intentional placeholder, not silently correct).
    pub(crate) fn copy_is_noop(self) -> bool {
        matches!(
            self,
            AccessKind::Reduction | AccessKind::Commutative | AccessKind::Concurrent
        )
    }
}

/// One data access of a task, as the workflow engine observes it.
#[derive(Debug, Clone)]
pub struct DataAccess {
    pub kind: AccessKind,
    pub region: Region,
    pub weak: bool,
    /// Current location of the data. `None` means the access is not read
    /// satisfied yet, which is only possible for weak accesses.
    pub location: Option<MemoryPlace>,
    /// Where a taskwait fragment must leave the data, if anywhere.
    pub output_location: Option<MemoryPlace>,
    /// Number of fragments a cluster fetch of this region produces.
    pub fragments: usize,
}

impl DataAccess {
    pub fn new(kind: AccessKind, region: Region) -> Self {
        Self {
            kind,
            region,
            weak: false,
            location: Some(MemoryPlace::Host),
            output_location: None,
            fragments: 1,
        }
    }

    pub fn weak(mut self) -> Self {
        self.weak = true;
        self
    }

    pub fn located_at(mut self, place: MemoryPlace) -> Self {
        self.location = Some(place);
        self
    }

    pub fn unsatisfied(mut self) -> Self {
        self.location = None;
        self
    }

    pub fn output_to(mut self, place: MemoryPlace) -> Self {
        self.output_location = Some(place);
        self
    }

    pub fn fragments(mut self, fragments: usize) -> Self {
        self.fragments = fragments;
        self
    }
}

/// Per-CPU scratch area handed to the dependency subsystem so it can batch
/// work without allocating on every call.
#[derive(Debug, Default)]
pub struct DependencyScratch {
    pub satisfied_tasks: Vec<Arc<Task>>,
    pub deletable_regions: Vec<Region>,
}

impl DependencyScratch {
    pub fn clear(&mut self) {
        self.satisfied_tasks.clear();
        self.deletable_regions.clear();
    }
}

pub trait DependencySubsystem: Send + Sync {
    /// Visits every data access of the task. The visitor returns false to
    /// stop iteration.
    fn process_all_data_accesses(
        &self,
        task: &Arc<Task>,
        visitor: &mut dyn FnMut(&DataAccess) -> bool,
    );

    /// Unregisters all of the task's accesses.
    ///
    /// Hard ordering contract: `finalizer` must run before any satisfiability
    /// propagation this call generates, so that a cluster "task finished"
    /// message is never observed after satisfiability derived from it.
    fn unregister_task_data_accesses(
        &self,
        task: &Arc<Task>,
        cpu: Option<CpuId>,
        scratch: &mut DependencyScratch,
        memory_place: Option<MemoryPlace>,
        from_busy_thread: bool,
        finalizer: Box<dyn FnOnce() + '_>,
    );

    /// Early release of accesses propagated in the local namespace.
    fn unregister_locally_propagated_task_data_accesses(
        &self,
        task: &Arc<Task>,
        cpu: Option<CpuId>,
        scratch: &mut DependencyScratch,
    );

    fn handle_exit_taskwait(
        &self,
        task: &Arc<Task>,
        cpu: Option<CpuId>,
        scratch: &mut DependencyScratch,
    );

    fn release_taskwait_fragment(
        &self,
        task: &Arc<Task>,
        region: Region,
        cpu: Option<CpuId>,
        scratch: &mut DependencyScratch,
        is_wait: bool,
    );
}

/// Backend-free implementation: iterates the accesses stored on the task and
/// honors the finalizer ordering contract by running it synchronously before
/// returning.
pub struct NullDependencies;

impl DependencySubsystem for NullDependencies {
    fn process_all_data_accesses(
        &self,
        task: &Arc<Task>,
        visitor: &mut dyn FnMut(&DataAccess) -> bool,
    ) {
        for access in task.accesses() {
            if !visitor(access) {
                break;
            }
        }
    }

    fn unregister_task_data_accesses(
        &self,
        _task: &Arc<Task>,
        _cpu: Option<CpuId>,
        _scratch: &mut DependencyScratch,
        _memory_place: Option<MemoryPlace>,
        _from_busy_thread: bool,
        finalizer: Box<dyn FnOnce() + '_>,
    ) {
        finalizer();
    }

    fn unregister_locally_propagated_task_data_accesses(
        &self,
        _task: &Arc<Task>,
        _cpu: Option<CpuId>,
        _scratch: &mut DependencyScratch,
    ) {
    }

    fn handle_exit_taskwait(
        &self,
        _task: &Arc<Task>,
        _cpu: Option<CpuId>,
        _scratch: &mut DependencyScratch,
    ) {
    }

    fn release_taskwait_fragment(
        &self,
        _task: &Arc<Task>,
        _region: Region,
        _cpu: Option<CpuId>,
        _scratch: &mut DependencyScratch,
        _is_wait: bool,
    ) {
    }
}
