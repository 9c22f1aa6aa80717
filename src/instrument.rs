//! Instrumentation entry points.
//!
//! Every probe defaults to a no-op so the core links without an
//! instrumentation backend.

use crate::hardware::CpuId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyOp {
    ProcessAllDataAccesses,
    UnregisterTaskDataAccesses,
    UnregisterLocallyPropagated,
    HandleExitTaskwait,
    ReleaseTaskwaitFragment,
}

pub trait Instrumentation: Send + Sync {
    /// Handshake performed by every worker on startup; returns the worker's
    /// instrumentation id.
    fn created_thread(&self) -> u64 {
        0
    }

    fn thread_will_suspend(&self, _thread: u64, _cpu: CpuId) {}

    fn thread_has_resumed(&self, _thread: u64, _cpu: CpuId) {}

    fn enter_create_data_copy_step(&self, _is_taskwait: bool) {}

    fn exit_create_data_copy_step(&self, _is_taskwait: bool) {}

    fn enter_setup_taskwait_workflow(&self) {}

    fn exit_setup_taskwait_workflow(&self) {}

    fn enter_add_ready_task(&self) {}

    fn exit_add_ready_task(&self) {}

    fn enter_get_ready_task(&self) {}

    fn exit_get_ready_task(&self) {}

    fn enter_dependency_op(&self, _op: DependencyOp) {}

    fn exit_dependency_op(&self, _op: DependencyOp) {}
}

pub struct NullInstrumentation;

impl Instrumentation for NullInstrumentation {}
