//! Per-task execution workflows.
//!
//! Every task the scheduler hands to a worker runs through a small DAG of
//! steps: data copies gate the execution step, which gates the release step,
//! which gates the terminal notification step. Step completion releases
//! successor edges; nothing else advances the DAG.

pub(crate) mod step;

#[cfg(test)]
mod tests;

use crate::cluster::{Continuation, PendingFetch};
use crate::deps::{DataAccess, DependencyScratch, Region};
use crate::hardware::{CpuId, DeviceKind, MemoryPlace};
use crate::instrument::DependencyOp;
use crate::runtime::Shared;
use crate::task::Task;
use crate::worker;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub(crate) use step::StepId;
use step::{ClusterCopy, SingleShot, Step, StepKind};

/// A task's step DAG: a dense arena with index links plus the root set.
/// Frozen once built; only the predecessor counters mutate afterwards.
pub(crate) struct Workflow {
    steps: Vec<Step>,
    roots: Vec<StepId>,
}

impl Workflow {
    /// Releases the root steps. Cluster copies that must fetch data into the
    /// current memory node are grouped by source node and handed to the
    /// transport in one `fetch_vector` call per source, amortizing
    /// round-trips; every other root starts directly.
    pub(crate) fn start(self: &Arc<Self>, rt: &Arc<Shared>) {
        let mut fragments: BTreeMap<MemoryPlace, usize> = BTreeMap::new();
        let mut groups: BTreeMap<MemoryPlace, Vec<PendingFetch>> = BTreeMap::new();

        for &root in &self.roots {
            match &self.steps[root].kind {
                StepKind::ClusterDataCopy(copy)
                    if copy.needs_fetch && copy.target == rt.cluster.current_memory_node() =>
                {
                    let source = copy
                        .source
                        .expect("cluster copy requires a fetch but has no source");

                    *fragments.entry(source).or_default() += copy.fragments;
                    groups.entry(source).or_default().push(PendingFetch {
                        region: copy.region,
                        fragments: copy.fragments,
                        on_complete: self.completion_of(rt, root),
                    });
                }
                _ => self.start_step(rt, root),
            }
        }

        for (source, group) in groups {
            rt.cluster.fetch_vector(fragments[&source], group, source);
        }
    }

    /// Continuation that marks `step` complete; fired by transports and the
    /// transfer poller.
    fn completion_of(self: &Arc<Self>, rt: &Arc<Shared>, step: StepId) -> Continuation {
        let workflow = self.clone();
        let rt = rt.clone();
        Box::new(move || workflow.complete_step(&rt, step))
    }

    /// Performs a step's action. The caller guarantees the predecessor
    /// counter is zero; each step starts exactly once.
    pub(crate) fn start_step(self: &Arc<Self>, rt: &Arc<Shared>, id: StepId) {
        debug_assert!(self.steps[id].ready());

        match &self.steps[id].kind {
            StepKind::Noop => self.complete_step(rt, id),

            StepKind::ClusterDataCopy(copy) => {
                if copy.needs_fetch && copy.target == rt.cluster.current_memory_node() {
                    // Root copies go through the grouped path in `start`;
                    // this covers copies released later.
                    let source = copy
                        .source
                        .expect("cluster copy requires a fetch but has no source");
                    let fetch = PendingFetch {
                        region: copy.region,
                        fragments: copy.fragments,
                        on_complete: self.completion_of(rt, id),
                    };
                    rt.cluster.fetch_vector(copy.fragments, vec![fetch], source);
                } else {
                    // Registration-only copy (or a transfer the remote side
                    // drives): nothing to wait for here.
                    self.complete_step(rt, id);
                }
            }

            StepKind::HostExecution { task } => {
                let task = task.clone();
                // Inline execution is only legal on the worker that owns the
                // task right now. Any other context (transfer poller, another
                // task's callback) re-submits it and a worker restarts the
                // step through `execute_task`.
                let inline_cpu = worker::current_worker().and_then(|(worker_id, cpu)| {
                    rt.pool
                        .worker(worker_id)
                        .current_task_is(&task)
                        .then_some(cpu)
                });

                match inline_cpu {
                    Some(cpu) => {
                        task.set_execution_step(None);
                        task.run(cpu);
                        self.complete_step(rt, id);
                    }
                    None => {
                        task.set_execution_step(Some(id));
                        rt.add_ready_task(task, crate::scheduler::ReadyTaskHint::NoHint);
                    }
                }
            }

            StepKind::ClusterExecution { task } => {
                rt.cluster
                    .submit_remote_task(task, self.completion_of(rt, id));
            }

            StepKind::DataRelease { task, regions }
            | StepKind::ClusterDataRelease { task, regions } => {
                tracing::trace!(
                    task = task.label(),
                    regions = regions.len(),
                    "data release step"
                );
                self.complete_step(rt, id);
            }

            StepKind::Notification { continuation } => {
                continuation.fire();
                self.complete_step(rt, id);
            }
        }
    }

    /// Marks a step complete and releases its successors. Concurrent
    /// completions are safe: each successor's counter reaches zero exactly
    /// once, so no step can be double-started.
    pub(crate) fn complete_step(self: &Arc<Self>, rt: &Arc<Shared>, id: StepId) {
        for &successor in &self.steps[id].successors {
            if self.steps[successor]
                .predecessors
                .fetch_sub(1, Ordering::AcqRel)
                == 1
            {
                self.start_step(rt, successor);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn root_count(&self) -> usize {
        self.roots.len()
    }
}

/// Builds a workflow arena. Single-threaded; the result is frozen into an
/// `Arc<Workflow>`.
pub(crate) struct WorkflowBuilder {
    steps: Vec<Step>,
    roots: Vec<StepId>,
}

impl WorkflowBuilder {
    pub(crate) fn new() -> Self {
        Self {
            steps: Vec::new(),
            roots: Vec::new(),
        }
    }

    fn push(&mut self, kind: StepKind) -> StepId {
        self.steps.push(Step::new(kind));
        self.steps.len() - 1
    }

    pub(crate) fn enforce_order(&mut self, predecessor: StepId, successor: StepId) {
        self.steps[predecessor].successors.push(successor);
        *self.steps[successor].predecessors.get_mut() += 1;
    }

    pub(crate) fn add_root(&mut self, step: StepId) {
        self.roots.push(step);
    }

    pub(crate) fn ready(&self, step: StepId) -> bool {
        self.steps[step].ready()
    }

    pub(crate) fn create_execution_step(&mut self, task: &Arc<Task>, device: DeviceKind) -> StepId {
        match device {
            DeviceKind::Host => self.push(StepKind::HostExecution { task: task.clone() }),
            DeviceKind::Cluster => self.push(StepKind::ClusterExecution { task: task.clone() }),
            other => panic!("execution workflow does not support {:?} devices yet", other),
        }
    }

    pub(crate) fn create_data_release_step(&mut self, task: &Arc<Task>) -> StepId {
        if task.is_remote_task() {
            self.push(StepKind::ClusterDataRelease {
                task: task.clone(),
                regions: Vec::new(),
            })
        } else {
            self.push(StepKind::DataRelease {
                task: task.clone(),
                regions: Vec::new(),
            })
        }
    }

    pub(crate) fn add_release_region(&mut self, release: StepId, region: Region) {
        match &mut self.steps[release].kind {
            StepKind::DataRelease { regions, .. } | StepKind::ClusterDataRelease { regions, .. } => {
                regions.push(region)
            }
            _ => debug_assert!(false, "step {} is not a release step", release),
        }
    }

    pub(crate) fn create_notification_step(&mut self, continuation: Continuation) -> StepId {
        self.push(StepKind::Notification {
            continuation: SingleShot::new(continuation),
        })
    }

    /// Chooses the transfer flavor from the (source, target) pair. Only
    /// host<->cluster and cluster<->cluster transfers move data; a directory
    /// source under cluster mode still produces a cluster copy so the new
    /// location gets registered remotely even though no bytes move.
    pub(crate) fn create_data_copy_step(
        &mut self,
        rt: &Shared,
        source: Option<MemoryPlace>,
        target: MemoryPlace,
        region: Region,
        access: &DataAccess,
        is_taskwait: bool,
    ) -> StepId {
        rt.instrument.enter_create_data_copy_step(is_taskwait);

        let id = if access.kind.copy_is_noop() {
            self.push(StepKind::Noop)
        } else {
            debug_assert!(!target.is_directory());

            let directory_source = source.is_some_and(|place| place.is_directory());
            if directory_source && rt.cluster.in_cluster_mode() {
                self.cluster_copy(source, target, region, access)
            } else {
                // A missing source means the access is not read satisfied
                // yet (only possible for weak accesses): treat it as host and
                // let the eventual satisfiability message drive the copy.
                let source_kind = source.map_or(DeviceKind::Host, MemoryPlace::device_kind);
                match (source_kind, target.device_kind()) {
                    (DeviceKind::Host, DeviceKind::Cluster)
                    | (DeviceKind::Cluster, DeviceKind::Host)
                    | (DeviceKind::Cluster, DeviceKind::Cluster) => {
                        self.cluster_copy(source, target, region, access)
                    }
                    _ => self.push(StepKind::Noop),
                }
            }
        };

        rt.instrument.exit_create_data_copy_step(is_taskwait);
        id
    }

    fn cluster_copy(
        &mut self,
        source: Option<MemoryPlace>,
        target: MemoryPlace,
        region: Region,
        access: &DataAccess,
    ) -> StepId {
        let needs_fetch = match source {
            None => false,
            Some(place) if place.is_directory() => false,
            Some(place) => place != target,
        };

        self.push(StepKind::ClusterDataCopy(ClusterCopy {
            source,
            target,
            region,
            fragments: access.fragments,
            needs_fetch,
        }))
    }

    pub(crate) fn freeze(self) -> Arc<Workflow> {
        Arc::new(Workflow {
            steps: self.steps,
            roots: self.roots,
        })
    }
}

/// Entry point of the workflow engine.
///
/// Three-way entry: restart a released execution step, run the
/// delayed-release tail of a task whose wait clause is over, or build and
/// start a fresh workflow.
pub(crate) fn execute_task(
    rt: &Arc<Shared>,
    task: Arc<Task>,
    cpu: CpuId,
    target_memory_place: MemoryPlace,
) {
    if task.workflow_is_running() {
        match task.execution_step() {
            Some(step) => {
                let workflow = task
                    .workflow()
                    .expect("running task lost its workflow");
                workflow.start_step(rt, step);
            }
            None => {
                debug_assert!(false, "running task re-entered with no pending execution step")
            }
        }
        return;
    }

    if task.is_awaiting_children() {
        delayed_release_tail(rt, &task, cpu, target_memory_place);
        return;
    }

    // The target memory place is what we will use later on, when the task
    // has completed, to update the location of its accesses. Releasing with a
    // different place overrides it.
    task.set_memory_place(target_memory_place);

    let mut builder = WorkflowBuilder::new();

    let execution = builder.create_execution_step(&task, task.device());
    let release = builder.create_data_release_step(&task);
    let notification =
        builder.create_notification_step(notification_continuation(rt, &task, target_memory_place));

    builder.enforce_order(execution, release);
    builder.enforce_order(release, notification);

    rt.instrument
        .enter_dependency_op(DependencyOp::ProcessAllDataAccesses);
    rt.deps.process_all_data_accesses(&task, &mut |access| {
        #[cfg(debug_assertions)]
        check_access_is_known(rt, &task, access);

        let copy = builder.create_data_copy_step(
            rt,
            access.location,
            target_memory_place,
            access.region,
            access,
            false,
        );
        builder.enforce_order(copy, execution);
        builder.add_root(copy);
        builder.add_release_region(release, access.region);
        true
    });
    rt.instrument
        .exit_dependency_op(DependencyOp::ProcessAllDataAccesses);

    if builder.ready(execution) {
        builder.enforce_order(execution, notification);
        builder.add_root(execution);
    }

    let workflow = builder.freeze();
    task.set_workflow(workflow.clone());
    task.set_compute_place(cpu);

    // Starting the workflow either runs the task to completion right here
    // (no pending transfers) or leaves the execution step armed for the last
    // completion to release.
    workflow.start(rt);
}

/// In debug builds, a non-weak access whose data is only known to the
/// directory while a host task runs under cluster mode is a configuration
/// error (the region never came from a managed allocation).
#[cfg(debug_assertions)]
fn check_access_is_known(rt: &Shared, task: &Arc<Task>, access: &DataAccess) {
    if !access.weak
        && rt.cluster.in_cluster_mode()
        && access.location.is_some_and(|place| place.is_directory())
        && task.device() == DeviceKind::Host
    {
        debug_assert!(
            false,
            "non-weak access {:?} of {} is an unknown region",
            access.region,
            task.label()
        );
    }
}

/// The terminal continuation: unregister locally propagated accesses, then
/// either finalize the task or park it until its children finish.
fn notification_continuation(
    rt: &Arc<Shared>,
    task: &Arc<Task>,
    target_memory_place: MemoryPlace,
) -> Continuation {
    let rt = rt.clone();
    let task = task.clone();

    Box::new(move || {
        let cpu = worker::current_cpu();

        with_scratch(&rt, cpu, |scratch| {
            rt.instrument
                .enter_dependency_op(DependencyOp::UnregisterLocallyPropagated);
            rt.deps
                .unregister_locally_propagated_task_data_accesses(&task, cpu, scratch);
            rt.instrument
                .exit_dependency_op(DependencyOp::UnregisterLocallyPropagated);

            if task.mark_as_finished(cpu) {
                unregister_and_finalize(&rt, &task, cpu, Some(target_memory_place), scratch);
                task.clear_workflow();
            } else {
                // A wait clause holds the release; `execute_task` re-enters
                // through the delayed-release tail once the children finish.
                task.park_workflow_until_children_finish();
            }
        });
    })
}

/// Continuation of what `mark_as_finished` started, entered when the wait
/// clause is finally over.
fn delayed_release_tail(
    rt: &Arc<Shared>,
    task: &Arc<Task>,
    cpu: CpuId,
    target_memory_place: MemoryPlace,
) {
    debug_assert!(task.must_delay_release());

    with_scratch(rt, Some(cpu), |scratch| {
        task.complete_delayed_release();
        task.mark_as_unblocked();

        rt.instrument
            .enter_dependency_op(DependencyOp::HandleExitTaskwait);
        rt.deps.handle_exit_taskwait(task, Some(cpu), scratch);
        rt.instrument
            .exit_dependency_op(DependencyOp::HandleExitTaskwait);

        debug_assert!(task.has_finished());
        unregister_and_finalize(rt, task, Some(cpu), Some(target_memory_place), scratch);
    });

    task.clear_workflow();
}

/// Unregisters the task's accesses with the ordered finalizer: the cluster
/// "task finished" message goes out before any satisfiability propagation
/// derived from the unregistration.
fn unregister_and_finalize(
    rt: &Arc<Shared>,
    task: &Arc<Task>,
    cpu: Option<CpuId>,
    memory_place: Option<MemoryPlace>,
    scratch: &mut DependencyScratch,
) {
    rt.instrument
        .enter_dependency_op(DependencyOp::UnregisterTaskDataAccesses);
    rt.deps.unregister_task_data_accesses(
        task,
        cpu,
        scratch,
        memory_place,
        false,
        Box::new(|| {
            task_finished(rt, task);
            if task.mark_as_released() {
                dispose_task(task);
            }
        }),
    );
    rt.instrument
        .exit_dependency_op(DependencyOp::UnregisterTaskDataAccesses);
}

fn task_finished(rt: &Shared, task: &Arc<Task>) {
    if task.is_remote_task() {
        rt.cluster.send_task_finished(task);
    }
    tracing::trace!(task = task.label(), "task finished");
}

fn dispose_task(task: &Arc<Task>) {
    task.mark_as_disposed();
    tracing::trace!(task = task.label(), "task disposed");
}

/// Taskwait fragments with an output location get a minimal copy ->
/// notification workflow; without one, the fragment is released on the spot.
pub(crate) fn setup_taskwait_workflow(rt: &Arc<Shared>, task: &Arc<Task>, fragment: &DataAccess) {
    rt.instrument.enter_setup_taskwait_workflow();

    let cpu = worker::current_cpu();
    let region = fragment.region;

    let Some(target) = fragment.output_location else {
        // No copy needed for this fragment.
        with_scratch(rt, cpu, |scratch| {
            rt.instrument
                .enter_dependency_op(DependencyOp::ReleaseTaskwaitFragment);
            rt.deps
                .release_taskwait_fragment(task, region, cpu, scratch, false);
            rt.instrument
                .exit_dependency_op(DependencyOp::ReleaseTaskwaitFragment);
        });
        rt.instrument.exit_setup_taskwait_workflow();
        return;
    };

    let mut builder = WorkflowBuilder::new();

    let notification = {
        let rt = rt.clone();
        let task = task.clone();
        builder.create_notification_step(Box::new(move || {
            // Always a private scratch area here: the releasing thread may
            // already be inside the dependency system with its CPU's one.
            let releasing_cpu = worker::current_cpu();
            let mut scratch = DependencyScratch::default();

            rt.instrument
                .enter_dependency_op(DependencyOp::ReleaseTaskwaitFragment);
            rt.deps
                .release_taskwait_fragment(&task, region, releasing_cpu, &mut scratch, true);
            rt.instrument
                .exit_dependency_op(DependencyOp::ReleaseTaskwaitFragment);
        }))
    };

    let copy = builder.create_data_copy_step(rt, fragment.location, target, region, fragment, true);
    builder.add_root(copy);
    builder.enforce_order(copy, notification);

    builder.freeze().start(rt);

    rt.instrument.exit_setup_taskwait_workflow();
}

/// Runs `f` with the CPU's dependency scratch area, or a private one when the
/// caller is not a worker.
fn with_scratch<R>(
    rt: &Shared,
    cpu: Option<CpuId>,
    f: impl FnOnce(&mut DependencyScratch) -> R,
) -> R {
    match cpu {
        Some(cpu) => rt.cpus.cpu(cpu).with_scratch(f),
        None => f(&mut DependencyScratch::default()),
    }
}
