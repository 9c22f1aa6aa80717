use super::*;
use crate::cluster::{ClusterTransport, PendingFetch};
use crate::deps::{AccessKind, DataAccess, DependencySubsystem, NullDependencies, Region};
use crate::runtime::{Builder, Runtime};
use crate::task::TaskFlags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

fn test_runtime(cpus: usize) -> Builder {
    Runtime::builder()
        .max_cpus(cpus)
        .scheduling_policy(crate::config::SchedulingPolicy::Fifo)
        .immediate_successor(true)
        .priority(false)
        .polling_iterations(256)
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::yield_now();
    }
    cond()
}

/// Transport stub that records `fetch_vector` calls and lets the test fire
/// each fetch's completion by hand.
#[derive(Default)]
struct MockCluster {
    calls: Mutex<Vec<(MemoryPlace, usize, Vec<PendingFetch>)>>,
}

impl MockCluster {
    fn take_calls(&self) -> Vec<(MemoryPlace, usize, Vec<PendingFetch>)> {
        std::mem::take(&mut self.calls.lock())
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl ClusterTransport for MockCluster {
    fn current_memory_node(&self) -> MemoryPlace {
        MemoryPlace::ClusterNode(0)
    }

    fn in_cluster_mode(&self) -> bool {
        true
    }

    fn fetch_vector(&self, fragment_count: usize, group: Vec<PendingFetch>, source: MemoryPlace) {
        self.calls.lock().push((source, fragment_count, group));
    }

    fn submit_remote_task(&self, _task: &Arc<Task>, on_finished: crate::cluster::Continuation) {
        on_finished();
    }

    fn send_task_finished(&self, _task: &Arc<Task>) {}
}

/// Dependency stub that journals every call, including where the ordered
/// finalizer ran relative to satisfiability propagation.
struct JournalingDeps {
    log: Arc<Mutex<Vec<String>>>,
}

impl JournalingDeps {
    fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Self { log: log.clone() }, log)
    }
}

impl DependencySubsystem for JournalingDeps {
    fn process_all_data_accesses(
        &self,
        task: &Arc<Task>,
        visitor: &mut dyn FnMut(&DataAccess) -> bool,
    ) {
        NullDependencies.process_all_data_accesses(task, visitor);
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
        self.log.lock().push("unregister:begin".into());
        finalizer();
        // Anything after the finalizer models satisfiability propagation.
        self.log.lock().push("unregister:propagate".into());
    }

    fn unregister_locally_propagated_task_data_accesses(
        &self,
        _task: &Arc<Task>,
        _cpu: Option<CpuId>,
        _scratch: &mut DependencyScratch,
    ) {
        self.log.lock().push("unregister-locally-propagated".into());
    }

    fn handle_exit_taskwait(
        &self,
        _task: &Arc<Task>,
        _cpu: Option<CpuId>,
        _scratch: &mut DependencyScratch,
    ) {
        self.log.lock().push("handle-exit-taskwait".into());
    }

    fn release_taskwait_fragment(
        &self,
        _task: &Arc<Task>,
        _region: Region,
        _cpu: Option<CpuId>,
        _scratch: &mut DependencyScratch,
        is_wait: bool,
    ) {
        self.log
            .lock()
            .push(format!("release-taskwait-fragment:{}", is_wait));
    }
}

/// Transport stub that journals the "task finished" message into the same
/// log as `JournalingDeps`, to check the cluster finalization ordering.
struct JournalingCluster {
    log: Arc<Mutex<Vec<String>>>,
}

impl ClusterTransport for JournalingCluster {
    fn current_memory_node(&self) -> MemoryPlace {
        MemoryPlace::Host
    }

    fn in_cluster_mode(&self) -> bool {
        false
    }

    fn fetch_vector(&self, _fragment_count: usize, group: Vec<PendingFetch>, _source: MemoryPlace) {
        for fetch in group {
            (fetch.on_complete)();
        }
    }

    fn submit_remote_task(&self, _task: &Arc<Task>, on_finished: crate::cluster::Continuation) {
        on_finished();
    }

    fn send_task_finished(&self, _task: &Arc<Task>) {
        self.log.lock().push("task-finished-msg".into());
    }
}

#[test]
fn task_without_accesses_runs_to_completion() {
    let rt = test_runtime(1).try_build().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let task = Task::new("plain", move |_| flag.store(true, AtomicOrdering::Release));

    rt.add_ready_task(task.clone(), crate::scheduler::ReadyTaskHint::NoHint);

    assert!(wait_until(Duration::from_secs(5), || task.is_disposed()));
    assert!(ran.load(AtomicOrdering::Acquire));
    assert!(task.has_finished());
    rt.shutdown();
}

#[test]
fn data_copy_roots_are_grouped_by_source_node() {
    // Three copy roots from nodes {1, 1, 2}: exactly one fetch_vector call
    // per source, and the execution step stays gated until all three
    // completions have released it.
    let cluster = Arc::new(MockCluster::default());
    let rt = test_runtime(1)
        .cluster_transport(cluster.clone())
        .try_build()
        .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let node1 = MemoryPlace::ClusterNode(1);
    let node2 = MemoryPlace::ClusterNode(2);

    let task = Task::build("fetching")
        .access(
            DataAccess::new(AccessKind::Read, Region::new(0x1000, 64))
                .located_at(node1)
                .fragments(1),
        )
        .access(
            DataAccess::new(AccessKind::Read, Region::new(0x2000, 64))
                .located_at(node1)
                .fragments(1),
        )
        .access(
            DataAccess::new(AccessKind::ReadWrite, Region::new(0x3000, 64))
                .located_at(node2)
                .fragments(1),
        )
        .body(move |_| flag.store(true, AtomicOrdering::Release))
        .finish();

    rt.add_ready_task(task.clone(), crate::scheduler::ReadyTaskHint::NoHint);

    // The worker builds the workflow and issues the grouped fetches.
    assert!(wait_until(Duration::from_secs(5), || cluster.call_count() == 2));
    let mut calls = cluster.take_calls();
    calls.sort_by_key(|(source, _, _)| *source);

    assert_eq!(calls[0].0, node1);
    assert_eq!(calls[0].1, 2); // total fragments from node 1
    assert_eq!(calls[0].2.len(), 2);
    assert_eq!(calls[1].0, node2);
    assert_eq!(calls[1].1, 1);
    assert_eq!(calls[1].2.len(), 1);

    // Not a byte has executed yet.
    assert!(!ran.load(AtomicOrdering::Acquire));

    // Completing two of three transfers is not enough.
    let (_, _, mut group1) = calls.remove(0);
    for fetch in group1.drain(..) {
        (fetch.on_complete)();
    }
    std::thread::sleep(Duration::from_millis(10));
    assert!(!ran.load(AtomicOrdering::Acquire));

    // The last completion releases the execution step.
    let (_, _, mut group2) = calls.remove(0);
    for fetch in group2.drain(..) {
        (fetch.on_complete)();
    }

    assert!(wait_until(Duration::from_secs(5), || task.is_disposed()));
    assert!(ran.load(AtomicOrdering::Acquire));
    rt.shutdown();
}

#[test]
fn wait_clause_defers_release_until_reentry() {
    // Scenario: the notification step runs but mark_as_finished returns
    // false (wait clause). A later re-entry through the scheduler runs the
    // delayed-release tail and disposes the task.
    let (deps, log) = JournalingDeps::new();
    let rt = test_runtime(1)
        .dependency_subsystem(Arc::new(deps))
        .try_build()
        .unwrap();

    let task = Task::build("with-wait")
        .flags(TaskFlags::WAIT)
        .body(|_| {})
        .finish();

    rt.add_ready_task(task.clone(), crate::scheduler::ReadyTaskHint::NoHint);

    assert!(wait_until(Duration::from_secs(5), || task.has_finished()));
    // Parked until the children are done: finished but neither released nor
    // disposed, and the workflow is gone.
    assert!(wait_until(Duration::from_secs(5), || task.is_awaiting_children()));
    assert!(!task.is_disposed());
    assert!(task.execution_step().is_none());

    // The dependency subsystem re-admits the task once its children finish.
    rt.add_ready_task(task.clone(), crate::scheduler::ReadyTaskHint::Unblocked);

    assert!(wait_until(Duration::from_secs(5), || task.is_disposed()));

    let log = log.lock();
    let position = |name: &str| {
        log.iter()
            .position(|entry| entry == name)
            .unwrap_or_else(|| panic!("{} missing from {:?}", name, *log))
    };
    // The tail runs in order: exit-taskwait, then the unregistration whose
    // finalizer precedes satisfiability propagation.
    assert!(position("handle-exit-taskwait") < position("unregister:begin"));
    assert!(position("unregister:begin") < position("unregister:propagate"));
    rt.shutdown();
}

#[test]
fn remote_task_finished_message_precedes_satisfiability() {
    let (deps, log) = JournalingDeps::new();
    let cluster = JournalingCluster { log: log.clone() };
    let rt = test_runtime(1)
        .dependency_subsystem(Arc::new(deps))
        .cluster_transport(Arc::new(cluster))
        .try_build()
        .unwrap();

    let task = Task::build("offloaded-here")
        .flags(TaskFlags::REMOTE)
        .body(|_| {})
        .finish();

    rt.add_ready_task(task.clone(), crate::scheduler::ReadyTaskHint::NoHint);
    assert!(wait_until(Duration::from_secs(5), || task.is_disposed()));

    let log = log.lock();
    let msg = log.iter().position(|e| e == "task-finished-msg").unwrap();
    let propagate = log.iter().position(|e| e == "unregister:propagate").unwrap();
    assert!(
        msg < propagate,
        "task-finished message sent after satisfiability: {:?}",
        *log
    );
    rt.shutdown();
}

#[test]
fn taskwait_fragment_without_output_location_releases_immediately() {
    let (deps, log) = JournalingDeps::new();
    let rt = test_runtime(1)
        .dependency_subsystem(Arc::new(deps))
        .try_build()
        .unwrap();

    let task = Task::new("waiter", |_| {});
    let fragment = DataAccess::new(AccessKind::ReadWrite, Region::new(0x4000, 128));

    rt.setup_taskwait_workflow(&task, &fragment);

    assert_eq!(
        log.lock().as_slice(),
        ["release-taskwait-fragment:false"],
        "fragment with no output location must be released on the spot"
    );
    rt.shutdown();
}

#[test]
fn taskwait_fragment_with_output_location_runs_a_copy_workflow() {
    let (deps, log) = JournalingDeps::new();
    let rt = test_runtime(1)
        .dependency_subsystem(Arc::new(deps))
        .try_build()
        .unwrap();

    let task = Task::new("waiter", |_| {});
    // Host -> host: the copy step is a null copy, so the notification runs
    // synchronously and releases the fragment with the wait flag.
    let fragment = DataAccess::new(AccessKind::ReadWrite, Region::new(0x5000, 128))
        .output_to(MemoryPlace::Host);

    rt.setup_taskwait_workflow(&task, &fragment);

    assert_eq!(log.lock().as_slice(), ["release-taskwait-fragment:true"]);
    rt.shutdown();
}

#[test]
fn noop_copy_for_unsupported_access_kinds() {
    // Reduction accesses produce placeholder copy steps: the task runs
    // without any fetch even though its data is nominally remote.
    let cluster = Arc::new(MockCluster::default());
    let rt = test_runtime(1)
        .cluster_transport(cluster.clone())
        .try_build()
        .unwrap();

    let task = Task::build("reduction")
        .access(
            DataAccess::new(AccessKind::Reduction, Region::new(0x6000, 8))
                .located_at(MemoryPlace::ClusterNode(3)),
        )
        .body(|_| {})
        .finish();

    rt.add_ready_task(task.clone(), crate::scheduler::ReadyTaskHint::NoHint);

    assert!(wait_until(Duration::from_secs(5), || task.is_disposed()));
    assert_eq!(cluster.call_count(), 0);
    rt.shutdown();
}

#[test]
fn concurrent_completions_start_the_successor_exactly_once() {
    let rt = test_runtime(1).try_build().unwrap();
    let shared = rt.shared().clone();

    for _ in 0..200 {
        let fired = Arc::new(AtomicUsize::new(0));

        let mut builder = WorkflowBuilder::new();
        let left = builder.create_data_copy_step(
            &shared,
            Some(MemoryPlace::Host),
            MemoryPlace::Host,
            Region::new(0, 8),
            &DataAccess::new(AccessKind::Read, Region::new(0, 8)),
            false,
        );
        let right = builder.create_data_copy_step(
            &shared,
            Some(MemoryPlace::Host),
            MemoryPlace::Host,
            Region::new(8, 8),
            &DataAccess::new(AccessKind::Read, Region::new(8, 8)),
            false,
        );
        let counter = fired.clone();
        let notification = builder.create_notification_step(Box::new(move || {
            counter.fetch_add(1, AtomicOrdering::AcqRel);
        }));
        builder.enforce_order(left, notification);
        builder.enforce_order(right, notification);
        let workflow = builder.freeze();

        let (wf1, rt1) = (workflow.clone(), shared.clone());
        let (wf2, rt2) = (workflow.clone(), shared.clone());
        let t1 = std::thread::spawn(move || wf1.start_step(&rt1, left));
        let t2 = std::thread::spawn(move || wf2.start_step(&rt2, right));
        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(fired.load(AtomicOrdering::Acquire), 1);
    }
    rt.shutdown();
}

#[test]
fn execution_with_pending_copies_is_not_a_root() {
    // A workflow with n copy roots reports exactly n roots; the execution
    // step joins the root set only when it is ready at build time.
    let cluster = Arc::new(MockCluster::default());
    let rt = test_runtime(1)
        .cluster_transport(cluster.clone())
        .try_build()
        .unwrap();

    let task = Task::build("gated")
        .access(
            DataAccess::new(AccessKind::Read, Region::new(0x7000, 32))
                .located_at(MemoryPlace::ClusterNode(1)),
        )
        .body(|_| {})
        .finish();

    rt.add_ready_task(task.clone(), crate::scheduler::ReadyTaskHint::NoHint);
    assert!(wait_until(Duration::from_secs(5), || cluster.call_count() == 1));

    let workflow = task.workflow().expect("workflow should be running");
    assert_eq!(workflow.root_count(), 1);
    drop(workflow);

    for (_, _, group) in cluster.take_calls() {
        for fetch in group {
            (fetch.on_complete)();
        }
    }
    assert!(wait_until(Duration::from_secs(5), || task.is_disposed()));
    rt.shutdown();
}
