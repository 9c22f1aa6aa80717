use crate::hardware::{CpuId, DeviceKind, MemoryPlace};
use crate::workflow::{StepId, Workflow};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// The task was offloaded here by another cluster node.
        const REMOTE = 1;
        /// The task has a wait clause: release is delayed until its children
        /// have completed.
        const WAIT = 1 << 1;
    }
}

pub(crate) type TaskBody = Box<dyn FnOnce(CpuId) + Send>;

/// Lifecycle of a task's workflow.
///
/// `AwaitingChildren` replaces the original design where the workflow pointer
/// was left dangling after a wait clause: the notification step is the only
/// owner transition out of `Running`, and dropping the `Arc` there is the
/// single deletion point.
#[derive(Default)]
pub(crate) enum WorkflowState {
    #[default]
    NotCreated,
    Running(Arc<Workflow>),
    AwaitingChildren,
    Finished,
}

/// A unit of work. The scheduler treats tasks as opaque; every state
/// transition below is owned by the workflow engine and the dependency
/// subsystem.
pub struct Task {
    label: String,
    priority: i64,
    device: DeviceKind,
    flags: TaskFlags,
    accesses: Vec<crate::deps::DataAccess>,

    body: Mutex<Option<TaskBody>>,

    workflow: Mutex<WorkflowState>,
    execution_step: Mutex<Option<StepId>>,
    compute_place: Mutex<Option<CpuId>>,
    memory_place: Mutex<Option<MemoryPlace>>,

    has_finished: AtomicBool,
    blocked: AtomicBool,
    delayed_release_done: AtomicBool,
    disposed: AtomicBool,

    // Two phases gate disposal: finishing (or completing a delayed release)
    // and releasing. Whoever performs the second one disposes the task.
    release_countdown: AtomicU8,
}

impl Task {
    pub fn new(label: impl Into<String>, body: impl FnOnce(CpuId) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            priority: 0,
            device: DeviceKind::Host,
            flags: TaskFlags::empty(),
            accesses: Vec::new(),
            body: Mutex::new(Some(Box::new(body))),
            workflow: Mutex::new(WorkflowState::NotCreated),
            execution_step: Mutex::new(None),
            compute_place: Mutex::new(None),
            memory_place: Mutex::new(None),
            has_finished: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            delayed_release_done: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            release_countdown: AtomicU8::new(2),
        })
    }

    /// Builder-style constructor for tasks with more than a body.
    pub fn build(label: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            label: label.into(),
            priority: 0,
            device: DeviceKind::Host,
            flags: TaskFlags::empty(),
            accesses: Vec::new(),
            body: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn is_remote_task(&self) -> bool {
        self.flags.contains(TaskFlags::REMOTE)
    }

    pub(crate) fn accesses(&self) -> &[crate::deps::DataAccess] {
        &self.accesses
    }

    pub(crate) fn run(&self, cpu: CpuId) {
        let body = self.body.lock().take();
        if let Some(body) = body {
            body(cpu);
        }
    }

    // --- Workflow bookkeeping -------------------------------------------

    pub(crate) fn set_workflow(&self, workflow: Arc<Workflow>) {
        let mut state = self.workflow.lock();
        debug_assert!(matches!(*state, WorkflowState::NotCreated));
        *state = WorkflowState::Running(workflow);
    }

    pub(crate) fn workflow(&self) -> Option<Arc<Workflow>> {
        match &*self.workflow.lock() {
            WorkflowState::Running(wf) => Some(wf.clone()),
            _ => None,
        }
    }

    pub(crate) fn workflow_is_running(&self) -> bool {
        matches!(*self.workflow.lock(), WorkflowState::Running(_))
    }

    pub(crate) fn is_awaiting_children(&self) -> bool {
        matches!(*self.workflow.lock(), WorkflowState::AwaitingChildren)
    }

    /// Running -> AwaitingChildren; drops the workflow reference.
    pub(crate) fn park_workflow_until_children_finish(&self) {
        let mut state = self.workflow.lock();
        debug_assert!(matches!(*state, WorkflowState::Running(_)));
        *state = WorkflowState::AwaitingChildren;
    }

    /// Terminal transition; drops the workflow reference if still held.
    pub(crate) fn clear_workflow(&self) {
        *self.workflow.lock() = WorkflowState::Finished;
    }

    pub(crate) fn set_execution_step(&self, step: Option<StepId>) {
        *self.execution_step.lock() = step;
    }

    pub(crate) fn execution_step(&self) -> Option<StepId> {
        *self.execution_step.lock()
    }

    pub(crate) fn set_compute_place(&self, cpu: CpuId) {
        *self.compute_place.lock() = Some(cpu);
    }

    pub fn compute_place(&self) -> Option<CpuId> {
        *self.compute_place.lock()
    }

    pub(crate) fn set_memory_place(&self, place: MemoryPlace) {
        *self.memory_place.lock() = Some(place);
    }

    pub fn memory_place(&self) -> Option<MemoryPlace> {
        *self.memory_place.lock()
    }

    // --- State transitions ----------------------------------------------

    /// Marks the task's body as executed. Returns false when a wait clause
    /// delays the release; the caller must re-enter through the
    /// delayed-release tail once the children are done.
    pub(crate) fn mark_as_finished(&self, _cpu: Option<CpuId>) -> bool {
        self.has_finished.store(true, Ordering::Release);

        if self.must_delay_release() {
            self.mark_as_blocked();
            false
        } else {
            let prev = self.release_countdown.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0);
            true
        }
    }

    /// Second half of the dispose gate. Returns true exactly once, when both
    /// the finish and release phases are done.
    pub(crate) fn mark_as_released(&self) -> bool {
        self.release_countdown.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn mark_as_blocked(&self) {
        self.blocked.store(true, Ordering::Release);
    }

    pub(crate) fn mark_as_unblocked(&self) {
        self.blocked.store(false, Ordering::Release);
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn has_finished(&self) -> bool {
        self.has_finished.load(Ordering::Acquire)
    }

    pub(crate) fn must_delay_release(&self) -> bool {
        self.flags.contains(TaskFlags::WAIT) && !self.delayed_release_done.load(Ordering::Acquire)
    }

    pub(crate) fn complete_delayed_release(&self) {
        debug_assert!(self.flags.contains(TaskFlags::WAIT));
        let was_done = self.delayed_release_done.swap(true, Ordering::AcqRel);
        debug_assert!(!was_done);
        let prev = self.release_countdown.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub(crate) fn mark_as_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
        // Drop a body that never ran so its captures are not leaked past
        // disposal.
        self.body.lock().take();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("device", &self.device)
            .field("priority", &self.priority)
            .field("finished", &self.has_finished())
            .finish()
    }
}

pub struct TaskBuilder {
    label: String,
    priority: i64,
    device: DeviceKind,
    flags: TaskFlags,
    accesses: Vec<crate::deps::DataAccess>,
    body: Option<TaskBody>,
}

impl TaskBuilder {
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }

    pub fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn access(mut self, access: crate::deps::DataAccess) -> Self {
        self.accesses.push(access);
        self
    }

    pub fn body(mut self, body: impl FnOnce(CpuId) + Send + 'static) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    pub fn finish(self) -> Arc<Task> {
        Arc::new(Task {
            label: self.label,
            priority: self.priority,
            device: self.device,
            flags: self.flags,
            accesses: self.accesses,
            body: Mutex::new(self.body),
            workflow: Mutex::new(WorkflowState::NotCreated),
            execution_step: Mutex::new(None),
            compute_place: Mutex::new(None),
            memory_place: Mutex::new(None),
            has_finished: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            delayed_release_done: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            release_countdown: AtomicU8::new(2),
        })
    }
}
