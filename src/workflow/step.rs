use crate::cluster::Continuation;
use crate::deps::Region;
use crate::hardware::MemoryPlace;
use crate::task::Task;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

/// Index of a step inside its workflow's arena.
pub(crate) type StepId = usize;

/// A single-shot callback cell: consumed on the first fire.
pub(crate) struct SingleShot(Mutex<Option<Continuation>>);

impl SingleShot {
    pub(crate) fn new(continuation: Continuation) -> Self {
        Self(Mutex::new(Some(continuation)))
    }

    pub(crate) fn fire(&self) {
        let continuation = self.0.lock().take();
        debug_assert!(continuation.is_some(), "notification step fired twice");
        if let Some(continuation) = continuation {
            continuation();
        }
    }
}

/// Payload of a cluster data-copy step.
pub(crate) struct ClusterCopy {
    pub(crate) source: Option<MemoryPlace>,
    pub(crate) target: MemoryPlace,
    pub(crate) region: Region,
    pub(crate) fragments: usize,
    /// Whether bytes actually have to move to the target node. Directory
    /// sources and unsatisfied weak accesses only need remote registration.
    pub(crate) needs_fetch: bool,
}

/// The step variants form a closed sum; `start()` dispatches on the tag.
pub(crate) enum StepKind {
    /// Placeholder for copies that carry no work (same-place transfers,
    /// reduction/commutative/concurrent accesses).
    Noop,
    ClusterDataCopy(ClusterCopy),
    HostExecution { task: Arc<Task> },
    ClusterExecution { task: Arc<Task> },
    DataRelease { task: Arc<Task>, regions: Vec<Region> },
    ClusterDataRelease { task: Arc<Task>, regions: Vec<Region> },
    Notification { continuation: SingleShot },
}

/// DAG node: an atomic count of unresolved predecessors and a successor list
/// frozen at construction. `start()` fires exactly once, when the counter
/// reaches zero.
pub(crate) struct Step {
    pub(crate) kind: StepKind,
    pub(crate) predecessors: AtomicUsize,
    pub(crate) successors: Vec<StepId>,
}

impl Step {
    pub(crate) fn new(kind: StepKind) -> Self {
        Self {
            kind,
            predecessors: AtomicUsize::new(0),
            successors: Vec::new(),
        }
    }

    pub(crate) fn ready(&self) -> bool {
        self.predecessors.load(std::sync::atomic::Ordering::Acquire) == 0
    }
}
