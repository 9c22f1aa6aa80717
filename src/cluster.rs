//! Contract exported by the cluster-message transport.

use crate::deps::Region;
use crate::hardware::MemoryPlace;
use crate::task::Task;
use std::sync::Arc;

/// Single-shot callback fired when an asynchronous operation completes.
pub type Continuation = Box<dyn FnOnce() + Send>;

/// One pending data fetch inside a batched `fetch_vector` call.
pub struct PendingFetch {
    pub region: Region,
    pub fragments: usize,
    pub on_complete: Continuation,
}

impl std::fmt::Debug for PendingFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingFetch")
            .field("region", &self.region)
            .field("fragments", &self.fragments)
            .finish()
    }
}

pub trait ClusterTransport: Send + Sync {
    /// The memory node this process runs on.
    fn current_memory_node(&self) -> MemoryPlace;

    fn in_cluster_mode(&self) -> bool;

    /// Batched fetch entry point: all fetches in `group` originate from the
    /// same `source` node and total `fragment_count` fragments, so the
    /// transport can amortize round-trips. Each fetch's `on_complete` fires
    /// when its data has arrived.
    fn fetch_vector(&self, fragment_count: usize, group: Vec<PendingFetch>, source: MemoryPlace);

    /// Offloads a task to its remote compute place. `on_finished` fires when
    /// the remote side reports completion.
    fn submit_remote_task(&self, task: &Arc<Task>, on_finished: Continuation);

    /// Notifies the offloader node that a remote task has finished. Must be
    /// sent before any satisfiability messages derived from the task's
    /// accesses.
    fn send_task_finished(&self, task: &Arc<Task>);
}

/// Single-node transport: never in cluster mode, data is always local, so
/// fetches complete immediately.
pub struct NullCluster;

impl ClusterTransport for NullCluster {
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

    fn submit_remote_task(&self, task: &Arc<Task>, _on_finished: Continuation) {
        debug_assert!(
            false,
            "task {:?} offloaded without a cluster transport",
            task.label()
        );
    }

    fn send_task_finished(&self, _task: &Arc<Task>) {}
}
