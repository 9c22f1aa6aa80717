pub(crate) mod leaf;
pub(crate) mod node;

use crate::config::SchedulerConfig;
use crate::hardware::CpuId;
use crate::scheduler::{ReadyTaskHint, SchedulerHost};
use crate::task::Task;
use leaf::LeafScheduler;
use node::NodeScheduler;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hierarchical scheduler: one leaf per CPU under a single interior node.
pub(crate) struct TreeScheduler {
    root: Arc<NodeScheduler>,
    leaves: Vec<Arc<LeafScheduler>>,
    /// Round-robin target for external submissions with no placement hint.
    next_leaf: AtomicUsize,
}

impl TreeScheduler {
    pub(crate) fn new(cfg: &SchedulerConfig, cpu_count: usize) -> Self {
        let root = Arc::new(NodeScheduler::new());
        let leaves: Vec<_> = (0..cpu_count)
            .map(|cpu| Arc::new(LeafScheduler::new(cpu, cfg, root.clone())))
            .collect();
        root.set_children(leaves.clone());

        Self {
            root,
            leaves,
            next_leaf: AtomicUsize::new(0),
        }
    }

    pub(crate) fn add_ready_task(
        &self,
        host: &dyn SchedulerHost,
        task: Arc<Task>,
        submitter: Option<CpuId>,
        hint: ReadyTaskHint,
    ) -> Option<CpuId> {
        let target = match hint {
            ReadyTaskHint::ForCpu(cpu) => cpu,
            _ => submitter.unwrap_or_else(|| {
                self.next_leaf.fetch_add(1, Ordering::Relaxed) % self.leaves.len()
            }),
        };

        let has_compute_place = submitter == Some(target);
        self.leaves[target].add_task(host, task, has_compute_place);

        // Wake-ups happen inside the leaf when a polling slot lands on an
        // idle CPU; there is nothing left for the caller to do.
        None
    }

    pub(crate) fn task_gets_unblocked(
        &self,
        host: &dyn SchedulerHost,
        task: Arc<Task>,
        submitter: Option<CpuId>,
    ) -> Option<CpuId> {
        self.add_ready_task(host, task, submitter, ReadyTaskHint::Unblocked)
    }

    pub(crate) fn get_ready_task(&self, host: &dyn SchedulerHost, cpu: CpuId) -> Option<Arc<Task>> {
        self.leaves[cpu].get_task(host, true)
    }

    pub(crate) fn get_idle_compute_place(
        &self,
        host: &dyn SchedulerHost,
        force: bool,
    ) -> Option<CpuId> {
        let recorded = self
            .leaves
            .iter()
            .find(|leaf| leaf.is_idle() && !leaf.is_disabled())
            .map(|leaf| leaf.cpu());
        recorded.or_else(|| if force { host.registry_first_idle() } else { None })
    }

    pub(crate) fn disable_cpu(&self, host: &dyn SchedulerHost, cpu: CpuId) {
        self.leaves[cpu].disable(host);
    }

    pub(crate) fn enable_cpu(&self, cpu: CpuId) {
        self.leaves[cpu].enable();
    }

    #[cfg(test)]
    pub(crate) fn leaf(&self, cpu: CpuId) -> &Arc<LeafScheduler> {
        &self.leaves[cpu]
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &Arc<NodeScheduler> {
        &self.root
    }
}
