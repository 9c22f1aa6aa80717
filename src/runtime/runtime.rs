use crate::cluster::{ClusterTransport, NullCluster};
use crate::config::{
    self, DevicePlaces, SchedulerConfig, SchedulerFlavor, SchedulingPolicy,
};
use crate::deps::{DataAccess, DependencySubsystem, NullDependencies};
use crate::hardware::{CpuId, CpuRegistry};
use crate::instrument::{Instrumentation, NullInstrumentation};
use crate::runtime::Shared;
use crate::scheduler::{ReadyTaskHint, SchedulerSet};
use crate::task::Task;
use crate::transfer::{DataTransfer, TransferCompletion};
use crate::worker::pool::ThreadPool;
use crate::workflow;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Configures and builds a [`Runtime`].
///
/// Every knob has an environment-variable default (see the `NANOS6_*`
/// variables); programmatic settings override the environment.
pub struct Builder {
    flavor: SchedulerFlavor,
    policy: Option<SchedulingPolicy>,
    immediate_successor: Option<bool>,
    priority: Option<bool>,
    polling_iterations: Option<usize>,
    max_cpus: Option<usize>,
    devices: DevicePlaces,
    transfer_poll_interval: Duration,
    deps: Option<Arc<dyn DependencySubsystem>>,
    cluster: Option<Arc<dyn ClusterTransport>>,
    instrument: Option<Arc<dyn Instrumentation>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            flavor: SchedulerFlavor::default(),
            policy: None,
            immediate_successor: None,
            priority: None,
            polling_iterations: None,
            max_cpus: None,
            devices: DevicePlaces::default(),
            transfer_poll_interval: config::DEFAULT_TRANSFER_POLL_INTERVAL,
            deps: None,
            cluster: None,
            instrument: None,
        }
    }

    /// Selects the hierarchical scheduler (the default).
    pub fn tree_scheduler(mut self) -> Self {
        self.flavor = SchedulerFlavor::Tree;
        self
    }

    /// Selects the single-queue reference scheduler.
    pub fn naive_scheduler(mut self) -> Self {
        self.flavor = SchedulerFlavor::Naive;
        self
    }

    pub fn scheduling_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn immediate_successor(mut self, enabled: bool) -> Self {
        self.immediate_successor = Some(enabled);
        self
    }

    pub fn priority(mut self, enabled: bool) -> Self {
        self.priority = Some(enabled);
        self
    }

    /// Leaf busy-wait iterations on the polling slot before a CPU parks.
    pub fn polling_iterations(mut self, iterations: usize) -> Self {
        self.polling_iterations = Some(iterations);
        self
    }

    /// Caps the number of admissible CPUs (the affinity mask is the upper
    /// bound either way).
    pub fn max_cpus(mut self, max: usize) -> Self {
        assert!(max > 0, "max_cpus cannot be 0");
        self.max_cpus = Some(max);
        self
    }

    pub fn device_places(mut self, devices: DevicePlaces) -> Self {
        self.devices = devices;
        self
    }

    pub fn transfer_poll_interval(mut self, interval: Duration) -> Self {
        self.transfer_poll_interval = interval;
        self
    }

    pub fn dependency_subsystem(mut self, deps: Arc<dyn DependencySubsystem>) -> Self {
        self.deps = Some(deps);
        self
    }

    pub fn cluster_transport(mut self, cluster: Arc<dyn ClusterTransport>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn instrumentation(mut self, instrument: Arc<dyn Instrumentation>) -> Self {
        self.instrument = Some(instrument);
        self
    }

    /// Creates the configured `Runtime`: probes the admissible CPUs, builds
    /// the scheduler, launches one bound worker per CPU, and starts the
    /// transfer poller. The returned runtime is ready to accept tasks.
    pub fn try_build(self) -> Result<Runtime> {
        let scheduler_cfg = SchedulerConfig {
            flavor: self.flavor,
            policy: match self.policy {
                Some(policy) => policy,
                None => config::env_policy()?,
            },
            immediate_successor: match self.immediate_successor {
                Some(enabled) => enabled,
                None => config::env_flag(config::IMMEDIATE_SUCCESSOR_VAR, true)?,
            },
            priority: match self.priority {
                Some(enabled) => enabled,
                None => config::env_flag(config::PRIORITY_VAR, true)?,
            },
            polling_iterations: match self.polling_iterations {
                Some(iterations) => iterations,
                None => config::env_usize(
                    config::POLLING_ITER_VAR,
                    config::DEFAULT_POLLING_ITERATIONS,
                )?,
            },
        };

        let cfg = RuntimeConfig {
            scheduler: scheduler_cfg,
            devices: self.devices,
            max_cpus: self.max_cpus,
            transfer_poll_interval: self.transfer_poll_interval,
        };

        let cpus = CpuRegistry::probe(cfg.max_cpus)?;
        let scheduler = SchedulerSet::new(&cfg.scheduler, cpus.total(), &cfg.devices)?;
        let pool = ThreadPool::new(cpus.total());
        let transfers = TransferCompletion::new(cfg.transfer_poll_interval);

        tracing::debug!(
            cpus = cpus.total(),
            flavor = ?cfg.scheduler.flavor,
            policy = ?cfg.scheduler.policy,
            "initializing runtime"
        );

        let shared = Arc::new(Shared {
            cfg,
            cpus,
            pool,
            scheduler,
            transfers,
            deps: self.deps.unwrap_or_else(|| Arc::new(NullDependencies)),
            cluster: self.cluster.unwrap_or_else(|| Arc::new(NullCluster)),
            instrument: self
                .instrument
                .unwrap_or_else(|| Arc::new(NullInstrumentation)),
        });

        shared.pool.initialize(&shared);
        shared.transfers.register();

        Ok(Runtime {
            shared,
            down: AtomicBool::new(false),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) scheduler: SchedulerConfig,
    pub(crate) devices: DevicePlaces,
    pub(crate) max_cpus: Option<usize>,
    pub(crate) transfer_poll_interval: Duration,
}

/// The task-parallel runtime core: owns the CPU registry, the worker pool,
/// the scheduler, the workflow engine's shared context, and the transfer
/// poller, with teardown in reverse order of bring-up.
pub struct Runtime {
    shared: Arc<Shared>,
    down: AtomicBool,
}

impl Runtime {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Submits a task whose dependencies are satisfied.
    pub fn add_ready_task(&self, task: Arc<Task>, hint: ReadyTaskHint) {
        self.shared.add_ready_task(task, hint);
    }

    /// Re-admits a task that was blocked and may run again.
    pub fn task_gets_unblocked(&self, task: Arc<Task>) {
        self.shared.task_gets_unblocked(task);
    }

    pub fn get_idle_compute_place(&self, force: bool) -> Option<CpuId> {
        self.shared.get_idle_compute_place(force)
    }

    /// Administratively removes a CPU: its scheduler leaf drains into the
    /// parent; no task is lost.
    pub fn disable_cpu(&self, cpu: CpuId) {
        self.shared
            .cpus
            .cpu(cpu)
            .set_status(crate::hardware::CpuStatus::Disabled);
        self.shared.scheduler.disable_cpu(&*self.shared, cpu);
    }

    pub fn enable_cpu(&self, cpu: CpuId) {
        self.shared
            .cpus
            .cpu(cpu)
            .set_status(crate::hardware::CpuStatus::Enabled);
        self.shared.scheduler.enable_cpu(cpu);
    }

    /// Ensures a taskwait fragment's data reaches its output location before
    /// the taskwait completes.
    pub fn setup_taskwait_workflow(&self, task: &Arc<Task>, fragment: &DataAccess) {
        workflow::setup_taskwait_workflow(&self.shared, task, fragment);
    }

    /// Hands an in-flight transfer to the completion poller. Transports call
    /// this from their `fetch_vector` implementations.
    pub fn add_pending_data_transfer(&self, transfer: DataTransfer) {
        self.shared.transfers.add_pending(transfer);
    }

    pub fn total_cpus(&self) -> usize {
        self.shared.cpus.total()
    }

    /// Tears everything down in reverse bring-up order: the poller drains
    /// first, then the worker pool runs the shutdown cascade. Idempotent.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(
            flavor = ?self.shared.cfg.scheduler.flavor,
            "shutting down runtime"
        );
        self.shared.transfers.unregister();
        self.shared.pool.shutdown(&self.shared);
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
