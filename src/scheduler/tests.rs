use super::*;
use crate::config::{SchedulerConfig, SchedulerFlavor, SchedulingPolicy};
use crate::scheduler::queue::TaskBatch;
use crate::scheduler::tree::TreeScheduler;
use crate::task::Task;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::collections::BTreeSet;

assert_impl_all!(SchedulerSet: Send, Sync);

/// Test stand-in for the runtime: records wake-ups and idle transitions.
#[derive(Default)]
pub(crate) struct RecordingHost {
    pub(crate) woken: Mutex<Vec<CpuId>>,
    pub(crate) idle: Mutex<BTreeSet<CpuId>>,
}

impl SchedulerHost for RecordingHost {
    fn wake_cpu(&self, cpu: CpuId) {
        self.woken.lock().push(cpu);
        self.idle.lock().remove(&cpu);
    }

    fn cpu_becomes_idle(&self, cpu: CpuId) {
        self.idle.lock().insert(cpu);
    }

    fn cpu_unidled(&self, cpu: CpuId) {
        self.idle.lock().remove(&cpu);
    }

    fn registry_first_idle(&self) -> Option<CpuId> {
        self.idle.lock().iter().next().copied()
    }
}

fn test_config(policy: SchedulingPolicy) -> SchedulerConfig {
    SchedulerConfig {
        flavor: SchedulerFlavor::Tree,
        policy,
        immediate_successor: true,
        priority: false,
        // Keep busy-wait loops short in tests.
        polling_iterations: 16,
    }
}

fn named_task(name: &str) -> std::sync::Arc<Task> {
    Task::new(name.to_string(), |_| {})
}

#[test]
fn overflow_moves_excess_to_the_parent() {
    // Leaf 0 with queue_threshold = 4, ten submissions from its own CPU:
    // afterwards the leaf holds at most 4 tasks and the parent at least 5,
    // with nothing lost.
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(SchedulingPolicy::Fifo), 2);
    let leaf = tree.leaf(0).clone();
    leaf.update_queue_threshold(4);

    for i in 0..10 {
        tree.add_ready_task(
            &host,
            named_task(&format!("t{}", i)),
            Some(0),
            ReadyTaskHint::NoHint,
        );
    }

    let at_leaf = leaf.queued();
    let at_parent = tree.root().queued();
    assert!(at_leaf <= 4, "leaf kept {} tasks", at_leaf);
    assert!(at_parent >= 5, "parent saw {} tasks", at_parent);
    assert_eq!(at_leaf + at_parent, 10);
}

#[rstest]
#[case(SchedulingPolicy::Fifo)]
#[case(SchedulingPolicy::Lifo)]
fn leaf_polling_matches_policy(#[case] policy: SchedulingPolicy) {
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(policy), 1);
    tree.leaf(0).update_queue_threshold(64); // no overflow

    for name in ["a", "b", "c"] {
        tree.add_ready_task(&host, named_task(name), Some(0), ReadyTaskHint::NoHint);
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(tree.leaf(0).get_task(&host, false).unwrap().label().to_string());
    }

    match policy {
        SchedulingPolicy::Fifo => assert_eq!(order, ["a", "b", "c"]),
        SchedulingPolicy::Lifo => assert_eq!(order, ["c", "b", "a"]),
    }
}

#[test]
fn foreign_submission_lands_in_the_slot_and_wakes_an_idle_cpu() {
    // CPUs {0, 1}; leaf 1 is idle. A submission from a foreign thread hinted
    // at CPU 1 goes through the polling slot and wakes CPU 1 only.
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(SchedulingPolicy::Fifo), 2);

    // Drive both leaves to idle the way workers would.
    assert!(tree.leaf(0).get_task(&host, false).is_none());
    assert!(tree.leaf(1).get_task(&host, false).is_none());
    assert!(tree.leaf(0).is_idle() && tree.leaf(1).is_idle());

    tree.add_ready_task(&host, named_task("t"), None, ReadyTaskHint::ForCpu(1));

    assert!(tree.leaf(1).slot_occupied());
    assert_eq!(*host.woken.lock(), vec![1]);

    let task = tree.leaf(1).get_task(&host, false).unwrap();
    assert_eq!(task.label(), "t");
}

#[test]
fn polling_slot_holds_at_most_one_task() {
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(SchedulingPolicy::Fifo), 2);
    tree.leaf(1).update_queue_threshold(64);

    tree.add_ready_task(&host, named_task("first"), None, ReadyTaskHint::ForCpu(1));
    tree.add_ready_task(&host, named_task("second"), None, ReadyTaskHint::ForCpu(1));

    // One in the slot, the overflow went to the queue.
    assert!(tree.leaf(1).slot_occupied());
    assert_eq!(tree.leaf(1).queued(), 1);

    // The slot is preferred on the next poll.
    let first = tree.leaf(1).get_task(&host, false).unwrap();
    assert_eq!(first.label(), "first");
}

#[test]
fn batch_delivery_fills_slot_then_queue() {
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(SchedulingPolicy::Fifo), 1);
    let leaf = tree.leaf(0).clone();

    let batch: TaskBatch = ["x", "y", "z"].iter().map(|n| named_task(n)).collect();
    leaf.add_task_batch(&host, batch);

    assert!(leaf.slot_occupied());
    assert_eq!(leaf.queued(), 2);
}

#[test]
fn empty_leaf_goes_idle_after_bounded_polling() {
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(SchedulingPolicy::Fifo), 1);

    assert!(tree.leaf(0).get_task(&host, true).is_none());
    assert!(tree.leaf(0).is_idle());
    assert!(host.idle.lock().contains(&0));
}

#[test]
fn hungry_leaf_is_fed_when_tasks_arrive_at_the_node() {
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(SchedulingPolicy::Fifo), 2);

    // Leaf 1 requests work while everything is empty, then parks.
    assert!(tree.leaf(1).get_task(&host, false).is_none());
    assert!(tree.leaf(1).is_idle());

    // An overflow from leaf 0 reaches the node and is handed straight to the
    // hungry leaf 1, waking CPU 1.
    tree.leaf(0).update_queue_threshold(1);
    tree.add_ready_task(&host, named_task("a"), Some(0), ReadyTaskHint::NoHint);
    tree.add_ready_task(&host, named_task("b"), Some(0), ReadyTaskHint::NoHint);

    assert!(tree.leaf(1).slot_occupied());
    assert!(host.woken.lock().contains(&1));
}

#[test]
fn shrinking_threshold_sets_rebalance_and_next_dequeue_overflows() {
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(SchedulingPolicy::Fifo), 1);
    let leaf = tree.leaf(0).clone();
    leaf.update_queue_threshold(64);

    for i in 0..8 {
        tree.add_ready_task(
            &host,
            named_task(&format!("t{}", i)),
            Some(0),
            ReadyTaskHint::NoHint,
        );
    }
    assert_eq!(leaf.queued(), 8);

    // The fleet got busier elsewhere: the leaf's share shrinks.
    leaf.update_queue_threshold(2);

    let _ = leaf.get_task(&host, false).unwrap();
    assert!(
        leaf.queued() <= 6,
        "rebalance did not overflow, queue still {}",
        leaf.queued()
    );
    assert!(tree.root().queued() >= 1);
}

#[test]
fn disable_drains_queue_and_slot_to_the_parent() {
    let host = RecordingHost::default();
    let tree = TreeScheduler::new(&test_config(SchedulingPolicy::Fifo), 2);
    let leaf = tree.leaf(1).clone();
    leaf.update_queue_threshold(64);

    tree.add_ready_task(&host, named_task("slotted"), None, ReadyTaskHint::ForCpu(1));
    tree.add_ready_task(&host, named_task("queued"), None, ReadyTaskHint::ForCpu(1));
    assert!(leaf.slot_occupied());

    tree.disable_cpu(&host, 1);

    assert!(!leaf.slot_occupied());
    assert_eq!(leaf.queued(), 0);
    // No task lost: both ended up visible from the node side (possibly
    // already redistributed to leaf 0).
    let total = tree.root().queued() + tree.leaf(0).queued()
        + usize::from(tree.leaf(0).slot_occupied());
    assert_eq!(total, 2);
}

#[test]
fn immediate_successor_slot_short_circuits_the_scheduler() {
    let host = RecordingHost::default();
    let cfg = test_config(SchedulingPolicy::Fifo);
    let set = SchedulerSet::new(&cfg, 2, &crate::config::DevicePlaces::default()).unwrap();

    set.add_ready_task(&host, named_task("succ"), Some(0), ReadyTaskHint::ImmediateSuccessor);

    // Nothing reached the tree; CPU 0 gets it on its next poll.
    let task = set.get_ready_task(&host, 0).unwrap();
    assert_eq!(task.label(), "succ");
}

#[test]
fn opencl_and_fpga_places_are_rejected() {
    let cfg = test_config(SchedulingPolicy::Fifo);

    let opencl = crate::config::DevicePlaces {
        opencl: 1,
        ..Default::default()
    };
    assert!(SchedulerSet::new(&cfg, 1, &opencl).is_err());

    let fpga = crate::config::DevicePlaces {
        fpga: 1,
        ..Default::default()
    };
    assert!(SchedulerSet::new(&cfg, 1, &fpga).is_err());
}

#[test]
fn device_tasks_route_to_the_device_scheduler() {
    let host = RecordingHost::default();
    let cfg = test_config(SchedulingPolicy::Fifo);
    let devices = crate::config::DevicePlaces {
        cuda: 2,
        ..Default::default()
    };
    let set = SchedulerSet::new(&cfg, 1, &devices).unwrap();

    let task = Task::build("kernel")
        .device(crate::hardware::DeviceKind::Cuda)
        .body(|_| {})
        .finish();
    set.add_ready_task(&host, task, None, ReadyTaskHint::NoHint);

    // The host scheduler never saw it.
    assert!(set.get_ready_task(&host, 0).is_none());
    let polled = set.get_ready_device_task(&host, crate::hardware::DeviceKind::Cuda, 0);
    assert_eq!(polled.unwrap().label(), "kernel");
}
