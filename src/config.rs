use anyhow::{Context, Result, anyhow};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Ordering discipline of the ready queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    #[default]
    Fifo,
    Lifo,
}

impl FromStr for SchedulingPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" | "FIFO" => Ok(SchedulingPolicy::Fifo),
            "lifo" | "LIFO" => Ok(SchedulingPolicy::Lifo),
            other => Err(anyhow!("unknown scheduling policy: {:?}", other)),
        }
    }
}

/// Which ready-task scheduler implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerFlavor {
    /// Per-CPU leaves under one interior node.
    #[default]
    Tree,
    /// Single global lock, used as a reference implementation.
    Naive,
}

/// Scheduler knobs, resolved by the Builder from the environment and
/// programmatic overrides.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    pub(crate) flavor: SchedulerFlavor,
    pub(crate) policy: SchedulingPolicy,
    pub(crate) immediate_successor: bool,
    pub(crate) priority: bool,
    pub(crate) polling_iterations: usize,
}

/// Compute-place counts per non-host device class.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevicePlaces {
    pub cuda: usize,
    pub openacc: usize,
    pub opencl: usize,
    pub fpga: usize,
}

pub(crate) const SCHEDULING_POLICY_VAR: &str = "NANOS6_SCHEDULING_POLICY";
pub(crate) const IMMEDIATE_SUCCESSOR_VAR: &str = "NANOS6_IMMEDIATE_SUCCESSOR";
pub(crate) const PRIORITY_VAR: &str = "NANOS6_PRIORITY";
pub(crate) const POLLING_ITER_VAR: &str = "NANOS6_SCHEDULER_POLLING_ITER";

pub(crate) const DEFAULT_POLLING_ITERATIONS: usize = 100_000;

/// How often the transfer poller re-probes outstanding transfers.
pub(crate) const DEFAULT_TRANSFER_POLL_INTERVAL: Duration = Duration::from_micros(50);

pub(crate) fn env_policy() -> Result<SchedulingPolicy> {
    match env::var(SCHEDULING_POLICY_VAR) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("parsing {}", SCHEDULING_POLICY_VAR)),
        Err(_) => Ok(SchedulingPolicy::default()),
    }
}

pub(crate) fn env_flag(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(anyhow!("{} must be 0 or 1, got {:?}", name, other)),
        },
        Err(_) => Ok(default),
    }
}

pub(crate) fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("parsing {}", name)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rstest::rstest;

    // Environment variables are process-wide; serialize the tests that touch
    // them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[rstest]
    #[case("fifo", SchedulingPolicy::Fifo)]
    #[case("FIFO", SchedulingPolicy::Fifo)]
    #[case("lifo", SchedulingPolicy::Lifo)]
    #[case("LIFO", SchedulingPolicy::Lifo)]
    fn policy_parses(#[case] raw: &str, #[case] expected: SchedulingPolicy) {
        assert_eq!(raw.parse::<SchedulingPolicy>().unwrap(), expected);
    }

    #[test]
    fn policy_rejects_garbage() {
        assert!("round-robin".parse::<SchedulingPolicy>().is_err());
    }

    #[test]
    fn env_defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock();
        unsafe {
            std::env::remove_var(SCHEDULING_POLICY_VAR);
            std::env::remove_var(IMMEDIATE_SUCCESSOR_VAR);
            std::env::remove_var(POLLING_ITER_VAR);
        }

        assert_eq!(env_policy().unwrap(), SchedulingPolicy::Fifo);
        assert!(env_flag(IMMEDIATE_SUCCESSOR_VAR, true).unwrap());
        assert_eq!(
            env_usize(POLLING_ITER_VAR, DEFAULT_POLLING_ITERATIONS).unwrap(),
            DEFAULT_POLLING_ITERATIONS
        );
    }

    #[test]
    fn env_overrides_are_read() {
        let _guard = ENV_LOCK.lock();
        unsafe {
            std::env::set_var(SCHEDULING_POLICY_VAR, "LIFO");
            std::env::set_var(PRIORITY_VAR, "0");
            std::env::set_var(POLLING_ITER_VAR, "1234");
        }

        assert_eq!(env_policy().unwrap(), SchedulingPolicy::Lifo);
        assert!(!env_flag(PRIORITY_VAR, true).unwrap());
        assert_eq!(env_usize(POLLING_ITER_VAR, 1).unwrap(), 1234);

        unsafe {
            std::env::remove_var(SCHEDULING_POLICY_VAR);
            std::env::remove_var(PRIORITY_VAR);
            std::env::remove_var(POLLING_ITER_VAR);
        }
    }

    #[test]
    fn malformed_env_values_error() {
        let _guard = ENV_LOCK.lock();
        unsafe {
            std::env::set_var(POLLING_ITER_VAR, "not-a-number");
        }
        assert!(env_usize(POLLING_ITER_VAR, 1).is_err());
        unsafe {
            std::env::remove_var(POLLING_ITER_VAR);
        }
    }
}
