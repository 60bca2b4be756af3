//! Scheduler configuration.

use std::env;

/// Tunables for the scheduler process. Defaults are production values;
/// `from_env` overlays `BERTH_*` environment variables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Offer queue bound; 0 means unbounded.
    pub offer_queue_size: usize,
    /// Run the offer pump and reconciler on background tasks. Disabled in
    /// tests for determinism.
    pub multithreaded: bool,
    /// Initial implicit-reconciliation backoff, seconds.
    pub reconcile_base_secs: u64,
    /// Reconciliation backoff cap, seconds.
    pub reconcile_max_secs: u64,
    /// Command a paused task relaunches with.
    pub pause_command: String,
    /// Status reasons that mark a failed task permanently failed,
    /// replacing it instead of relaunching in place.
    pub permanent_failure_reasons: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            offer_queue_size: 100,
            multithreaded: true,
            reconcile_base_secs: 8,
            reconcile_max_secs: 3600,
            pause_command: "sleep 604800".to_string(),
            permanent_failure_reasons: vec![
                "GC_ERROR".to_string(),
                "AGENT_REMOVED".to_string(),
                "TASK_UNKNOWN".to_string(),
            ],
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with `BERTH_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = parse_env("BERTH_OFFER_QUEUE_SIZE") {
            config.offer_queue_size = size;
        }
        if let Some(base) = parse_env("BERTH_RECONCILE_BASE_SECS") {
            config.reconcile_base_secs = base;
        }
        if let Some(max) = parse_env("BERTH_RECONCILE_MAX_SECS") {
            config.reconcile_max_secs = max;
        }
        if let Ok(command) = env::var("BERTH_PAUSE_COMMAND") {
            config.pause_command = command;
        }
        if let Ok(reasons) = env::var("BERTH_PERMANENT_FAILURE_REASONS") {
            config.permanent_failure_reasons = reasons
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
        }
        config
    }

    /// Whether the given status reason marks a permanent failure.
    pub fn is_permanent_failure_reason(&self, reason: &str) -> bool {
        self.permanent_failure_reasons.iter().any(|r| r == reason)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.parse().ok()
}
