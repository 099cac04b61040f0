use std::time::Duration;

use restraint_core::RestraintConfig;

/// Settings of the background loops, derived from [`RestraintConfig`].
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Interval in seconds between reconciler sweeps. 0 disables the reconciler.
    pub reconcile_interval_secs: u64,
    pub reconcile_batch_size: usize,
    /// Retention in days for FINISHED consumers. 0 disables the sweeper.
    pub retention_days: i64,
    pub retention_sweep_interval_secs: u64,
    /// Attempts per release event, transient errors only.
    pub release_max_attempts: u32,
    /// Delay before the first retry of a release event; doubles per attempt.
    pub release_retry_base: Duration,
    pub release_channel_capacity: usize,
    /// Subscribe to release events over Postgres LISTEN.
    pub listen_notify_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
            reconcile_batch_size: 500,
            retention_days: 30,
            retention_sweep_interval_secs: 3600,
            release_max_attempts: 5,
            release_retry_base: Duration::from_millis(500),
            release_channel_capacity: 256,
            listen_notify_enabled: true,
        }
    }
}

impl From<&RestraintConfig> for WorkerConfig {
    fn from(config: &RestraintConfig) -> Self {
        Self {
            reconcile_interval_secs: config.reconcile_interval_secs,
            reconcile_batch_size: config.reconcile_batch_size,
            retention_days: config.retention_days,
            retention_sweep_interval_secs: config.retention_sweep_interval_secs,
            release_max_attempts: config.release_max_attempts,
            listen_notify_enabled: config.listen_notify_enabled,
            ..Self::default()
        }
    }
}
