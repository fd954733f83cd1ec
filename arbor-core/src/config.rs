use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune the container runtime.
///
/// All fields carry defaults so existing deployments can progressively
/// adopt new behaviour without supplying a full configuration payload.
/// Environment overrides use the names documented on each field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Cap on concurrent computations platform-wide. Overridden by
    /// `THROTTLE_LIMIT`; defaults to `min(5, 4 x cpus)`.
    pub throttle_limit: usize,
    /// Rotated computation-log backups to retain; 0 disables rotation.
    /// Overridden by `BACKUP_LOG_COUNT`.
    pub backup_log_count: usize,
    /// Event log rotation size in KiB. Overridden by
    /// `EVENT_LOG_MAX_SIZE_KB`.
    pub event_log_max_size_kb: u64,
    /// Rotated event-log backups to retain.
    pub event_log_file_count: usize,
    /// Minutes between health-report refreshes, clamped to [10, 1440].
    /// Overridden by `HEALTH_REPORT_CACHE_MIN`.
    pub health_report_cache_min: u32,
    /// How long a delete-cascade waits for interrupted builds to stop.
    pub delete_grace: Duration,
    /// Poll cadence inside the delete-cascade grace window.
    pub delete_poll_interval: Duration,
    /// Enqueue delay applied to timer-triggered builds so triggers
    /// firing in the same minute coalesce.
    pub trigger_quiet_period: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            throttle_limit: default_throttle_limit(),
            backup_log_count: 0,
            event_log_max_size_kb: 150,
            event_log_file_count: 5,
            health_report_cache_min: 60,
            delete_grace: Duration::from_secs(15),
            delete_poll_interval: Duration::from_millis(50),
            trigger_quiet_period: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    /// Default configuration with the documented environment overrides
    /// applied on top.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(limit) = env_parse::<usize>("THROTTLE_LIMIT") {
            config.throttle_limit = limit.max(1);
        }
        if let Some(count) = env_parse::<usize>("BACKUP_LOG_COUNT") {
            config.backup_log_count = count;
        }
        if let Some(kb) = env_parse::<u64>("EVENT_LOG_MAX_SIZE_KB") {
            config.event_log_max_size_kb = kb.max(1);
        }
        if let Some(min) = env_parse::<u32>("HEALTH_REPORT_CACHE_MIN") {
            config.health_report_cache_min = min;
        }
        config.health_report_cache_min = config.health_report_cache_min.clamp(10, 1440);
        config
    }
}

fn default_throttle_limit() -> usize {
    5.min(4 * num_cpus::get().max(1))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}
