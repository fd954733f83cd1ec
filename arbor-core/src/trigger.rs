//! Periodic recomputation trigger.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use arbor_model::{Cause, TriggerSpec};

use crate::container::ComputedContainer;

/// Dispatch slack subtracted from the interval: one minute-tick of
/// jitter (5% of the interval) plus the enqueue quiet period and its
/// margin.
const DISPATCH_SLACK: Duration = Duration::from_secs(15);

/// Decides, on every visit from the cron, whether its container is due
/// for recomputation.
#[derive(Debug, Clone)]
pub struct PeriodicTrigger {
    spec: TriggerSpec,
}

impl PeriodicTrigger {
    pub fn new(spec: TriggerSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &TriggerSpec {
        &self.spec
    }

    /// The effective due threshold. Slightly shorter than the
    /// configured interval so that minute-granularity dispatch and the
    /// enqueue delay do not stretch the observed period.
    fn almost_interval(&self) -> Duration {
        let interval = self.spec.interval();
        interval
            .saturating_sub(interval / 20)
            .saturating_sub(DISPATCH_SLACK)
    }

    /// Visits the container. First-ever scheduling is handled at
    /// creation time, so a container with no recorded computation is
    /// left alone here.
    pub fn run(&self, container: &ComputedContainer) {
        let last = container.last_computation_ms();
        if last == 0 {
            return;
        }
        let elapsed_ms = Utc::now().timestamp_millis().saturating_sub(last);
        if elapsed_ms < 0 {
            return;
        }
        if Duration::from_millis(elapsed_ms as u64) < self.almost_interval() {
            return;
        }
        let quiet = container.config().trigger_quiet_period;
        if container.schedule_build(quiet, Cause::Timer) {
            debug!("timer scheduled recomputation of {}", container.full_name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn almost_interval_compensates_for_dispatch_jitter() {
        let trigger = PeriodicTrigger::new(TriggerSpec::parse("20m").unwrap());
        // 20 min - 1 min (5%) - 15 s
        assert_eq!(trigger.almost_interval(), Duration::from_secs(20 * 60 - 60 - 15));

        let trigger = PeriodicTrigger::new(TriggerSpec::parse("1m").unwrap());
        assert_eq!(trigger.almost_interval(), Duration::from_secs(60 - 3 - 15));
    }
}
