//! Minute tick driving every periodic trigger.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::runtime::ContainerRegistry;

/// Ticks once per wall-clock minute, visiting every registered
/// container's triggers. After a suspension it catches up by
/// advancing its reference calendar one minute at a time, so a paused
/// process still fires each intended minute exactly once.
pub struct Cron {
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Cron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cron").finish_non_exhaustive()
    }
}

impl Cron {
    /// Spawns the tick worker. Must be called within a tokio runtime.
    pub fn start(registry: Arc<ContainerRegistry>) -> Self {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(registry, shutdown.clone()));
        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().expect("cron lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(registry: Arc<ContainerRegistry>, shutdown: CancellationToken) {
    // Align to the next wall-clock minute.
    let mut reference = next_minute(Utc::now());
    loop {
        let now = Utc::now();
        if reference > now {
            let wait = (reference - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(60));
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        if shutdown.is_cancelled() {
            return;
        }
        // Catch up minute by minute; a long pause replays each missed
        // minute once rather than collapsing them into one tick.
        while reference <= Utc::now() {
            tick(&registry, reference);
            reference += ChronoDuration::minutes(1);
        }
    }
}

fn tick(registry: &ContainerRegistry, reference: DateTime<Utc>) {
    let minute_of_day = reference.hour() * 60 + reference.minute();
    trace!("cron tick at minute {}", minute_of_day);
    for container in registry.snapshot() {
        for trigger in container.triggers() {
            if !trigger.spec().cadence().due(minute_of_day) {
                continue;
            }
            // One misbehaving trigger never stops the sweep.
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                trigger.run(&container);
            }));
            if outcome.is_err() {
                error!("trigger for {} panicked; continuing", container.full_name());
            }
        }
    }
}

fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    truncated + ChronoDuration::minutes(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_minute_is_aligned() {
        let now = Utc::now();
        let next = next_minute(now);
        assert_eq!(next.second(), 0);
        assert!(next > now);
        assert!((next - now) <= ChronoDuration::minutes(1));
    }
}
