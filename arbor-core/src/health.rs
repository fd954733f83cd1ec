//! Build-health telemetry for containers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use arbor_model::{ComputationResult, HealthReport};

use crate::container::ComputedContainer;

/// One contributed health dimension. Metrics returning `None` abstain
/// for containers they have nothing to say about.
#[async_trait]
pub trait HealthMetric: Send + Sync {
    async fn assess(&self, container: &ComputedContainer) -> Option<HealthReport>;
}

/// Default metric: the fraction of children whose newest build
/// succeeded.
#[derive(Debug, Default)]
pub struct ChildSuccessMetric;

#[async_trait]
impl HealthMetric for ChildSuccessMetric {
    async fn assess(&self, container: &ComputedContainer) -> Option<HealthReport> {
        let children = container.children().await;
        let mut tracked = 0usize;
        let mut healthy = 0usize;
        for child in children.values() {
            if let Some(result) = child.last_build_result() {
                tracked += 1;
                if result == ComputationResult::Success {
                    healthy += 1;
                }
            }
        }
        if tracked == 0 {
            return None;
        }
        Some(HealthReport::new(
            (healthy * 100 / tracked) as u32,
            format!("{healthy} of {tracked} children built successfully"),
        ))
    }
}

/// Explicit registry of health metrics, injected at container
/// creation. The worst contributed score wins.
pub struct HealthMetricRegistry {
    metrics: Mutex<Vec<Arc<dyn HealthMetric>>>,
}

impl std::fmt::Debug for HealthMetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMetricRegistry")
            .field("metrics", &self.metrics.lock().expect("metrics lock").len())
            .finish()
    }
}

impl Default for HealthMetricRegistry {
    fn default() -> Self {
        let registry = Self {
            metrics: Mutex::new(Vec::new()),
        };
        registry.register(Arc::new(ChildSuccessMetric));
        registry
    }
}

impl HealthMetricRegistry {
    pub fn empty() -> Self {
        Self {
            metrics: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, metric: Arc<dyn HealthMetric>) {
        self.metrics.lock().expect("metrics lock").push(metric);
    }

    pub async fn assess(&self, container: &ComputedContainer) -> HealthReport {
        let metrics: Vec<_> = self.metrics.lock().expect("metrics lock").clone();
        let mut worst: Option<HealthReport> = None;
        for metric in metrics {
            if let Some(report) = metric.assess(container).await {
                worst = match worst {
                    Some(current) if current.score <= report.score => Some(current),
                    _ => Some(report),
                };
            }
        }
        worst.unwrap_or_else(|| HealthReport::new(100, "No health metrics reported"))
    }
}

/// Refresh delay for the health cache: uniform inside the second half
/// of the window, so refreshes across many containers never stampede.
pub fn jittered_refresh(window: Duration) -> Duration {
    let half = window / 2;
    let half_ms = half.as_millis() as u64;
    let jitter_ms = if half_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..half_ms)
    };
    half + Duration::from_millis(jitter_ms)
}
