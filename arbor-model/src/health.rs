use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregated build-health snapshot for a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// 0..=100; 100 means every contributing metric is fully healthy.
    pub score: u32,
    pub description: String,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(score: u32, description: impl Into<String>) -> Self {
        Self {
            score: score.min(100),
            description: description.into(),
            generated_at: Utc::now(),
        }
    }
}
