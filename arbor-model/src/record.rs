use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cause::Cause;
use crate::result::ComputationResult;

/// Maximum number of run durations retained for estimation.
pub const DURATION_HISTORY_LEN: usize = 32;

/// Persisted record of a computation run.
///
/// Written on the terminal transition; `result` is `None` only for
/// records of runs that never reached a terminal state (crash before
/// persist), which readers treat the same as `NOT_BUILT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationRecord {
    pub id: Uuid,
    /// Start of the run, milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Wall-clock duration of the run in milliseconds; positive iff the
    /// run reached a terminal result.
    pub duration_ms: i64,
    pub result: Option<ComputationResult>,
    pub causes: Vec<Cause>,
    /// Rolling history of the most recent run durations, oldest first.
    pub durations_ms: Vec<i64>,
}

impl ComputationRecord {
    /// Arithmetic mean of the rolling history; `-1` when empty.
    pub fn estimated_duration_ms(&self) -> i64 {
        if self.durations_ms.is_empty() {
            return -1;
        }
        let sum: i64 = self.durations_ms.iter().sum();
        sum / self.durations_ms.len() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_mean_of_history() {
        let mut record = ComputationRecord {
            id: Uuid::nil(),
            timestamp_ms: 0,
            duration_ms: 0,
            result: None,
            causes: Vec::new(),
            durations_ms: Vec::new(),
        };
        assert_eq!(record.estimated_duration_ms(), -1);
        record.durations_ms = vec![100, 200, 300];
        assert_eq!(record.estimated_duration_ms(), 200);
    }
}
