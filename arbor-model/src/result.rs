use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal outcome of a computation run.
///
/// Absent while the run is in flight; exactly one value is published on
/// the terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputationResult {
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl fmt::Display for ComputationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComputationResult::Success => "SUCCESS",
            ComputationResult::Unstable => "UNSTABLE",
            ComputationResult::Failure => "FAILURE",
            ComputationResult::NotBuilt => "NOT_BUILT",
            ComputationResult::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}
