use std::fmt;

use serde::{Deserialize, Serialize};

/// Who or what requested a computation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cause {
    /// A periodic trigger fired.
    Timer,
    /// An administrator asked for an immediate recomputation.
    User { user: String },
    /// An out-of-band event (webhook, broker message) was observed.
    Event { origin: String },
    /// The named ancestor container is being deleted; this run was
    /// interrupted by the cascade.
    OrphanedParent { full_name: String },
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Timer => write!(f, "Started by timer"),
            Cause::User { user } => write!(f, "Started by user {user}"),
            Cause::Event { origin } => write!(f, "Started by event from {origin}"),
            Cause::OrphanedParent { full_name } => {
                write!(f, "Interrupted by deletion of {full_name}")
            }
        }
    }
}
