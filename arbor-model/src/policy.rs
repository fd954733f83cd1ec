use serde::{Deserialize, Serialize};

/// Retention policy applied to children dropped by a recomputation.
///
/// `num_to_keep` and `days_to_keep` use `-1` as the "unlimited"
/// sentinel, which is also what blank or unparsable configuration
/// fields collapse to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanPolicy {
    pub prune: bool,
    pub num_to_keep: i32,
    pub days_to_keep: i32,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        Self {
            prune: false,
            num_to_keep: -1,
            days_to_keep: -1,
        }
    }
}

impl OrphanPolicy {
    pub fn new(prune: bool, num_to_keep: &str, days_to_keep: &str) -> Self {
        Self {
            prune,
            num_to_keep: parse_bound(num_to_keep),
            days_to_keep: parse_bound(days_to_keep),
        }
    }

    /// True when the policy can never delete anything.
    pub fn keeps_everything(&self) -> bool {
        !self.prune || (self.num_to_keep < 0 && self.days_to_keep < 0)
    }
}

/// Parses a retention bound field. Blank or unparsable values mean
/// "unlimited" and collapse to `-1`; negative inputs do the same.
pub fn parse_bound(field: &str) -> i32 {
    match field.trim().parse::<i32>() {
        Ok(n) if n >= 0 => n,
        _ => -1,
    }
}
