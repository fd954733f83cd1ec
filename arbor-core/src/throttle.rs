//! Process-wide cap on concurrent computations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Entries younger than this still count as "approved but not yet
/// running". The window admits items in bursts while rate-limiting
/// their arrival into the run state, so repeated queue checks for the
/// same item within a second are not double-counted.
const RESERVATION_WINDOW: Duration = Duration::from_secs(1);

/// Reason handed back when the throttle vetoes a dispatch.
pub const BLOCKED_REASON: &str = "max concurrent indexing";

/// Caps the number of concurrent computations platform-wide,
/// independently of how many executors the host runs.
pub struct GlobalThrottle {
    limit: usize,
    running: Arc<AtomicUsize>,
    non_blocked: Mutex<Vec<(Uuid, Instant)>>,
}

impl std::fmt::Debug for GlobalThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalThrottle")
            .field("limit", &self.limit)
            .field("running", &self.currently_running())
            .finish()
    }
}

impl GlobalThrottle {
    pub fn new(limit: usize, running: Arc<AtomicUsize>) -> Self {
        Self {
            limit: limit.max(1),
            running,
            non_blocked: Mutex::new(Vec::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Computations in flight across all executors.
    pub fn currently_running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Queue hook: `None` admits the item, `Some(reason)` blocks it.
    pub fn can_run(&self, item_id: Uuid) -> Option<&'static str> {
        let mut non_blocked = self.non_blocked.lock().expect("throttle lock");
        let now = Instant::now();
        non_blocked.retain(|(_, approved_at)| now.duration_since(*approved_at) < RESERVATION_WINDOW);

        let found = non_blocked.iter().any(|(id, _)| *id == item_id);
        let approved = non_blocked.len();
        if !found && self.currently_running() + approved >= self.limit {
            return Some(BLOCKED_REASON);
        }
        if !found {
            non_blocked.push((item_id, now));
        }
        None
    }
}
