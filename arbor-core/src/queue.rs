//! Lean build queue dispatching computations onto the runtime.
//!
//! Stands in for the host platform's queue: it holds pending items,
//! runs the gate and throttle hooks at dispatch time, and supports the
//! cancel-by-subtree sweep the delete cascade needs. At most one item
//! per container is pending at a time; a second enqueue coalesces its
//! causes into the existing item.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use arbor_model::{Cause, FullName};

use crate::container::ComputedContainer;
use crate::gate;
use crate::throttle::GlobalThrottle;

/// Dispatcher wake-up cadence when nothing pokes it explicitly.
const DISPATCH_TICK: Duration = Duration::from_millis(50);

struct QueuedItem {
    id: Uuid,
    owner: Weak<ComputedContainer>,
    owner_name: FullName,
    causes: Vec<Cause>,
    available_at: Instant,
}

pub struct BuildQueue {
    items: Mutex<Vec<QueuedItem>>,
    throttle: Arc<GlobalThrottle>,
    wakeup: Notify,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BuildQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildQueue")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl BuildQueue {
    /// Creates the queue and spawns its dispatcher. Must be called
    /// within a tokio runtime.
    pub fn start(throttle: Arc<GlobalThrottle>) -> Arc<Self> {
        let queue = Arc::new(Self {
            items: Mutex::new(Vec::new()),
            throttle,
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(dispatcher(queue.clone()));
        *queue.task.lock().expect("queue lock") = Some(task);
        queue
    }

    /// Adds (or coalesces into) the pending item for `owner`.
    pub(crate) fn enqueue(
        &self,
        owner: Weak<ComputedContainer>,
        owner_name: FullName,
        delay: Duration,
        causes: Vec<Cause>,
    ) -> bool {
        let mut items = self.items.lock().expect("queue lock");
        if let Some(item) = items.iter_mut().find(|item| item.owner_name == owner_name) {
            for cause in causes {
                if !item.causes.contains(&cause) {
                    item.causes.push(cause);
                }
            }
            return true;
        }
        items.push(QueuedItem {
            id: Uuid::now_v7(),
            owner,
            owner_name,
            causes,
            available_at: Instant::now() + delay,
        });
        drop(items);
        self.wakeup.notify_one();
        true
    }

    /// Sweeps every pending item owned by `name` or a descendant.
    pub(crate) fn cancel_subtree(&self, name: &FullName) {
        let prefix = format!("{}/", name.as_str());
        let mut items = self.items.lock().expect("queue lock");
        let before = items.len();
        items.retain(|item| {
            item.owner_name != *name && !item.owner_name.as_str().starts_with(&prefix)
        });
        let swept = before - items.len();
        if swept > 0 {
            debug!("swept {} pending items under {}", swept, name);
        }
    }

    /// Nudges the dispatcher; called when a run finishes so queued
    /// work behind the throttle or a per-container slot gets another
    /// look without waiting out the tick.
    pub(crate) fn poke(&self) {
        self.wakeup.notify_one();
    }

    pub fn pending_count(&self) -> usize {
        self.items.lock().expect("queue lock").len()
    }

    pub fn is_queued(&self, name: &FullName) -> bool {
        self.items
            .lock()
            .expect("queue lock")
            .iter()
            .any(|item| item.owner_name == *name)
    }

    /// Stops the dispatcher; pending items are discarded.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().expect("queue lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// One dispatch pass: hand every due, unblocked item to an
    /// executor task.
    fn dispatch_due(&self) {
        let now = Instant::now();
        let mut ready = Vec::new();
        {
            let mut items = self.items.lock().expect("queue lock");
            let mut index = 0;
            while index < items.len() {
                let item = &items[index];
                if item.available_at > now {
                    index += 1;
                    continue;
                }
                let Some(owner) = item.owner.upgrade() else {
                    items.remove(index);
                    continue;
                };
                if owner.is_deleted() {
                    items.remove(index);
                    continue;
                }
                // Blocked items stay queued: a disabled ancestor, a
                // run already in flight, or the global throttle.
                if !gate::should_schedule(&owner)
                    || owner.is_building()
                    || self.throttle.can_run(item.id).is_some()
                {
                    index += 1;
                    continue;
                }
                let item = items.remove(index);
                ready.push((owner, item.causes));
            }
        }
        for (owner, causes) in ready {
            let computation = owner.create_executable(causes);
            tokio::spawn(computation.run());
        }
    }
}

async fn dispatcher(queue: Arc<BuildQueue>) {
    loop {
        tokio::select! {
            _ = queue.shutdown.cancelled() => return,
            _ = queue.wakeup.notified() => {}
            _ = tokio::time::sleep(DISPATCH_TICK) => {}
        }
        queue.dispatch_due();
    }
}
