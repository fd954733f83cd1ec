//! Per-name coordination for child reconciliation.
//!
//! Every child interaction during a computation (or an out-of-band
//! event handler) is mediated by a [`ChildObserver`]. The container's
//! shared [`BusyTable`] guarantees that at most one holder touches a
//! given child name at a time, across all concurrently open observers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use arbor_model::ChildName;

use crate::error::{ContainerError, Result};
use crate::host::ChildItem;
use crate::store::ChildMap;

/// Lifecycle of one name inside an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationStatus {
    Seen,
    Created,
    Updated,
    Completed,
}

/// Container-scoped table of names currently being reconciled.
/// Shared by every observer the container opens.
#[derive(Default)]
pub struct BusyTable {
    names: Mutex<HashSet<ChildName>>,
    released: Notify,
}

impl std::fmt::Debug for BusyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyTable")
            .field("busy", &self.names.lock().expect("busy lock").len())
            .finish()
    }
}

struct ObserverState {
    observed: HashSet<ChildName>,
    orphaned: ChildMap,
    /// Names this observer currently holds, with their status.
    held: HashMap<ChildName, ObservationStatus>,
    created: Vec<(ChildName, Arc<dyn ChildItem>)>,
    updated: Vec<(ChildName, Arc<dyn ChildItem>)>,
    closed: bool,
}

/// Computation-scoped synchronisation primitive owning the `observed`,
/// `orphaned`, and (via the shared table) `busy` name collections.
pub struct ChildObserver {
    children: Arc<RwLock<ChildMap>>,
    busy: Arc<BusyTable>,
    state: Mutex<ObserverState>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChildObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("observer lock");
        f.debug_struct("ChildObserver")
            .field("observed", &state.observed.len())
            .field("orphaned", &state.orphaned.len())
            .field("held", &state.held.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl ChildObserver {
    /// Reconciliation flavour: every current child starts orphaned
    /// until re-observed.
    pub fn for_reconciliation(
        children: Arc<RwLock<ChildMap>>,
        busy: Arc<BusyTable>,
        snapshot: ChildMap,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(children, busy, snapshot, cancel)
    }

    /// Events flavour: out-of-band handlers never orphan anything.
    pub fn for_events(
        children: Arc<RwLock<ChildMap>>,
        busy: Arc<BusyTable>,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(children, busy, ChildMap::new(), cancel)
    }

    fn new(
        children: Arc<RwLock<ChildMap>>,
        busy: Arc<BusyTable>,
        orphaned: ChildMap,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            children,
            busy,
            state: Mutex::new(ObserverState {
                observed: HashSet::new(),
                orphaned,
                held: HashMap::new(),
                created: Vec::new(),
                updated: Vec::new(),
                closed: false,
            }),
            cancel,
        }
    }

    /// Claims `name`, waiting while another holder has it. Returns the
    /// existing child when the container already has one (the caller
    /// should reconcile it), or `None` (the caller may proceed to
    /// [`Self::may_create`]). Cancellable.
    pub async fn should_update(&self, name: &ChildName) -> Result<Option<Arc<dyn ChildItem>>> {
        if self.cancel.is_cancelled() {
            return Err(ContainerError::Cancelled(format!(
                "interrupted before observing {}",
                name.as_str()
            )));
        }
        loop {
            // Register interest before re-checking so a release between
            // the check and the await cannot be missed.
            let released = self.busy.released.notified();
            {
                let mut busy = self.busy.names.lock().expect("busy lock");
                if !busy.contains(name) {
                    busy.insert(name.clone());
                    break;
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ContainerError::Cancelled(format!(
                        "interrupted while waiting for {}",
                        name.as_str()
                    )));
                }
                _ = released => {}
            }
        }

        let existing = self.children.read().await.get(name).cloned();
        let mut state = self.state.lock().expect("observer lock");
        state.observed.insert(name.clone());
        state.orphaned.remove(name);
        let status = if existing.is_some() {
            ObservationStatus::Updated
        } else {
            ObservationStatus::Seen
        };
        state.held.insert(name.clone(), status);
        Ok(existing)
    }

    /// Whether a child named `name` may be created. Only valid while
    /// holding `name` (a [`Self::should_update`] that returned `None`
    /// without an intervening [`Self::completed`]).
    pub async fn may_create(&self, name: &ChildName) -> bool {
        {
            let state = self.state.lock().expect("observer lock");
            if !state.held.contains_key(name) {
                return false;
            }
        }
        self.children.read().await.get(name).is_none()
    }

    /// Commits a newly constructed child into the container's map. The
    /// child must already carry its business name.
    pub async fn created(&self, child: Arc<dyn ChildItem>) -> Result<()> {
        let name = child
            .stored_business_name()
            .map(ChildName::new)
            .ok_or_else(|| {
                ContainerError::InvariantViolation(
                    "created child carries no business name".to_string(),
                )
            })?;
        {
            let mut state = self.state.lock().expect("observer lock");
            if state.held.get(&name) != Some(&ObservationStatus::Seen) {
                return Err(ContainerError::InvariantViolation(format!(
                    "created {} without holding it",
                    name.as_str()
                )));
            }
            state.held.insert(name.clone(), ObservationStatus::Created);
            state.created.push((name.clone(), child.clone()));
        }
        self.children.write().await.insert(name, child);
        Ok(())
    }

    /// Hands the driver a freshly computed replacement for an existing
    /// child. Only valid while holding `name` after a
    /// [`Self::should_update`] that returned the existing child. The
    /// replacement is not installed in the map; the driver merges it
    /// into the existing item through the container's reconciler.
    pub fn updated(&self, replacement: Arc<dyn ChildItem>) -> Result<()> {
        let name = replacement
            .stored_business_name()
            .map(ChildName::new)
            .ok_or_else(|| {
                ContainerError::InvariantViolation(
                    "replacement child carries no business name".to_string(),
                )
            })?;
        let mut state = self.state.lock().expect("observer lock");
        if state.held.get(&name) != Some(&ObservationStatus::Updated) {
            return Err(ContainerError::InvariantViolation(format!(
                "updated {} without holding an existing child",
                name.as_str()
            )));
        }
        state.updated.push((name, replacement));
        Ok(())
    }

    /// Releases the busy slot for `name`. Idempotent within one open
    /// observer.
    pub fn completed(&self, name: &ChildName) {
        let mut state = self.state.lock().expect("observer lock");
        if state.held.remove(name).is_some() {
            drop(state);
            let mut busy = self.busy.names.lock().expect("busy lock");
            busy.remove(name);
            drop(busy);
            self.busy.released.notify_waiters();
        }
    }

    /// Snapshot of every name observed so far.
    pub fn observed(&self) -> Vec<ChildName> {
        let state = self.state.lock().expect("observer lock");
        let mut names: Vec<_> = state.observed.iter().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of children that existed at open and have not been
    /// re-observed.
    pub fn orphaned(&self) -> ChildMap {
        self.state.lock().expect("observer lock").orphaned.clone()
    }

    /// Children committed through [`Self::created`] so far.
    pub(crate) fn take_created(&self) -> Vec<(ChildName, Arc<dyn ChildItem>)> {
        let mut state = self.state.lock().expect("observer lock");
        std::mem::take(&mut state.created)
    }

    /// Replacements recorded through [`Self::updated`] so far.
    pub(crate) fn take_updated(&self) -> Vec<(ChildName, Arc<dyn ChildItem>)> {
        let mut state = self.state.lock().expect("observer lock");
        std::mem::take(&mut state.updated)
    }

    /// Releases every still-held name as if [`Self::completed`] had
    /// been called. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("observer lock");
        if state.closed {
            return;
        }
        state.closed = true;
        let leftover: Vec<_> = state.held.drain().map(|(name, _)| name).collect();
        drop(state);
        if !leftover.is_empty() {
            debug!("observer closed with {} names still busy", leftover.len());
            let mut busy = self.busy.names.lock().expect("busy lock");
            for name in &leftover {
                busy.remove(name);
            }
            drop(busy);
            self.busy.released.notify_waiters();
        }
    }
}

impl Drop for ChildObserver {
    fn drop(&mut self) {
        self.close();
    }
}
