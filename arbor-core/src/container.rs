//! The computed container: owner of the child map, the reconciliation
//! hook, and the lifecycle machinery around both.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arbor_model::{
    Cause, ChildName, FullName, HealthReport, TriggerSpec, DURATION_HISTORY_LEN,
};

use crate::computation::Computation;
use crate::config::RuntimeConfig;
use crate::error::{ContainerError, Result};
use crate::events::{EventLogConfig, EventLogWriter, LogFileSupplier};
use crate::gate;
use crate::health::HealthMetricRegistry;
use crate::host::{ChildItem, ChildLoader, Reconciler};
use crate::layout;
use crate::listener::ComputationListener;
use crate::naming::NameMangler;
use crate::observe::{BusyTable, ChildObserver};
use crate::orphan::OrphanStrategy;
use crate::queue::BuildQueue;
use crate::runtime::ContainerRegistry;
use crate::store::{ChildMap, ChildStore, LoadProgress};
use crate::trigger::PeriodicTrigger;

/// Static configuration handed over when a container is created.
pub struct ContainerSettings {
    pub full_name: FullName,
    pub root_dir: PathBuf,
    pub config: RuntimeConfig,
    pub triggers: Vec<TriggerSpec>,
    pub orphan_strategy: Arc<dyn OrphanStrategy>,
    pub mangler: Arc<dyn NameMangler>,
}

impl std::fmt::Debug for ContainerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSettings")
            .field("full_name", &self.full_name)
            .field("root_dir", &self.root_dir)
            .finish_non_exhaustive()
    }
}

impl ContainerSettings {
    /// Settings with no triggers, keep-all retention, and the default
    /// mangler.
    pub fn new(full_name: FullName, root_dir: PathBuf, config: RuntimeConfig) -> Self {
        Self {
            full_name,
            root_dir,
            config,
            triggers: Vec::new(),
            orphan_strategy: Arc::new(crate::orphan::KeepAllStrategy),
            mangler: Arc::new(crate::naming::DefaultMangler),
        }
    }
}

/// A container whose children are computed from an external source
/// rather than created by users.
pub struct ComputedContainer {
    self_weak: Weak<ComputedContainer>,
    full_name: FullName,
    root_dir: PathBuf,
    config: RuntimeConfig,
    parent: Option<Weak<ComputedContainer>>,
    registry: Weak<ContainerRegistry>,
    queue: Arc<BuildQueue>,

    children: Arc<RwLock<ChildMap>>,
    busy: Arc<BusyTable>,
    store: ChildStore,
    progress: LoadProgress,

    reconciler: Arc<dyn Reconciler>,
    orphan_strategy: Arc<dyn OrphanStrategy>,
    triggers: Vec<PeriodicTrigger>,

    disabled: AtomicBool,
    deleted: AtomicBool,
    moving: AtomicBool,

    current: StdRwLock<Option<Arc<Computation>>>,
    last_computation_ms: AtomicI64,
    durations: Mutex<VecDeque<i64>>,
    running: Arc<AtomicUsize>,

    event_writer: AsyncMutex<Option<Arc<EventLogWriter>>>,
    health_registry: Arc<HealthMetricRegistry>,
    health_cache: Mutex<Option<(HealthReport, tokio::time::Instant)>>,
}

impl std::fmt::Debug for ComputedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedContainer")
            .field("full_name", &self.full_name)
            .field("disabled", &self.is_disabled())
            .finish_non_exhaustive()
    }
}

impl ComputedContainer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: ContainerSettings,
        reconciler: Arc<dyn Reconciler>,
        loader: Arc<dyn ChildLoader>,
        queue: Arc<BuildQueue>,
        running: Arc<AtomicUsize>,
        health_registry: Arc<HealthMetricRegistry>,
        registry: Weak<ContainerRegistry>,
        parent: Option<Weak<ComputedContainer>>,
    ) -> Arc<Self> {
        let store = ChildStore::new(settings.mangler.clone(), loader);
        let triggers = settings
            .triggers
            .into_iter()
            .map(PeriodicTrigger::new)
            .collect();
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            full_name: settings.full_name,
            root_dir: settings.root_dir,
            config: settings.config,
            parent,
            registry,
            queue,
            children: Arc::new(RwLock::new(ChildMap::new())),
            busy: Arc::new(BusyTable::default()),
            store,
            progress: LoadProgress::default(),
            reconciler,
            orphan_strategy: settings.orphan_strategy,
            triggers,
            disabled: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            moving: AtomicBool::new(false),
            current: StdRwLock::new(None),
            last_computation_ms: AtomicI64::new(0),
            durations: Mutex::new(VecDeque::new()),
            running,
            event_writer: AsyncMutex::new(None),
            health_registry,
            health_cache: Mutex::new(None),
        })
    }

    pub fn full_name(&self) -> &FullName {
        &self.full_name
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn parent(&self) -> Option<Arc<ComputedContainer>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn triggers(&self) -> &[PeriodicTrigger] {
        &self.triggers
    }

    pub fn load_progress(&self) -> &LoadProgress {
        &self.progress
    }

    /// Cold start: restore the last computation record and load the
    /// children from disk. The fresh child map is installed in a
    /// single swap so concurrent readers only ever see a complete map.
    pub async fn load(&self) -> Result<()> {
        if let Ok(raw) = fs::read(layout::computation_record(&self.root_dir)).await
            && let Ok(record) = serde_json::from_slice::<arbor_model::ComputationRecord>(&raw)
        {
            self.last_computation_ms
                .store(record.timestamp_ms, Ordering::Release);
            let mut durations = self.durations.lock().expect("durations lock");
            durations.extend(record.durations_ms.iter().copied());
            while durations.len() > DURATION_HISTORY_LEN {
                durations.pop_front();
            }
        }

        let map = self
            .store
            .load(&self.full_name, &self.root_dir, &self.progress)
            .await;
        *self.children.write().await = map;
        Ok(())
    }

    /// Snapshot of the current child map.
    pub async fn children(&self) -> ChildMap {
        self.children.read().await.clone()
    }

    pub async fn child(&self, name: &ChildName) -> Option<Arc<dyn ChildItem>> {
        self.children.read().await.get(name).cloned()
    }

    // ---------------------------------------------------------------
    // Scheduling surface
    // ---------------------------------------------------------------

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Disabling is shallow: children are untouched, but the queue
    /// gate refuses to schedule anything below a disabled container.
    pub fn make_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
        info!(
            "{} is now {}",
            self.full_name,
            if disabled { "disabled" } else { "enabled" }
        );
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Whether a computation is currently in flight.
    pub fn is_building(&self) -> bool {
        self.computation()
            .map(|computation| computation.result().is_none())
            .unwrap_or(false)
    }

    /// Advisory buildability check; the queue gate is authoritative.
    pub fn is_buildable(&self) -> bool {
        !self.is_disabled() && !self.is_deleted() && gate::should_schedule(self)
    }

    /// Inserts a computation into the queue. Returns false when the
    /// container is currently non-buildable: disabled (directly or via
    /// an ancestor), mid-delete, or already running.
    pub fn schedule_build(&self, delay: Duration, cause: Cause) -> bool {
        if !self.is_buildable() || self.is_building() {
            return false;
        }
        self.queue.enqueue(
            self.self_weak.clone(),
            self.full_name.clone(),
            delay,
            vec![cause],
        )
    }

    /// Called by the queue when this container's item dispatches.
    /// The returned computation becomes the current one; the previous
    /// one's result is carried over for UI continuity.
    pub fn create_executable(&self, causes: Vec<Cause>) -> Arc<Computation> {
        let previous = self.computation().and_then(|c| c.result());
        let computation = Arc::new(Computation::new(self.self_weak.clone(), causes, previous));
        *self.current.write().expect("current lock") = Some(computation.clone());
        self.last_computation_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        computation
    }

    /// Latest computation; possibly still running.
    pub fn computation(&self) -> Option<Arc<Computation>> {
        self.current.read().expect("current lock").clone()
    }

    /// Start of the most recent computation, milliseconds since the
    /// epoch; 0 when the container has never computed.
    pub fn last_computation_ms(&self) -> i64 {
        self.last_computation_ms.load(Ordering::Acquire)
    }

    pub(crate) fn running_guard(&self) -> RunningGuard {
        self.running.fetch_add(1, Ordering::AcqRel);
        RunningGuard {
            gauge: self.running.clone(),
        }
    }

    pub(crate) fn run_finished(&self) {
        self.queue.poke();
    }

    /// Appends a run duration to the rolling history and returns the
    /// history snapshot, oldest first.
    pub(crate) fn push_duration(&self, duration_ms: i64) -> Vec<i64> {
        let mut durations = self.durations.lock().expect("durations lock");
        durations.push_back(duration_ms);
        while durations.len() > DURATION_HISTORY_LEN {
            durations.pop_front();
        }
        durations.iter().copied().collect()
    }

    /// Mean of the rolling duration history; -1 with no history.
    pub fn estimated_duration_ms(&self) -> i64 {
        let durations = self.durations.lock().expect("durations lock");
        if durations.is_empty() {
            return -1;
        }
        durations.iter().sum::<i64>() / durations.len() as i64
    }

    // ---------------------------------------------------------------
    // Reconciliation
    // ---------------------------------------------------------------

    /// One reconciliation pass, driven by the owning computation.
    pub(crate) async fn update_children(
        &self,
        listener: &ComputationListener,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ContainerError::Cancelled(
                "computation interrupted before start".to_string(),
            ));
        }

        let snapshot = self.children.read().await.clone();
        let observer = ChildObserver::for_reconciliation(
            self.children.clone(),
            self.busy.clone(),
            snapshot,
            cancel.clone(),
        );

        let outcome = self.reconcile(&observer, listener).await;
        observer.close();
        outcome
    }

    async fn reconcile(
        &self,
        observer: &ChildObserver,
        listener: &ComputationListener,
    ) -> Result<()> {
        self.reconciler.compute_children(observer, listener).await?;

        // Children committed during the pass get their from-scratch
        // lifecycle call and are persisted before anything else can
        // trip over them.
        for (name, child) in observer.take_created() {
            child.on_created_from_scratch().await?;
            self.store
                .persist_child(&self.root_dir, &name, &child)
                .await?;
            listener.log(format!("Created {name}"));
        }

        // Existing children the pass handed replacements for are
        // merged in place; identity is preserved, the replacement only
        // feeds the merge.
        for (name, replacement) in observer.take_updated() {
            let existing = self.children.read().await.get(&name).cloned();
            if let Some(existing) = existing {
                self.reconciler.update_existing(&existing, replacement).await?;
                self.store
                    .persist_child(&self.root_dir, &name, &existing)
                    .await?;
                listener.log(format!("Updated {name}"));
            }
        }

        // Whatever was not re-observed is an orphan; the strategy
        // decides which of those to drop.
        let orphans = observer.orphaned();
        if !orphans.is_empty() {
            let doomed = self
                .orphan_strategy
                .orphaned_items(&self.full_name, &orphans, listener)
                .await;
            for name in doomed {
                if let Some(child) = orphans.get(&name) {
                    self.delete_child(&name, child).await;
                }
            }
        }
        Ok(())
    }

    /// Opens an observer for out-of-band event handlers. Its orphan
    /// set is always empty; it only mediates per-name exclusivity.
    pub fn open_events_child_observer(&self) -> ChildObserver {
        ChildObserver::for_events(
            self.children.clone(),
            self.busy.clone(),
            CancellationToken::new(),
        )
    }

    async fn delete_child(&self, name: &ChildName, child: &Arc<dyn ChildItem>) {
        self.children.write().await.remove(name);
        let dir_name = self
            .store
            .mangler()
            .dir_name(child.as_ref())
            .unwrap_or_else(|| self.store.mangler().mangle(name.as_str()));
        let dir = layout::jobs_dir(&self.root_dir).join(dir_name);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("removed orphaned child {} at {}", name, dir.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove {}: {}", dir.display(), err),
        }
    }

    /// Persists a child created outside a computation (e.g. by an
    /// event handler that already committed it via the observer).
    pub async fn persist_child(&self, name: &ChildName, child: &Arc<dyn ChildItem>) -> Result<()> {
        self.store.persist_child(&self.root_dir, name, child).await
    }

    // ---------------------------------------------------------------
    // Child lifecycle notifications
    // ---------------------------------------------------------------

    /// Removes a child from the map. No cascade.
    pub async fn on_deleted(&self, name: &ChildName) {
        self.children.write().await.remove(name);
    }

    /// Computed children cannot be renamed in place; their names are
    /// authoritative-computed.
    pub fn on_renamed(&self, _old_name: &ChildName, _new_name: &ChildName) -> Result<()> {
        Err(ContainerError::Unsupported(format!(
            "children of {} are computed and cannot be renamed",
            self.full_name
        )))
    }

    // ---------------------------------------------------------------
    // Deletion cascade
    // ---------------------------------------------------------------

    /// Deletes this container and every descendant. Pending queue
    /// items are swept first, running builds are interrupted and given
    /// a grace window to abort, then the subtree is removed
    /// depth-first from registry and disk.
    pub async fn delete(&self) -> Result<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("deleting {} and all descendants", self.full_name);
        self.queue.cancel_subtree(&self.full_name);

        let subtree = match self.registry.upgrade() {
            Some(registry) => registry.subtree(&self.full_name),
            None => self.self_weak.upgrade().into_iter().collect(),
        };
        for container in &subtree {
            container.deleted.store(true, Ordering::Release);
        }

        // Interrupt anything still running, tagged with the cascade
        // cause so the interrupted jobs know who pulled the plug.
        let mut interrupted = Vec::new();
        for container in &subtree {
            if let Some(computation) = container.computation()
                && computation.result().is_none()
            {
                computation.interrupt(Some(Cause::OrphanedParent {
                    full_name: self.full_name.to_string(),
                }));
                interrupted.push(computation);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.delete_grace;
        while !interrupted.iter().all(|c| c.result().is_some()) {
            if tokio::time::Instant::now() >= deadline {
                return Err(ContainerError::User(format!(
                    "failed to stop builds of {}",
                    self.full_name
                )));
            }
            tokio::time::sleep(self.config.delete_poll_interval).await;
        }

        // Depth-first: registry entries go before their parents so a
        // half-finished cascade never leaves a dangling child behind.
        if let Some(registry) = self.registry.upgrade() {
            for container in subtree.iter().rev() {
                container.close_event_log().await;
                registry.remove(container.full_name());
            }
        } else {
            self.close_event_log().await;
        }

        match fs::remove_dir_all(&self.root_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = self.parent() {
            parent
                .on_deleted(&ChildName::new(self.full_name.simple_name()))
                .await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Event log
    // ---------------------------------------------------------------

    /// Lazily created writer for the out-of-band event stream. The
    /// target path is re-resolved on every flush, so the container may
    /// move on disk without the writer being reopened.
    pub async fn event_log(&self) -> Arc<EventLogWriter> {
        let mut guard = self.event_writer.lock().await;
        if let Some(writer) = guard.as_ref() {
            return writer.clone();
        }
        let weak = self.self_weak.clone();
        let supplier: Arc<dyn LogFileSupplier> = Arc::new(move || {
            let container = weak.upgrade()?;
            if container.moving.load(Ordering::Acquire) || container.is_deleted() {
                return None;
            }
            Some(layout::events_log(&container.root_dir))
        });
        let writer = Arc::new(EventLogWriter::new(
            supplier,
            EventLogConfig {
                rotate_size: self.config.event_log_max_size_kb * 1024,
                file_count: self.config.event_log_file_count,
                ..EventLogConfig::default()
            },
        ));
        *guard = Some(writer.clone());
        writer
    }

    async fn close_event_log(&self) {
        let writer = self.event_writer.lock().await.take();
        if let Some(writer) = writer {
            writer.close().await;
        }
    }

    pub(crate) async fn event_log_if_open(&self) -> Option<Arc<EventLogWriter>> {
        self.event_writer.lock().await.clone()
    }

    /// Marks the container as mid-move; event log flushes are deferred
    /// until the move finishes.
    pub fn set_moving(&self, moving: bool) {
        self.moving.store(moving, Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Health
    // ---------------------------------------------------------------

    /// Cached build-health report. Refreshes lazily once the jittered
    /// cache window elapses.
    pub async fn health_report(&self) -> HealthReport {
        {
            let cache = self.health_cache.lock().expect("health lock");
            if let Some((report, valid_until)) = cache.as_ref()
                && tokio::time::Instant::now() < *valid_until
            {
                return report.clone();
            }
        }
        let report = self.health_registry.assess(self).await;
        let valid_until = tokio::time::Instant::now()
            + crate::health::jittered_refresh(Duration::from_secs(
                u64::from(self.config.health_report_cache_min) * 60,
            ));
        *self.health_cache.lock().expect("health lock") = Some((report.clone(), valid_until));
        report
    }
}

/// Increments the global running gauge for the lifetime of a run.
pub(crate) struct RunningGuard {
    gauge: Arc<AtomicUsize>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::AcqRel);
    }
}
