//! Shared fixtures for the integration suite: an in-memory child type
//! backed by `config.json`, a loader for it, and a scripted reconciler
//! whose desired child set the tests steer between runs.
#![allow(dead_code)]

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use arbor_core::{
    ChildItem, ChildLoader, ChildObserver, ComputationListener, ComputedContainer,
    ContainerError, DefaultMangler, NameMangler, Reconciler, Result,
};
use arbor_model::{ChildName, ComputationResult, FullName};

#[derive(Serialize, Deserialize, Default)]
struct FakeChildConfig {
    name: Option<String>,
    dir_name: Option<String>,
}

/// Minimal host child: names live in memory, `save` writes them to the
/// child's `config.json`.
pub struct FakeChild {
    business_name: Mutex<Option<String>>,
    dir_name: Mutex<Option<String>>,
    pub building: AtomicBool,
    pub pinned: AtomicBool,
    pub last_build: Mutex<Option<DateTime<Utc>>>,
    pub last_result: Mutex<Option<ComputationResult>>,
    pub saves: AtomicUsize,
    pub loaded: AtomicBool,
    pub created_from_scratch: AtomicBool,
    pub updates: AtomicUsize,
}

impl FakeChild {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            business_name: Mutex::new(None),
            dir_name: Mutex::new(None),
            building: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            last_build: Mutex::new(None),
            last_result: Mutex::new(None),
            saves: AtomicUsize::new(0),
            loaded: AtomicBool::new(false),
            created_from_scratch: AtomicBool::new(false),
            updates: AtomicUsize::new(0),
        })
    }

    /// A freshly computed child carrying its names, the way a real
    /// reconciler would construct one.
    pub fn fresh(business_name: &str) -> Arc<Self> {
        let child = Self::empty();
        *child.business_name.lock().unwrap() = Some(business_name.to_string());
        *child.dir_name.lock().unwrap() = Some(DefaultMangler.mangle(business_name));
        child
    }

    pub fn set_last_build(&self, at: DateTime<Utc>) {
        *self.last_build.lock().unwrap() = Some(at);
    }

    pub fn set_last_result(&self, result: ComputationResult) {
        *self.last_result.lock().unwrap() = Some(result);
    }
}

#[async_trait]
impl ChildItem for FakeChild {
    fn stored_business_name(&self) -> Option<String> {
        self.business_name.lock().unwrap().clone()
    }

    fn stored_dir_name(&self) -> Option<String> {
        self.dir_name.lock().unwrap().clone()
    }

    fn record_names(&self, business_name: &str, dir_name: &str) {
        *self.business_name.lock().unwrap() = Some(business_name.to_string());
        *self.dir_name.lock().unwrap() = Some(dir_name.to_string());
    }

    async fn on_load(&self, _parent: &FullName, _name: &ChildName) -> Result<()> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_created_from_scratch(&self) -> Result<()> {
        self.created_from_scratch.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn save(&self, dir: &Path) -> Result<()> {
        let config = FakeChildConfig {
            name: self.stored_business_name(),
            dir_name: self.stored_dir_name(),
        };
        tokio::fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&config)?).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_building(&self) -> bool {
        self.building.load(Ordering::SeqCst)
    }

    fn last_build_time(&self) -> Option<DateTime<Utc>> {
        *self.last_build.lock().unwrap()
    }

    fn has_pinned_build(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    fn last_build_result(&self) -> Option<ComputationResult> {
        *self.last_result.lock().unwrap()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct FakeLoader;

#[async_trait]
impl ChildLoader for FakeLoader {
    async fn load(&self, dir: &Path) -> Result<Arc<dyn ChildItem>> {
        let raw = tokio::fs::read(dir.join("config.json")).await?;
        let config: FakeChildConfig = serde_json::from_slice(&raw)?;
        let child = FakeChild::empty();
        *child.business_name.lock().unwrap() = config.name;
        *child.dir_name.lock().unwrap() = config.dir_name;
        Ok(child)
    }
}

/// Tracks concurrent reconciliations across containers.
#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyTracker {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Reconciler whose output is a test-controlled list of names. An
/// optional per-name delay stretches runs out for the concurrency and
/// cancellation tests.
pub struct ScriptedReconciler {
    desired: Mutex<Vec<String>>,
    pub step_delay: Duration,
    pub runs: AtomicUsize,
    pub tracker: Option<Arc<ConcurrencyTracker>>,
    pub fail_with: Mutex<Option<String>>,
}

impl ScriptedReconciler {
    pub fn new(desired: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            desired: Mutex::new(desired.iter().map(|s| s.to_string()).collect()),
            step_delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
            tracker: None,
            fail_with: Mutex::new(None),
        })
    }

    pub fn slow(desired: &[&str], step_delay: Duration, tracker: Arc<ConcurrencyTracker>) -> Arc<Self> {
        Arc::new(Self {
            desired: Mutex::new(desired.iter().map(|s| s.to_string()).collect()),
            step_delay,
            runs: AtomicUsize::new(0),
            tracker: Some(tracker),
            fail_with: Mutex::new(None),
        })
    }

    pub fn set_desired(&self, desired: &[&str]) {
        *self.desired.lock().unwrap() = desired.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl Reconciler for ScriptedReconciler {
    async fn compute_children(
        &self,
        observer: &ChildObserver,
        listener: &ComputationListener,
    ) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(tracker) = &self.tracker {
            tracker.enter();
        }
        let outcome = self.drive(observer, listener).await;
        if let Some(tracker) = &self.tracker {
            tracker.exit();
        }
        outcome
    }

    async fn update_existing(
        &self,
        existing: &Arc<dyn ChildItem>,
        replacement: Arc<dyn ChildItem>,
    ) -> Result<()> {
        if let (Some(existing), Some(replacement)) = (
            existing.as_any().downcast_ref::<FakeChild>(),
            replacement.as_any().downcast_ref::<FakeChild>(),
        ) {
            existing.updates.fetch_add(1, Ordering::SeqCst);
            if let Some(result) = *replacement.last_result.lock().unwrap() {
                existing.set_last_result(result);
            }
        }
        Ok(())
    }
}

impl ScriptedReconciler {
    async fn drive(
        &self,
        observer: &ChildObserver,
        listener: &ComputationListener,
    ) -> Result<()> {
        if let Some(message) = self.fail_with.lock().unwrap().take() {
            return Err(ContainerError::Internal(message));
        }
        let desired = self.desired.lock().unwrap().clone();
        for name_str in desired {
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
            let name = ChildName::new(&name_str);
            match observer.should_update(&name).await? {
                Some(_existing) => {
                    observer.updated(FakeChild::fresh(&name_str))?;
                    observer.completed(&name);
                }
                None => {
                    if observer.may_create(&name).await {
                        observer.created(FakeChild::fresh(&name_str)).await?;
                    }
                    observer.completed(&name);
                }
            }
            listener.log(format!("computed child {name_str}"));
        }
        Ok(())
    }
}

/// Polls until the container's latest computation reaches a terminal
/// result.
pub async fn wait_for_result(
    container: &Arc<ComputedContainer>,
    timeout: Duration,
) -> ComputationResult {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(computation) = container.computation()
            && let Some(result) = computation.result()
        {
            return result;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for a computation result of {}",
            container.full_name()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until a computation newer than `previous` reaches a terminal
/// result.
pub async fn wait_for_new_result(
    container: &Arc<ComputedContainer>,
    previous: uuid::Uuid,
    timeout: Duration,
) -> ComputationResult {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(computation) = container.computation()
            && computation.id() != previous
            && let Some(result) = computation.result()
        {
            return result;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for a fresh computation of {}",
            container.full_name()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until the container has a computation in flight.
pub async fn wait_for_running(container: &Arc<ComputedContainer>, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(computation) = container.computation()
            && computation.result().is_none()
            && computation.timestamp_ms() > 0
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} to start computing",
            container.full_name()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
