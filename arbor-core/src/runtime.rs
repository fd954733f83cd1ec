//! Process-wide runtime wiring: configuration, throttle, queue, cron,
//! and the container registry, constructed once at service start and
//! injected into containers at creation. No ambient lookup.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, Weak};

use tokio::fs;
use tracing::info;

use arbor_model::{Cause, FullName};

use crate::config::RuntimeConfig;
use crate::container::{ComputedContainer, ContainerSettings};
use crate::cron::Cron;
use crate::error::{ContainerError, Result};
use crate::health::HealthMetricRegistry;
use crate::host::{ChildLoader, Reconciler};
use crate::naming::ManglerRegistry;
use crate::orphan::OrphanStrategyRegistry;
use crate::queue::BuildQueue;
use crate::throttle::GlobalThrottle;

/// All live computed containers, keyed by full name.
pub struct ContainerRegistry {
    containers: Mutex<BTreeMap<String, Arc<ComputedContainer>>>,
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("count", &self.containers.lock().expect("registry lock").len())
            .finish()
    }
}

impl ContainerRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn insert(&self, container: Arc<ComputedContainer>) {
        self.containers
            .lock()
            .expect("registry lock")
            .insert(container.full_name().to_string(), container);
    }

    pub(crate) fn remove(&self, name: &FullName) {
        self.containers
            .lock()
            .expect("registry lock")
            .remove(name.as_str());
    }

    pub fn get(&self, name: &FullName) -> Option<Arc<ComputedContainer>> {
        self.containers
            .lock()
            .expect("registry lock")
            .get(name.as_str())
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ComputedContainer>> {
        self.containers
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }

    /// `name` and every registered descendant, parents before
    /// children (the BTreeMap's lexicographic order guarantees it).
    pub(crate) fn subtree(&self, name: &FullName) -> Vec<Arc<ComputedContainer>> {
        let prefix = format!("{}/", name.as_str());
        self.containers
            .lock()
            .expect("registry lock")
            .iter()
            .filter(|(key, _)| *key == name.as_str() || key.starts_with(&prefix))
            .map(|(_, container)| container.clone())
            .collect()
    }
}

/// Owner of every process-wide collaborator. Built once at service
/// start; containers receive their dependencies from here.
pub struct ArborRuntime {
    config: RuntimeConfig,
    running: Arc<AtomicUsize>,
    throttle: Arc<GlobalThrottle>,
    queue: Arc<BuildQueue>,
    registry: Arc<ContainerRegistry>,
    manglers: Mutex<ManglerRegistry>,
    orphan_strategies: Mutex<OrphanStrategyRegistry>,
    health_metrics: Arc<HealthMetricRegistry>,
    cron: Mutex<Option<Cron>>,
}

impl std::fmt::Debug for ArborRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArborRuntime")
            .field("registry", &self.registry)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl ArborRuntime {
    /// Brings up the throttle, queue, and cron. Must be called within
    /// a tokio runtime.
    pub fn start(config: RuntimeConfig) -> Arc<Self> {
        let running = Arc::new(AtomicUsize::new(0));
        let throttle = Arc::new(GlobalThrottle::new(config.throttle_limit, running.clone()));
        let queue = BuildQueue::start(throttle.clone());
        let registry = ContainerRegistry::new();
        let cron = Cron::start(registry.clone());
        info!(
            "runtime started (throttle limit {})",
            throttle.limit()
        );
        Arc::new(Self {
            config,
            running,
            throttle,
            queue,
            registry,
            manglers: Mutex::new(ManglerRegistry::default()),
            orphan_strategies: Mutex::new(OrphanStrategyRegistry::default()),
            health_metrics: Arc::new(HealthMetricRegistry::default()),
            cron: Mutex::new(Some(cron)),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn throttle(&self) -> &Arc<GlobalThrottle> {
        &self.throttle
    }

    pub fn queue(&self) -> &Arc<BuildQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn health_metrics(&self) -> &Arc<HealthMetricRegistry> {
        &self.health_metrics
    }

    pub fn manglers(&self) -> ManglerRegistry {
        self.manglers.lock().expect("manglers lock").clone()
    }

    pub fn orphan_strategies(&self) -> OrphanStrategyRegistry {
        self.orphan_strategies.lock().expect("strategies lock").clone()
    }

    pub fn register_mangler(
        &self,
        id: impl Into<String>,
        mangler: Arc<dyn crate::naming::NameMangler>,
    ) {
        self.manglers.lock().expect("manglers lock").register(id, mangler);
    }

    pub fn register_orphan_strategy(
        &self,
        id: impl Into<String>,
        strategy: Arc<dyn crate::orphan::OrphanStrategy>,
    ) {
        self.orphan_strategies
            .lock()
            .expect("strategies lock")
            .register(id, strategy);
    }

    /// Creates a computed container, loads its on-disk state, and
    /// registers it. The first computation is scheduled immediately
    /// for containers carrying periodic triggers; afterwards the cron
    /// takes over.
    pub async fn create_container(
        &self,
        settings: ContainerSettings,
        reconciler: Arc<dyn Reconciler>,
        loader: Arc<dyn ChildLoader>,
    ) -> Result<Arc<ComputedContainer>> {
        let full_name = settings.full_name.clone();
        if self.registry.get(&full_name).is_some() {
            return Err(ContainerError::User(format!(
                "a container named {full_name} already exists"
            )));
        }
        let parent = full_name
            .parent()
            .and_then(|parent_name| self.registry.get(&parent_name))
            .map(|parent| Arc::downgrade(&parent));

        fs::create_dir_all(&settings.root_dir).await?;
        let has_triggers = !settings.triggers.is_empty();
        let container = ComputedContainer::new(
            settings,
            reconciler,
            loader,
            self.queue.clone(),
            self.running.clone(),
            self.health_metrics.clone(),
            Arc::downgrade(&self.registry),
            parent,
        );
        container.load().await?;
        self.registry.insert(container.clone());

        if has_triggers {
            container.schedule_build(self.config.trigger_quiet_period, Cause::Timer);
        }
        Ok(container)
    }

    /// Stops the cron and the queue dispatcher and closes every
    /// container's event log. Pending queue items are discarded.
    pub async fn shutdown(&self) {
        let cron = self.cron.lock().expect("cron lock").take();
        if let Some(cron) = cron {
            cron.stop().await;
        }
        self.queue.stop().await;
        for container in self.registry.snapshot() {
            if let Some(writer) = container.event_log_if_open().await {
                writer.close().await;
            }
        }
        info!("runtime stopped");
    }
}
