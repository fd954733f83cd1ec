//! Retention of children dropped by a recomputation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use arbor_model::{ChildName, FullName, OrphanPolicy};

use crate::listener::ComputationListener;
use crate::store::ChildMap;

/// Decides which orphaned children to delete at the end of a run.
/// Returns the subset of names to delete; the caller applies the
/// deletions under a service-level identity.
#[async_trait]
pub trait OrphanStrategy: Send + Sync {
    async fn orphaned_items(
        &self,
        owner: &FullName,
        orphans: &ChildMap,
        listener: &ComputationListener,
    ) -> Vec<ChildName>;
}

/// Keeps everything; the fallback when no policy is configured.
#[derive(Debug, Default)]
pub struct KeepAllStrategy;

#[async_trait]
impl OrphanStrategy for KeepAllStrategy {
    async fn orphaned_items(
        &self,
        _owner: &FullName,
        _orphans: &ChildMap,
        _listener: &ComputationListener,
    ) -> Vec<ChildName> {
        Vec::new()
    }
}

/// Default strategy: keep the `num_to_keep` newest by last build time,
/// plus anything built within `days_to_keep` days.
#[derive(Debug)]
pub struct DefaultOrphanStrategy {
    policy: OrphanPolicy,
}

impl DefaultOrphanStrategy {
    pub fn new(policy: OrphanPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl OrphanStrategy for DefaultOrphanStrategy {
    async fn orphaned_items(
        &self,
        owner: &FullName,
        orphans: &ChildMap,
        listener: &ComputationListener,
    ) -> Vec<ChildName> {
        if self.policy.keeps_everything() {
            return Vec::new();
        }

        // Children whose newest build is in flight or pinned are never
        // candidates, whatever the bounds say.
        let mut candidates: Vec<(&ChildName, DateTime<Utc>)> = Vec::new();
        for (name, child) in orphans {
            if child.is_building() {
                listener.log(format!(
                    "Will not remove {} from {} because it is currently building",
                    name, owner
                ));
                continue;
            }
            if child.has_pinned_build() {
                listener.log(format!(
                    "Will not remove {} from {} because it has a pinned build",
                    name, owner
                ));
                continue;
            }
            let last_build = child
                .last_build_time()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            candidates.push((name, last_build));
        }

        // Newest first; the sort is stable so equal timestamps keep
        // their map order.
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut doomed: BTreeSet<ChildName> = BTreeSet::new();
        if self.policy.num_to_keep >= 0 {
            for (name, _) in candidates.iter().skip(self.policy.num_to_keep as usize) {
                doomed.insert((*name).clone());
            }
        }
        if self.policy.days_to_keep >= 0 {
            let cutoff = Utc::now() - ChronoDuration::days(self.policy.days_to_keep as i64);
            for (name, last_build) in &candidates {
                if *last_build < cutoff {
                    doomed.insert((*name).clone());
                }
            }
        }
        for name in &doomed {
            listener.log(format!("Will remove {name} from {owner}"));
        }
        doomed.into_iter().collect()
    }
}

/// Explicit strategy registry injected at container creation.
#[derive(Clone)]
pub struct OrphanStrategyRegistry {
    strategies: HashMap<String, Arc<dyn OrphanStrategy>>,
}

impl std::fmt::Debug for OrphanStrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanStrategyRegistry")
            .field("ids", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OrphanStrategyRegistry {
    pub const DEFAULT: &'static str = "default";
    pub const KEEP_ALL: &'static str = "keep-all";

    pub fn register(&mut self, id: impl Into<String>, strategy: Arc<dyn OrphanStrategy>) {
        self.strategies.insert(id.into(), strategy);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn OrphanStrategy>> {
        self.strategies.get(id).cloned()
    }

    pub fn keep_all(&self) -> Arc<dyn OrphanStrategy> {
        self.strategies[Self::KEEP_ALL].clone()
    }
}

impl Default for OrphanStrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(Self::KEEP_ALL, Arc::new(KeepAllStrategy));
        registry.register(
            Self::DEFAULT,
            Arc::new(DefaultOrphanStrategy::new(OrphanPolicy::default())),
        );
        registry
    }
}
