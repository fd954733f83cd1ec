//! Persistence of container children on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info, warn};

use arbor_model::{ChildName, FullName};

use crate::error::Result;
use crate::host::{ChildItem, ChildLoader};
use crate::layout;
use crate::naming::{self, NameMangler};

/// Ordered child map keyed by case-insensitive business name.
pub type ChildMap = BTreeMap<ChildName, Arc<dyn ChildItem>>;

/// Monotone load-progress counters. Totals may over-report after a
/// reload; consumers only rely on the counters never decreasing within
/// one load.
#[derive(Debug, Default)]
pub struct LoadProgress {
    jobs_total: AtomicUsize,
    jobs_encountered: AtomicUsize,
}

impl LoadProgress {
    pub fn jobs_total(&self) -> usize {
        self.jobs_total.load(Ordering::Relaxed)
    }

    pub fn jobs_encountered(&self) -> usize {
        self.jobs_encountered.load(Ordering::Relaxed)
    }

    fn add_total(&self, n: usize) {
        self.jobs_total.fetch_add(n, Ordering::Relaxed);
    }

    fn encountered_one(&self) {
        self.jobs_encountered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Loads and persists the children of one container.
pub struct ChildStore {
    mangler: Arc<dyn NameMangler>,
    loader: Arc<dyn ChildLoader>,
}

impl std::fmt::Debug for ChildStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildStore").finish_non_exhaustive()
    }
}

impl ChildStore {
    pub fn new(mangler: Arc<dyn NameMangler>, loader: Arc<dyn ChildLoader>) -> Self {
        Self { mangler, loader }
    }

    pub fn mangler(&self) -> &Arc<dyn NameMangler> {
        &self.mangler
    }

    /// Loads every child found under `<root>/jobs/`. One broken child
    /// never aborts the whole load; it is skipped with a warning. The
    /// returned map is installed by the caller in a single swap.
    pub async fn load(
        &self,
        container: &FullName,
        root_dir: &Path,
        progress: &LoadProgress,
    ) -> ChildMap {
        let mut map = ChildMap::new();
        let jobs = layout::jobs_dir(root_dir);
        let mut entries = match fs::read_dir(&jobs).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return map,
            Err(err) => {
                warn!("failed to list {}: {}", jobs.display(), err);
                return map;
            }
        };

        let mut candidates = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.is_dir() && path.join(layout::CONFIG_FILE).exists() {
                        candidates.push(path);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("failed to read entry under {}: {}", jobs.display(), err);
                    break;
                }
            }
        }
        progress.add_total(candidates.len());

        for dir in candidates {
            match self.load_one(container, &dir).await {
                Ok(Some((name, child))) => {
                    if map.contains_key(&name) {
                        warn!(
                            "duplicate child name {:?} under {}; keeping the first",
                            name.as_str(),
                            container
                        );
                    } else {
                        map.insert(name, child);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("skipping child at {}: {}", dir.display(), err);
                }
            }
            progress.encountered_one();
        }

        info!("loaded {} children under {}", map.len(), container);
        map
    }

    /// Loads a single child directory. `Ok(None)` means the child was
    /// deliberately skipped (relocation collision).
    async fn load_one(
        &self,
        container: &FullName,
        dir: &Path,
    ) -> Result<Option<(ChildName, Arc<dyn ChildItem>)>> {
        let current_dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let sidecar_name = naming::read_name_file(dir).await?;
        let child = self.loader.load(dir).await?;

        // Preferred source is the child's own configuration, then the
        // sidecar, then legacy inference from the directory name.
        let mut legacy = false;
        let business_name = match self.mangler.item_name(child.as_ref()).or(sidecar_name) {
            Some(name) => name,
            None => {
                legacy = true;
                self.mangler.item_name_from_legacy(&current_dir_name)
            }
        };

        let intended_dir_name = self.mangler.mangle(&business_name);
        let mut final_dir = dir.to_path_buf();
        if intended_dir_name != current_dir_name {
            let target = dir.with_file_name(&intended_dir_name);
            if target.exists() {
                // Collision: leave both sides untouched.
                warn!(
                    "cannot relocate {} to {}: target exists; skipping child",
                    dir.display(),
                    target.display()
                );
                return Ok(None);
            }
            fs::rename(dir, &target).await?;
            debug!("relocated {} -> {}", dir.display(), target.display());
            final_dir = target;
        }

        let name = ChildName::new(business_name.clone());
        if legacy {
            // Upgrade path: attach the inferred names, record the
            // sidecar, and save the now-dirty child.
            self.mangler
                .record_legacy_name(child.as_ref(), &current_dir_name);
            naming::write_name_file(&final_dir, &business_name).await?;
            child.save(&final_dir).await?;
        }
        child.on_load(container, &name).await?;

        Ok(Some((name, child)))
    }

    /// Writes the name sidecar (when changed) for `child` and hands
    /// back the map entry for the caller to install.
    pub async fn persist_child(
        &self,
        root_dir: &Path,
        name: &ChildName,
        child: &Arc<dyn ChildItem>,
    ) -> Result<()> {
        let dir = self.child_root_dir(root_dir, name, child.as_ref()).await?;
        naming::write_name_file(&dir, name.as_str()).await?;
        child.save(&dir).await?;
        Ok(())
    }

    /// Composes `<root>/jobs/<dirName>`, creating it lazily.
    pub async fn child_root_dir(
        &self,
        root_dir: &Path,
        name: &ChildName,
        child: &dyn ChildItem,
    ) -> Result<PathBuf> {
        let dir_name = self
            .mangler
            .dir_name(child)
            .unwrap_or_else(|| self.mangler.mangle(name.as_str()));
        let dir = layout::jobs_dir(root_dir).join(dir_name);
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
        }
        Ok(dir)
    }
}
