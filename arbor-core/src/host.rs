//! Capability traits through which the host platform plugs into the
//! runtime.
//!
//! The runtime never references concrete host types. Children, their
//! construction, and the per-container reconciliation behaviour all
//! arrive as trait objects injected at container creation.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use arbor_model::{ChildName, FullName};

use crate::error::Result;
use crate::listener::ComputationListener;
use crate::observe::ChildObserver;

/// A child of a computed container, owned by the host platform.
///
/// The runtime sees only what it needs for naming, persistence, and
/// retention decisions; the state blob behind each item is opaque.
#[async_trait]
pub trait ChildItem: Send + Sync + Any {
    /// Stable business name recorded on the item, if any.
    fn stored_business_name(&self) -> Option<String>;

    /// Mangled directory name recorded on the item, if any.
    fn stored_dir_name(&self) -> Option<String>;

    /// Attach names inferred during a legacy load without persisting
    /// the item; the caller holds a bulk-change guard for the duration.
    fn record_names(&self, business_name: &str, dir_name: &str);

    /// Invoked after the item has been constructed from disk and
    /// attached to `parent` under `name`.
    async fn on_load(&self, parent: &FullName, name: &ChildName) -> Result<()>;

    /// Invoked exactly once for items created by a reconciliation
    /// rather than loaded from disk.
    async fn on_created_from_scratch(&self) -> Result<()>;

    /// Persist the item's own configuration into `dir`.
    async fn save(&self, dir: &Path) -> Result<()>;

    /// Whether the host currently has a build of this item in flight.
    fn is_building(&self) -> bool;

    /// Completion time of the item's newest build; `None` when the
    /// item is not runnable or has never built.
    fn last_build_time(&self) -> Option<DateTime<Utc>>;

    /// Whether any build of this item is pinned against deletion.
    fn has_pinned_build(&self) -> bool;

    /// Outcome of the item's newest completed build, when the host
    /// tracks one. Feeds the container health report.
    fn last_build_result(&self) -> Option<arbor_model::ComputationResult> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Constructs children from their on-disk directories during a cold
/// load. The directory is guaranteed to contain the child
/// configuration file when this is called.
#[async_trait]
pub trait ChildLoader: Send + Sync {
    async fn load(&self, dir: &Path) -> Result<Arc<dyn ChildItem>>;
}

/// Per-container reconciliation behaviour supplied by concrete
/// computed container types.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Compute the desired set of children, mediating every child
    /// interaction through `observer`.
    async fn compute_children(
        &self,
        observer: &ChildObserver,
        listener: &ComputationListener,
    ) -> Result<()>;

    /// Merge a freshly computed replacement into an existing child.
    /// The reconciliation driver calls this for every replacement the
    /// observer recorded; the default keeps the existing item
    /// untouched.
    async fn update_existing(
        &self,
        _existing: &Arc<dyn ChildItem>,
        _replacement: Arc<dyn ChildItem>,
    ) -> Result<()> {
        Ok(())
    }
}
