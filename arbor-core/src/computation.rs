//! One end-to-end reconciliation run.

use std::io::Read;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use futures::FutureExt;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use arbor_model::{Cause, ComputationRecord, ComputationResult};

use crate::container::ComputedContainer;
use crate::error::Result;
use crate::layout;
use crate::listener::ComputationListener;

/// A single computation: a scheduled, cancellable, logged
/// reconciliation run, and afterwards the persistent record of it.
///
/// Mutated only by the executor task that owns the run; everything
/// readers can see (`result`, `duration`) is published atomically.
pub struct Computation {
    id: Uuid,
    owner: Weak<ComputedContainer>,
    causes: Mutex<Vec<Cause>>,
    previous_result: Option<ComputationResult>,
    timestamp_ms: AtomicI64,
    duration_ms: AtomicI64,
    result: RwLock<Option<ComputationResult>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Computation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computation")
            .field("id", &self.id)
            .field("result", &self.result())
            .finish()
    }
}

impl Computation {
    pub(crate) fn new(
        owner: Weak<ComputedContainer>,
        causes: Vec<Cause>,
        previous_result: Option<ComputationResult>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner,
            causes: Mutex::new(causes),
            previous_result,
            timestamp_ms: AtomicI64::new(0),
            duration_ms: AtomicI64::new(0),
            result: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn causes(&self) -> Vec<Cause> {
        self.causes.lock().expect("causes lock").clone()
    }

    /// Result of the previous computation, kept for UI continuity
    /// while this one runs.
    pub fn previous_result(&self) -> Option<ComputationResult> {
        self.previous_result
    }

    /// Terminal result; `None` while the run is in flight.
    pub fn result(&self) -> Option<ComputationResult> {
        *self.result.read().expect("result lock")
    }

    /// Canonical liveness signal: the log keeps growing exactly while
    /// no terminal result has been published.
    pub fn is_log_updated(&self) -> bool {
        self.result().is_none()
    }

    /// Start of the run, milliseconds since the epoch; 0 before start.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms.load(Ordering::Acquire)
    }

    /// Wall-clock duration; positive exactly once a terminal result
    /// exists.
    pub fn duration_ms(&self) -> i64 {
        self.duration_ms.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation; the run terminates as `ABORTED`. An
    /// optional cause (e.g. the deletion cascade) is recorded.
    pub fn interrupt(&self, cause: Option<Cause>) {
        if let Some(cause) = cause {
            self.causes.lock().expect("causes lock").push(cause);
        }
        self.cancel.cancel();
    }

    /// Executes the run to its terminal state. Consumes the executor
    /// task; every exit path closes the listener before the result
    /// becomes visible.
    pub async fn run(self: Arc<Self>) {
        let Some(container) = self.owner.upgrade() else {
            return;
        };
        let _running = container.running_guard();

        let log_path = layout::computation_log(container.root_dir());
        let listener =
            match ComputationListener::open(&log_path, container.config().backup_log_count) {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(
                        "cannot open computation log for {}: {}",
                        container.full_name(),
                        err
                    );
                    return;
                }
            };

        let started = Utc::now().timestamp_millis();
        self.timestamp_ms.store(started, Ordering::Release);
        for cause in self.causes() {
            listener.log(cause.to_string());
        }

        let outcome = AssertUnwindSafe(container.update_children(&listener, &self.cancel))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(())) => ComputationResult::Success,
            Ok(Err(err)) if err.is_cancelled() => {
                listener.log("Aborted");
                ComputationResult::Aborted
            }
            Ok(Err(err)) => {
                listener.error(err.to_string());
                ComputationResult::Failure
            }
            Err(panic) => {
                listener.error(format!("unexpected failure: {}", panic_message(&panic)));
                ComputationResult::Failure
            }
        };

        let duration = (Utc::now().timestamp_millis() - started).max(1);
        self.duration_ms.store(duration, Ordering::Release);
        let durations = container.push_duration(duration);

        // The listener closes first; only then does the terminal
        // result become observable, so a set result implies a sealed
        // log.
        listener.close();
        *self.result.write().expect("result lock") = Some(result);
        debug!("{} computation finished: {}", container.full_name(), result);

        // A container mid-delete must not get its directories written
        // back behind the cascade's broom.
        if !container.is_deleted()
            && let Err(err) = self.persist(container.root_dir(), durations).await
        {
            warn!(
                "failed to persist computation record for {}: {}",
                container.full_name(),
                err
            );
        }
        container.run_finished();
    }

    /// Writes the computation record, whole-file-then-rename so
    /// readers never observe a torn record.
    async fn persist(&self, root_dir: &Path, durations_ms: Vec<i64>) -> Result<()> {
        let record = ComputationRecord {
            id: self.id,
            timestamp_ms: self.timestamp_ms(),
            duration_ms: self.duration_ms(),
            result: self.result(),
            causes: self.causes(),
            durations_ms,
        };
        let target = layout::computation_record(root_dir);
        if let Some(parent) = target.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await?;
        }
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?).await?;
        fs::rename(&tmp, &target).await?;
        Ok(())
    }

    /// Progressive text of the run log. Absent files yield a literal
    /// placeholder rather than an error.
    pub async fn log_text(&self) -> String {
        match self.owner.upgrade() {
            Some(container) => read_log(&layout::computation_log(container.root_dir())).await,
            None => String::new(),
        }
    }
}

/// Reads a run log, transparently decompressing when the file name
/// ends in `.gz`. An absent file yields `"No such file: <name>"`,
/// which callers serve as an ordinary placeholder.
pub async fn read_log(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return format!("No such file: {name}");
        }
        Err(err) => {
            warn!("cannot read log {}: {}", path.display(), err);
            return format!("No such file: {name}");
        }
    };
    if name.ends_with(".gz") {
        let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
        let mut text = String::new();
        match decoder.read_to_string(&mut text) {
            Ok(_) => text,
            Err(err) => {
                warn!("cannot decompress log {}: {}", path.display(), err);
                String::new()
            }
        }
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic of unknown type".to_string()
    }
}
