//! Log sink for one computation run.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::error::Result;

/// Scoped writer for a computation's log file. Acquired when the run
/// starts, closed deterministically on every exit path; the terminal
/// result is only published after the close, so a closed listener is
/// the canonical "log is complete" signal.
pub struct ComputationListener {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl std::fmt::Debug for ComputationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationListener")
            .field("path", &self.path)
            .finish()
    }
}

impl ComputationListener {
    /// Opens the log, rotating existing backups first. A backup count
    /// of zero truncates in place.
    pub fn open(path: &Path, backup_count: usize) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }
        if backup_count > 0 && path.exists() {
            rotate(path, backup_count)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line. Write failures are swallowed; a broken log
    /// sink must never fail the run it is narrating.
    pub fn log(&self, line: impl AsRef<str>) {
        let mut guard = self.file.lock().expect("listener lock");
        if let Some(file) = guard.as_mut()
            && let Err(err) = writeln!(file, "{}", line.as_ref())
        {
            warn!("computation log write failed: {}", err);
        }
    }

    pub fn error(&self, line: impl AsRef<str>) {
        self.log(format!("ERROR: {}", line.as_ref()));
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().expect("listener lock").is_some()
    }

    /// Flushes and drops the file handle. Idempotent.
    pub fn close(&self) {
        let mut guard = self.file.lock().expect("listener lock");
        if let Some(mut file) = guard.take() {
            let _ = file.flush();
        }
    }
}

impl Drop for ComputationListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Renames `log -> log.1 -> ... -> log.N`, discarding anything older.
fn rotate(path: &Path, backup_count: usize) -> std::io::Result<()> {
    let numbered = |n: usize| {
        let mut p = path.to_path_buf().into_os_string();
        p.push(format!(".{n}"));
        PathBuf::from(p)
    };
    let _ = fs::remove_file(numbered(backup_count));
    for n in (1..backup_count).rev() {
        let from = numbered(n);
        if from.exists() {
            fs::rename(&from, numbered(n + 1))?;
        }
    }
    fs::rename(path, numbered(1))?;
    Ok(())
}
