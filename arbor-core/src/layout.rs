//! On-disk layout of a computed container.
//!
//! ```text
//! <container>/
//!     config.json                # container configuration (host-owned)
//!     computation/
//!         computation.json       # last computation record
//!         computation.log        # latest run log, plus rotated .1..N
//!         events.log             # out-of-band event stream
//!     jobs/
//!         <dirName>/
//!             name-utf8.txt      # business name sidecar
//!             config.json        # child configuration (host-owned)
//! ```

use std::path::{Path, PathBuf};

/// Directory holding one subdirectory per child.
pub const JOBS_DIR: &str = "jobs";

/// Marker/configuration file that makes a subdirectory a child.
pub const CONFIG_FILE: &str = "config.json";

/// Directory holding computation state and logs.
pub const COMPUTATION_DIR: &str = "computation";

/// Latest computation run log.
pub const COMPUTATION_LOG: &str = "computation.log";

/// Persisted record of the last computation.
pub const COMPUTATION_RECORD: &str = "computation.json";

/// Out-of-band event stream.
pub const EVENTS_LOG: &str = "events.log";

pub fn jobs_dir(container_root: &Path) -> PathBuf {
    container_root.join(JOBS_DIR)
}

pub fn computation_dir(container_root: &Path) -> PathBuf {
    container_root.join(COMPUTATION_DIR)
}

pub fn computation_log(container_root: &Path) -> PathBuf {
    computation_dir(container_root).join(COMPUTATION_LOG)
}

pub fn computation_record(container_root: &Path) -> PathBuf {
    computation_dir(container_root).join(COMPUTATION_RECORD)
}

pub fn events_log(container_root: &Path) -> PathBuf {
    computation_dir(container_root).join(EVENTS_LOG)
}
