//! Business-name to directory-name bridging.
//!
//! Children keep a stable business name across recomputations; the
//! on-disk directory carries a filesystem-safe mangling of it, plus a
//! UTF-8 sidecar file so administrators can recover the business name
//! by eye.

mod mangler;
mod sidecar;

pub use mangler::{DefaultMangler, LegacyMangler, ManglerRegistry, NameMangler};
pub use sidecar::{read_name_file, write_name_file, NAME_FILE};
