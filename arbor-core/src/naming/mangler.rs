use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::host::ChildItem;

/// Longest directory name the mangler will emit.
const MAX_DIR_NAME: usize = 32;

/// How many hex digits of the digest a mangled name carries.
const DIGEST_LEN: usize = 10;

/// Characters a directory name may never contain when inferred from a
/// legacy directory.
const FORBIDDEN_IN_ITEM_NAME: &[char] = &['/', '?', '#', '[', ']', '\\'];

/// Device names that are reserved on at least one supported platform,
/// compared case-insensitively and with trailing dots stripped.
const RESERVED: &[&str] = &[
    "AUX", "CON", "NUL", "PRN", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9", ".", "..",
];

/// Deterministic, restart-stable bridge between business names and
/// directory names.
pub trait NameMangler: Send + Sync {
    /// Stored business name, read off the child (preferred path).
    fn item_name(&self, child: &dyn ChildItem) -> Option<String> {
        child.stored_business_name()
    }

    /// Stored mangled directory name, read off the child.
    fn dir_name(&self, child: &dyn ChildItem) -> Option<String> {
        child.stored_dir_name()
    }

    /// Deterministic mapping from a business name to a filesystem-safe
    /// directory name.
    fn mangle(&self, business_name: &str) -> String;

    /// Infers the business name from a pre-existing directory that
    /// carries no stored metadata (one-shot upgrade path). Never
    /// returns an empty string, `"."`, `".."`, or anything containing
    /// `/ ? # [ ] \`.
    fn item_name_from_legacy(&self, legacy_dir_name: &str) -> String;

    /// Directory-side counterpart of [`Self::item_name_from_legacy`].
    fn dir_name_from_legacy(&self, legacy_dir_name: &str) -> String {
        self.mangle(&self.item_name_from_legacy(legacy_dir_name))
    }

    /// Attaches inferred names to the child without persisting it; the
    /// caller holds a bulk-change guard for the duration.
    fn record_legacy_name(&self, child: &dyn ChildItem, legacy_dir_name: &str) {
        let business = self.item_name_from_legacy(legacy_dir_name);
        let dir = self.mangle(&business);
        child.record_names(&business, &dir);
    }
}

/// Default mangler: portable subset `A-Za-z0-9_.-`, length cap,
/// reserved-name avoidance, normalization-insensitive digests.
#[derive(Debug, Default, Clone)]
pub struct DefaultMangler;

impl DefaultMangler {
    /// Stable digest key: case-folded form of the already-normalized
    /// name, so case variants mangle alike.
    fn digest(normalized_name: &str) -> String {
        let key = normalized_name.to_lowercase();
        let hash = Sha256::digest(key.as_bytes());
        let mut out = String::with_capacity(DIGEST_LEN);
        for byte in hash.iter() {
            out.push_str(&format!("{byte:02x}"));
            if out.len() >= DIGEST_LEN {
                break;
            }
        }
        out.truncate(DIGEST_LEN);
        out
    }

    fn is_safe_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
    }

    fn is_reserved(candidate: &str) -> bool {
        let stripped = candidate.trim_end_matches('.');
        RESERVED
            .iter()
            .any(|r| r.eq_ignore_ascii_case(stripped) || r.eq_ignore_ascii_case(candidate))
    }
}

impl NameMangler for DefaultMangler {
    fn mangle(&self, business_name: &str) -> String {
        // NFC first: composed and decomposed spellings of the same
        // name must land on the same directory.
        let normalized: String = business_name.nfc().collect();
        let sanitized: String = normalized
            .chars()
            .map(|c| if Self::is_safe_char(c) { c } else { '_' })
            .collect();

        let lossless = sanitized == normalized;
        let fits = sanitized.len() <= MAX_DIR_NAME;
        let clean = !sanitized.is_empty() && !sanitized.ends_with('.') && !Self::is_reserved(&sanitized);

        if lossless && fits && clean {
            return sanitized;
        }

        // Information was lost, the name is too long, or it collides
        // with a reserved name: fall back to `<prefix>-<digest>`.
        let digest = Self::digest(&normalized);
        let keep = MAX_DIR_NAME - DIGEST_LEN - 1;
        let mut prefix: String = sanitized.chars().take(keep).collect();
        prefix = prefix.trim_matches(|c| c == '.' || c == '-').to_string();
        if prefix.is_empty() {
            prefix.push('x');
        }
        format!("{prefix}-{digest}")
    }

    fn item_name_from_legacy(&self, legacy_dir_name: &str) -> String {
        let cleaned: String = legacy_dir_name
            .chars()
            .map(|c| {
                if FORBIDDEN_IN_ITEM_NAME.contains(&c) {
                    '_'
                } else {
                    c
                }
            })
            .collect();
        let cleaned = cleaned.trim().to_string();
        if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
            "_".to_string()
        } else {
            cleaned
        }
    }
}

/// Identity mangler for containers created before name mangling
/// existed. No sidecar is needed; the directory name is the business
/// name.
#[derive(Debug, Default, Clone)]
pub struct LegacyMangler;

impl NameMangler for LegacyMangler {
    fn mangle(&self, business_name: &str) -> String {
        business_name.to_string()
    }

    fn item_name_from_legacy(&self, legacy_dir_name: &str) -> String {
        legacy_dir_name.to_string()
    }
}

/// Explicit mangler registry injected at container creation; there is
/// no ambient lookup.
#[derive(Clone)]
pub struct ManglerRegistry {
    manglers: HashMap<String, Arc<dyn NameMangler>>,
}

impl std::fmt::Debug for ManglerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManglerRegistry")
            .field("ids", &self.manglers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ManglerRegistry {
    pub const DEFAULT: &'static str = "default";
    pub const LEGACY: &'static str = "legacy";

    pub fn register(&mut self, id: impl Into<String>, mangler: Arc<dyn NameMangler>) {
        self.manglers.insert(id.into(), mangler);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn NameMangler>> {
        self.manglers.get(id).cloned()
    }

    pub fn default_mangler(&self) -> Arc<dyn NameMangler> {
        self.manglers[Self::DEFAULT].clone()
    }
}

impl Default for ManglerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            manglers: HashMap::new(),
        };
        registry.register(Self::DEFAULT, Arc::new(DefaultMangler));
        registry.register(Self::LEGACY, Arc::new(LegacyMangler));
        registry
    }
}
