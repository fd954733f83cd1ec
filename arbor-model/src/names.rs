use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Business name of a container child.
///
/// The wrapped string keeps its original spelling for display and
/// persistence; equality, ordering, and hashing are case-insensitive so
/// that `Feature/UI` and `feature/ui` address the same map slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildName(String);

impl ChildName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Case-folded key used for comparisons. Allocates only for names
    /// containing uppercase characters.
    fn key(&self) -> Cow<'_, str> {
        if self.0.chars().any(char::is_uppercase) {
            Cow::Owned(self.0.to_lowercase())
        } else {
            Cow::Borrowed(&self.0)
        }
    }
}

impl PartialEq for ChildName {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ChildName {}

impl Hash for ChildName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ChildName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChildName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for ChildName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChildName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChildName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Fully qualified, slash-delimited container path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FullName(String);

impl FullName {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self(path.trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// The last path segment, or the whole name for a root container.
    pub fn simple_name(&self) -> &str {
        self.segments().next_back().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<FullName> {
        let idx = self.0.rfind('/')?;
        Some(FullName(self.0[..idx].to_string()))
    }

    pub fn child(&self, name: &ChildName) -> FullName {
        if self.0.is_empty() {
            FullName(name.as_str().to_string())
        } else {
            FullName(format!("{}/{}", self.0, name.as_str()))
        }
    }
}

impl fmt::Display for FullName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FullName {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn child_names_compare_case_insensitively() {
        let a = ChildName::new("Feature/UI");
        let b = ChildName::new("feature/ui");
        assert_eq!(a, b);

        let mut map: BTreeMap<ChildName, u32> = BTreeMap::new();
        map.insert(a, 1);
        map.insert(b, 2);
        assert_eq!(map.len(), 1);
        // Original spelling of the first insertion is retained.
        assert_eq!(map.keys().next().unwrap().as_str(), "Feature/UI");
    }

    #[test]
    fn full_name_parent_and_child() {
        let name = FullName::new("org/repo/branches");
        assert_eq!(name.simple_name(), "branches");
        assert_eq!(name.parent().unwrap().as_str(), "org/repo");
        assert_eq!(
            name.child(&ChildName::new("main")).as_str(),
            "org/repo/branches/main"
        );
        assert!(FullName::new("root").parent().is_none());
    }
}
