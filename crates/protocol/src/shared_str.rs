use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A reference-counted, immutable string for zero-cost cloning.
///
/// Memory dumps repeat a few hundred type names across millions of
/// records and profiles repeat file names across every function, so names
/// are stored once (see [`Interner`]) and cloned as a pointer copy.
///
/// Implements `PartialEq<&str>` so assertions like
/// `assert_eq!(record.type_name, "dict")` work naturally.
#[derive(Debug, Clone, Eq)]
pub struct SharedStr(Arc<str>);

impl SharedStr {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for SharedStr {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl PartialEq<str> for SharedStr {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for SharedStr {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl Ord for SharedStr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for SharedStr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for SharedStr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (*self.0).hash(state);
    }
}

impl std::ops::Deref for SharedStr {
    type Target = str;

    #[inline]
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SharedStr {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for SharedStr {
    #[inline]
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SharedStr {
    #[inline]
    fn from(s: &str) -> Self {
        SharedStr(Arc::from(s))
    }
}

impl From<String> for SharedStr {
    #[inline]
    fn from(s: String) -> Self {
        SharedStr(Arc::from(s))
    }
}

impl std::fmt::Display for SharedStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// Hand-rolled to avoid the serde `rc` feature flag.
impl Serialize for SharedStr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SharedStr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(SharedStr::from(s))
    }
}

/// Deduplicating string table scoped to one load.
#[derive(Debug, Default)]
pub struct Interner {
    strings: HashSet<SharedStr>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared copy of `s`, allocating it on first sight.
    pub fn intern(&mut self, s: &str) -> SharedStr {
        if let Some(existing) = self.strings.get(s) {
            return existing.clone();
        }
        let shared = SharedStr::from(s);
        self.strings.insert(shared.clone());
        shared
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interner_shares_allocation() {
        let mut names = Interner::new();
        let a = names.intern("dict");
        let b = names.intern("dict");
        let c = names.intern("str");
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, "dict");
        assert_eq!(c, "str");
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn hashmap_lookup_by_str() {
        let mut map = std::collections::HashMap::new();
        map.insert(SharedStr::from("module"), 3);
        assert_eq!(map.get("module"), Some(&3));
    }

    #[test]
    fn serde_roundtrip() {
        let s = SharedStr::from("<module>");
        let json = serde_json::to_string(&s).unwrap_or_default();
        assert_eq!(json, "\"<module>\"");
        let back: SharedStr = serde_json::from_str(&json).unwrap_or_else(|_| SharedStr::from(""));
        assert_eq!(back, "<module>");
    }

    #[test]
    fn deserializes_escaped_strings() {
        let back: SharedStr =
            serde_json::from_str("\"a\\\\b.py\"").unwrap_or_else(|_| SharedStr::from(""));
        assert_eq!(back, "a\\b.py");
    }

    #[test]
    fn ordering_and_display() {
        let a = SharedStr::from("alpha");
        let b = SharedStr::from("beta");
        assert!(a < b);
        assert_eq!(format!("{a}"), "alpha");
    }
}
