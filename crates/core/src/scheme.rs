//! Explicit type registry. Filled once at startup and passed by reference to
//! whatever needs to turn a snapshot into a typed reference (recorder, controller).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const GROUP: &str = "samplecrd.k8s.io";
pub const VERSION: &str = "v1";
pub const KIND: &str = "Car";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheme {
    kinds: BTreeMap<String, GroupVersionKind>,
}

impl Scheme {
    pub fn new() -> Self { Self::default() }

    /// Register a kind. Re-registering the same kind replaces its group/version.
    pub fn add_known_type(&mut self, gvk: GroupVersionKind) {
        self.kinds.insert(gvk.kind.clone(), gvk);
    }

    pub fn gvk_for(&self, kind: &str) -> Option<&GroupVersionKind> { self.kinds.get(kind) }
    pub fn recognizes(&self, kind: &str) -> bool { self.kinds.contains_key(kind) }
    pub fn len(&self) -> usize { self.kinds.len() }
    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }
}

/// Register the `Car` kind (`samplecrd.k8s.io/v1`).
pub fn add_to_scheme(scheme: &mut Scheme) {
    scheme.add_known_type(GroupVersionKind::new(GROUP, VERSION, KIND));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_explicit() {
        let mut scheme = Scheme::new();
        assert!(!scheme.recognizes(KIND));
        add_to_scheme(&mut scheme);
        add_to_scheme(&mut scheme);
        assert_eq!(scheme.len(), 1);
        assert_eq!(scheme.gvk_for(KIND).map(|g| g.api_version()).as_deref(), Some("samplecrd.k8s.io/v1"));
    }

    #[test]
    fn core_group_api_version_has_no_slash() {
        assert_eq!(GroupVersionKind::new("", "v1", "Event").api_version(), "v1");
    }
}
