use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Object identity: `(namespace, name)`. Cluster-scoped objects have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Format(String),
    #[error("empty name in key: {0:?}")]
    EmptyName(String),
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    /// Split a `namespace/name` (or bare `name`) work-queue key.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split('/').collect();
        let (namespace, name) = match parts.as_slice() {
            [name] => (None, *name),
            [ns, name] => (Some(*ns), *name),
            _ => return Err(KeyError::Format(key.to_string())),
        };
        if name.is_empty() {
            return Err(KeyError::EmptyName(key.to_string()));
        }
        Ok(Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_and_cluster_keys() {
        let k = ObjectKey::parse("default/car1").unwrap();
        assert_eq!(k, ObjectKey::namespaced("default", "car1"));
        assert_eq!(k.to_string(), "default/car1");

        let c = ObjectKey::parse("car1").unwrap();
        assert_eq!(c.namespace, None);
        assert_eq!(c.to_string(), "car1");
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(ObjectKey::parse("a/b/c"), Err(KeyError::Format(_))));
        assert!(matches!(ObjectKey::parse("default/"), Err(KeyError::EmptyName(_))));
        assert!(matches!(ObjectKey::parse(""), Err(KeyError::EmptyName(_))));
    }
}
