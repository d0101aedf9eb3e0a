//! Object metadata shared by every namespaced resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata common to all namespaced resources.
///
/// `(namespace, name)` uniquely identifies a resource within its kind.
/// Labels and annotations are free-form string maps; labels are matchable
/// by filter expressions, annotations are opaque to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Namespace the resource belongs to.
    #[serde(default)]
    pub namespace: String,

    /// Resource name, unique within the namespace.
    #[serde(default)]
    pub name: String,

    /// Matchable key/value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Opaque key/value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Creates metadata with the given namespace and name.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns `true` if both namespace and name are non-empty.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.namespace.is_empty() && !self.name.is_empty()
    }

    /// The `namespace/name` path used for store keys and log fields.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ObjectMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_sets_both_fields() {
        let meta = ObjectMeta::namespaced("default", "web01");
        assert_eq!(meta.namespace, "default");
        assert_eq!(meta.name, "web01");
        assert!(meta.is_complete());
    }

    #[test]
    fn incomplete_when_either_field_empty() {
        assert!(!ObjectMeta::namespaced("", "web01").is_complete());
        assert!(!ObjectMeta::namespaced("default", "").is_complete());
    }

    #[test]
    fn serialization_omits_empty_maps() {
        let meta = ObjectMeta::namespaced("default", "web01");
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("labels"));
        assert!(!json.contains("annotations"));
    }
}
