//! Common metadata types for CRDs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Kubernetes-style object metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name (required)
    #[serde(default)]
    pub name: String,

    /// Namespace (only set for namespaced objects)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Unique identifier, assigned by the server on create
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,

    /// Resource version for optimistic concurrency
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Spec generation, bumped by the server whenever the spec changes
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,

    /// Labels for organizing resources
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Annotations for storing arbitrary metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,

    /// Creation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set when deletion was requested; the object lingers until its finalizers clear
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    /// Pending cleanup markers that block physical deletion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl ObjectMeta {
    /// Create new metadata with just a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create new metadata with name and namespace
    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Whether deletion has been requested
    pub fn is_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Attach a finalizer, returning false if it was already present
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Detach a finalizer, returning false if it was not present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

/// Type metadata for CRD objects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// API version (e.g., "registrar.io/v1")
    #[serde(default)]
    pub api_version: String,

    /// Kind (e.g., "Registration")
    #[serde(default)]
    pub kind: String,
}

impl TypeMeta {
    /// Create type metadata for an arbitrary group/version/kind
    pub fn new(group: &str, version: &str, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version(group, version),
            kind: kind.into(),
        }
    }

    /// Create type metadata for Registration
    pub fn registration() -> Self {
        Self {
            api_version: crate::API_VERSION.to_string(),
            kind: "Registration".to_string(),
        }
    }
}

/// Join a group and version into an apiVersion string
pub fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}
