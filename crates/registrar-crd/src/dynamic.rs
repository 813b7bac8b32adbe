//! Untyped objects for dynamically registered resource types
//!
//! Instances of a registered type are opaque to the control plane: only
//! `apiVersion`, `kind` and `metadata` are interpreted, everything else is
//! carried through unchanged.

use crate::{ObjectMeta, TypeMeta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An instance of a dynamically registered resource type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DynamicObject {
    #[serde(flatten)]
    pub type_meta: TypeMeta,

    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Everything else (`spec`, `status`, `data`, ...)
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DynamicObject {
    pub fn new(type_meta: TypeMeta, metadata: ObjectMeta) -> Self {
        Self {
            type_meta,
            metadata,
            data: Map::new(),
        }
    }

    /// Set a top-level field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }
}

/// Kind of change carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    /// Wire name, as used in the `type` field
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

/// A single change notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: T,
}

impl<T> WatchEvent<T> {
    pub fn added(object: T) -> Self {
        Self { event_type: WatchEventType::Added, object }
    }

    pub fn modified(object: T) -> Self {
        Self { event_type: WatchEventType::Modified, object }
    }

    pub fn deleted(object: T) -> Self {
        Self { event_type: WatchEventType::Deleted, object }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WatchEvent<U> {
        WatchEvent {
            event_type: self.event_type,
            object: f(self.object),
        }
    }
}
