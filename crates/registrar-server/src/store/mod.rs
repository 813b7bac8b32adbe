//! Registrar storage
//!
//! Two backend-agnostic interfaces:
//! - [`RegistrationStore`] persists the `Registration` objects themselves
//! - [`InstanceStore`] is the backing storage provider for instances of the
//!   registered types, partitioned by [`StorageScope`]
//!
//! Both ship with an in-memory implementation. All methods are async so that
//! network-backed implementations can slot in without changing callers.

mod instances;
mod memory;

pub use instances::MemoryInstanceStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use registrar_crd::{DynamicObject, Registration, RegistrationStatus, WatchEvent};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failure or a write the object's state forbids
    #[error("conflict: {0}")]
    Conflict(String),

    /// A status computed against an older spec generation
    #[error("stale generation for {name}: computed against {observed}, current is {current}")]
    StaleGeneration {
        name: String,
        observed: i64,
        current: i64,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Write into a scope whose registration is being drained
    #[error("storage scope {0} is closed")]
    Closed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence for registrations.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Get registration by object name
    async fn get_registration(&self, name: &str) -> Result<Option<Registration>>;

    /// List all registrations, including ones being deleted
    async fn list_registrations(&self) -> Result<Vec<Registration>>;

    /// Create a registration.
    ///
    /// Assigns uid, resourceVersion, generation 1 and the creation timestamp.
    /// Any client-supplied status is dropped.
    async fn create_registration(&self, registration: &Registration) -> Result<Registration>;

    /// Update spec and labels/annotations/finalizers.
    ///
    /// Enforces resourceVersion when the caller supplies one, preserves the
    /// stored status and bumps the generation only if the spec changed.
    async fn update_registration(&self, registration: &Registration) -> Result<Registration>;

    /// Write status conditions, provided the spec generation is still the one
    /// they were computed against.
    ///
    /// Conditions are merged by type: types absent from `status` keep their
    /// stored value, so the writers of different condition types never undo
    /// each other.
    async fn update_status(
        &self,
        name: &str,
        status: &RegistrationStatus,
        observed_generation: i64,
    ) -> Result<Registration>;

    /// Soft-delete: set the deletion timestamp, attach `finalizer` and set
    /// `Terminating=True` in a single write. Idempotent.
    async fn mark_terminating(
        &self,
        name: &str,
        finalizer: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration>;

    /// Detach a finalizer. Returns `None` once the object is physically gone,
    /// which happens when the last finalizer leaves a deleted object.
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<Option<Registration>>;

    /// Subscribe to registration changes
    fn watch_registrations(&self) -> broadcast::Receiver<WatchEvent<Registration>>;
}

/// Partition key for the instances of one registration.
///
/// Derived from the registration's name and uid, so a registration deleted
/// and created again under the same name starts from empty storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageScope(String);

impl StorageScope {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn for_registration(registration: &Registration) -> Self {
        match registration.metadata.uid {
            Some(uid) => Self(format!("{}/{}", registration.metadata.name, uid)),
            None => Self::new(registration.metadata.name.clone()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backing storage provider for instances of registered types.
///
/// `namespace` is `None` for cluster-scoped instances. For
/// [`list_instances`](InstanceStore::list_instances) `None` means every
/// namespace. Deleting an absent instance is not an error.
///
/// A scope can be closed once its registration starts terminating. After
/// [`close_scope`](InstanceStore::close_scope) returns, creates and updates in
/// that scope fail with [`StoreError::Closed`]; reads and deletes still work.
/// Closing is permanent and idempotent.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create_instance(
        &self,
        scope: &StorageScope,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    async fn get_instance(
        &self,
        scope: &StorageScope,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn list_instances(
        &self,
        scope: &StorageScope,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    async fn update_instance(
        &self,
        scope: &StorageScope,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Returns whether an instance was removed
    async fn delete_instance(
        &self,
        scope: &StorageScope,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool>;

    fn watch_instances(
        &self,
        scope: &StorageScope,
    ) -> Result<broadcast::Receiver<WatchEvent<DynamicObject>>>;

    async fn close_scope(&self, scope: &StorageScope) -> Result<()>;
}
