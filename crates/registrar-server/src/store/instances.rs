//! In-memory backing storage for instances of registered types
//!
//! Instances are partitioned by [`StorageScope`] and keyed by
//! `(namespace, name)` within a scope. Closed scopes are tracked under the
//! same lock as the instances, so a write either lands before the close (and
//! is seen by the drain that follows) or is refused. The store can be
//! switched offline to simulate a backend outage.

use super::{InstanceStore, Result, StorageScope, StoreError};
use crate::event_manager::EventManager;
use async_trait::async_trait;
use chrono::Utc;
use registrar_crd::{DynamicObject, WatchEvent};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

type InstanceKey = (Option<String>, String);

#[derive(Default)]
struct Partitions {
    /// scope -> (namespace, name) -> instance
    live: HashMap<StorageScope, BTreeMap<InstanceKey, DynamicObject>>,
    closed: HashSet<StorageScope>,
}

impl Partitions {
    fn ensure_open(&self, scope: &StorageScope) -> Result<()> {
        if self.closed.contains(scope) {
            return Err(StoreError::Closed(scope.to_string()));
        }
        Ok(())
    }
}

pub struct MemoryInstanceStore {
    instances: RwLock<Partitions>,
    /// scope -> watchers
    events: RwLock<HashMap<StorageScope, EventManager<WatchEvent<DynamicObject>>>>,
    revision: AtomicU64,
    available: AtomicBool,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(Partitions::default()),
            events: RwLock::new(HashMap::new()),
            revision: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Take the backend offline (or bring it back). While offline every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Total number of instances across all scopes
    pub fn len(&self) -> usize {
        self.instances
            .read()
            .map(|guard| guard.live.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_lock<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockWriteGuard<'_, T>> {
        lock.write()
            .map_err(|e| StoreError::Lock(format!("write lock poisoned: {}", e)))
    }

    fn read_lock<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockReadGuard<'_, T>> {
        lock.read()
            .map_err(|e| StoreError::Lock(format!("read lock poisoned: {}", e)))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("instance backend is offline".to_string()))
        }
    }

    fn next_resource_version(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, scope: &StorageScope, event: WatchEvent<DynamicObject>) -> Result<()> {
        let events = Self::read_lock(&self.events)?;
        if let Some(manager) = events.get(scope) {
            let _ = manager.send(event);
        }
        Ok(())
    }

    fn key(object: &DynamicObject) -> InstanceKey {
        (object.metadata.namespace.clone(), object.metadata.name.clone())
    }
}

impl Default for MemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn create_instance(
        &self,
        scope: &StorageScope,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        self.ensure_available()?;
        if object.metadata.name.is_empty() {
            return Err(StoreError::InvalidData("metadata.name is empty".to_string()));
        }

        let created = {
            let mut guard = Self::write_lock(&self.instances)?;
            guard.ensure_open(scope)?;
            let partition = guard.live.entry(scope.clone()).or_default();
            let key = Self::key(object);
            if partition.contains_key(&key) {
                return Err(StoreError::AlreadyExists(object.metadata.name.clone()));
            }

            let mut stored = object.clone();
            stored.metadata.uid = Some(Uuid::now_v7());
            stored.metadata.resource_version = Some(self.next_resource_version());
            stored.metadata.generation = 1;
            stored.metadata.creation_timestamp = Some(Utc::now());
            partition.insert(key, stored.clone());
            stored
        };

        self.publish(scope, WatchEvent::added(created.clone()))?;
        Ok(created)
    }

    async fn get_instance(
        &self,
        scope: &StorageScope,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.ensure_available()?;
        let guard = Self::read_lock(&self.instances)?;
        let key = (namespace.map(str::to_string), name.to_string());
        Ok(guard.live.get(scope).and_then(|p| p.get(&key)).cloned())
    }

    async fn list_instances(
        &self,
        scope: &StorageScope,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        self.ensure_available()?;
        let guard = Self::read_lock(&self.instances)?;
        let Some(partition) = guard.live.get(scope) else {
            return Ok(Vec::new());
        };
        Ok(partition
            .values()
            .filter(|o| namespace.is_none() || o.namespace() == namespace)
            .cloned()
            .collect())
    }

    async fn update_instance(
        &self,
        scope: &StorageScope,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        self.ensure_available()?;

        let updated = {
            let mut guard = Self::write_lock(&self.instances)?;
            guard.ensure_open(scope)?;
            let key = Self::key(object);
            let existing = guard
                .live
                .get_mut(scope)
                .and_then(|p| p.get_mut(&key))
                .ok_or_else(|| StoreError::NotFound(object.metadata.name.clone()))?;

            if let Some(rv) = &object.metadata.resource_version {
                if existing.metadata.resource_version.as_ref() != Some(rv) {
                    return Err(StoreError::Conflict(format!(
                        "{} was modified (resourceVersion {} is stale)",
                        object.metadata.name, rv
                    )));
                }
            }

            let mut updated = object.clone();
            updated.metadata.uid = existing.metadata.uid;
            updated.metadata.creation_timestamp = existing.metadata.creation_timestamp;
            updated.metadata.generation = existing.metadata.generation
                + i64::from(updated.data != existing.data);
            updated.metadata.resource_version = Some(self.next_resource_version());
            *existing = updated.clone();
            updated
        };

        self.publish(scope, WatchEvent::modified(updated.clone()))?;
        Ok(updated)
    }

    async fn delete_instance(
        &self,
        scope: &StorageScope,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        self.ensure_available()?;

        let removed = {
            let mut guard = Self::write_lock(&self.instances)?;
            let key = (namespace.map(str::to_string), name.to_string());
            let removed = guard.live.get_mut(scope).and_then(|p| p.remove(&key));
            if guard.live.get(scope).is_some_and(BTreeMap::is_empty) {
                guard.live.remove(scope);
            }
            removed
        };

        match removed {
            Some(object) => {
                self.publish(scope, WatchEvent::deleted(object))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn watch_instances(
        &self,
        scope: &StorageScope,
    ) -> Result<broadcast::Receiver<WatchEvent<DynamicObject>>> {
        self.ensure_available()?;
        let mut events = Self::write_lock(&self.events)?;
        Ok(events.entry(scope.clone()).or_default().subscribe())
    }

    async fn close_scope(&self, scope: &StorageScope) -> Result<()> {
        self.ensure_available()?;
        let mut guard = Self::write_lock(&self.instances)?;
        guard.closed.insert(scope.clone());
        Ok(())
    }
}
