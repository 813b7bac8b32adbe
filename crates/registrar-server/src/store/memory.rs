//! In-memory registration store
//!
//! Simple storage for testing and single-node development.
//! Every write happens under one write lock and publishes its watch event
//! before releasing it, so watchers see changes in resourceVersion order.

use super::{RegistrationStore, Result, StoreError};
use crate::event_manager::EventManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use registrar_crd::{
    ConditionStatus, ConditionType, REASON_INSTANCE_DELETION, Registration, RegistrationStatus,
    WatchEvent,
};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

pub struct MemoryStore {
    registrations: RwLock<BTreeMap<String, Registration>>,
    /// Store-wide resourceVersion counter
    revision: AtomicU64,
    events: EventManager<WatchEvent<Registration>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            events: EventManager::new(),
        }
    }

    /// Helper to acquire write lock with error conversion
    fn write_lock<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockWriteGuard<'_, T>> {
        lock.write()
            .map_err(|e| StoreError::Lock(format!("write lock poisoned: {}", e)))
    }

    /// Helper to acquire read lock with error conversion
    fn read_lock<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockReadGuard<'_, T>> {
        lock.read()
            .map_err(|e| StoreError::Lock(format!("read lock poisoned: {}", e)))
    }

    fn next_resource_version(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: WatchEvent<Registration>) {
        // No watchers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistrationStore for MemoryStore {
    async fn get_registration(&self, name: &str) -> Result<Option<Registration>> {
        let guard = Self::read_lock(&self.registrations)?;
        Ok(guard.get(name).cloned())
    }

    async fn list_registrations(&self) -> Result<Vec<Registration>> {
        let guard = Self::read_lock(&self.registrations)?;
        Ok(guard.values().cloned().collect())
    }

    async fn create_registration(&self, registration: &Registration) -> Result<Registration> {
        let name = registration.metadata.name.clone();
        if name.is_empty() {
            return Err(StoreError::InvalidData("metadata.name is empty".to_string()));
        }

        let mut guard = Self::write_lock(&self.registrations)?;
        if guard.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }

        let mut stored = registration.clone();
        stored.metadata.uid = Some(Uuid::now_v7());
        stored.metadata.resource_version = Some(self.next_resource_version());
        stored.metadata.generation = 1;
        stored.metadata.creation_timestamp = Some(Utc::now());
        stored.metadata.deletion_timestamp = None;
        stored.status = None;

        guard.insert(name, stored.clone());
        self.publish(WatchEvent::added(stored.clone()));
        Ok(stored)
    }

    async fn update_registration(&self, registration: &Registration) -> Result<Registration> {
        let name = &registration.metadata.name;
        let mut guard = Self::write_lock(&self.registrations)?;
        let existing = guard
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;

        if let Some(rv) = &registration.metadata.resource_version {
            if existing.metadata.resource_version.as_ref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "registration {} was modified (resourceVersion {} is stale)",
                    name, rv
                )));
            }
        }

        let spec_changed = existing.spec != registration.spec;
        if spec_changed && existing.metadata.is_deleted() {
            return Err(StoreError::Conflict(format!(
                "registration {} is terminating; its spec can no longer change",
                name
            )));
        }

        let mut updated = existing.clone();
        updated.spec = registration.spec.clone();
        updated.metadata.labels = registration.metadata.labels.clone();
        updated.metadata.annotations = registration.metadata.annotations.clone();
        // Finalizers are frozen once deletion starts; only their owners detach them.
        if !existing.metadata.is_deleted() {
            updated.metadata.finalizers = registration.metadata.finalizers.clone();
        }

        if updated == *existing {
            return Ok(updated);
        }
        if spec_changed {
            updated.metadata.generation += 1;
        }
        updated.metadata.resource_version = Some(self.next_resource_version());

        guard.insert(name.clone(), updated.clone());
        self.publish(WatchEvent::modified(updated.clone()));
        Ok(updated)
    }

    async fn update_status(
        &self,
        name: &str,
        status: &RegistrationStatus,
        observed_generation: i64,
    ) -> Result<Registration> {
        let mut guard = Self::write_lock(&self.registrations)?;
        let existing = guard
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if existing.metadata.generation != observed_generation {
            return Err(StoreError::StaleGeneration {
                name: name.to_string(),
                observed: observed_generation,
                current: existing.metadata.generation,
            });
        }

        let merged = existing.status.get_or_insert_with(Default::default);
        let before = merged.clone();
        for condition in status.conditions.iter() {
            merged.conditions.upsert(condition.clone());
        }
        if *merged == before {
            return Ok(existing.clone());
        }
        existing.metadata.resource_version = Some(self.next_resource_version());

        let updated = existing.clone();
        self.publish(WatchEvent::modified(updated.clone()));
        Ok(updated)
    }

    async fn mark_terminating(
        &self,
        name: &str,
        finalizer: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration> {
        let mut guard = Self::write_lock(&self.registrations)?;
        let existing = guard
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let mut changed = false;
        if existing.metadata.deletion_timestamp.is_none() {
            existing.metadata.deletion_timestamp = Some(now);
            changed = true;
        }
        changed |= existing.metadata.add_finalizer(finalizer);
        changed |= existing.status.get_or_insert_with(Default::default).conditions.set(
            ConditionType::Terminating,
            ConditionStatus::True,
            REASON_INSTANCE_DELETION,
            "deleting all instances before the registration is removed",
            now,
        );

        if !changed {
            return Ok(existing.clone());
        }

        existing.metadata.resource_version = Some(self.next_resource_version());
        let updated = existing.clone();
        self.publish(WatchEvent::modified(updated.clone()));
        Ok(updated)
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<Option<Registration>> {
        let mut guard = Self::write_lock(&self.registrations)?;
        let Some(existing) = guard.get_mut(name) else {
            return Ok(None);
        };

        let removed = existing.metadata.remove_finalizer(finalizer);

        if existing.metadata.is_deleted() && existing.metadata.finalizers.is_empty() {
            if let Some(gone) = guard.remove(name) {
                self.publish(WatchEvent::deleted(gone));
            }
            return Ok(None);
        }

        if removed {
            existing.metadata.resource_version = Some(self.next_resource_version());
            let updated = existing.clone();
            self.publish(WatchEvent::modified(updated.clone()));
            return Ok(Some(updated));
        }

        Ok(Some(existing.clone()))
    }

    fn watch_registrations(&self) -> broadcast::Receiver<WatchEvent<Registration>> {
        self.events.subscribe()
    }
}
