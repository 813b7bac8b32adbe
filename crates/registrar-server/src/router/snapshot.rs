//! Read-optimized route table
//!
//! Built from a point-in-time copy of the value-space index plus the stored
//! registrations, then published through an `ArcSwap` so request handlers
//! load it without locking.

use crate::store::{RegistrationStore, StorageScope, StoreError};
use crate::value_space::{ValueSpace, ValueSpaceIndex};
use arc_swap::ArcSwap;
use registrar_crd::{Registration, api_version};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl RouteKey {
    pub fn new(group: &str, version: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
        }
    }
}

/// Handle to an accepted registration as seen by the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub registration: String,
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
    pub list_kind: String,
    pub cluster_scoped: bool,
    pub terminating: bool,
    pub scope: StorageScope,
}

impl RouteEntry {
    pub fn from_registration(registration: &Registration) -> Self {
        let spec = &registration.spec;
        Self {
            registration: registration.name().to_string(),
            group: spec.group.clone(),
            version: spec.version.clone(),
            plural: spec.plural_name.clone(),
            kind: spec.kind.clone(),
            list_kind: spec.list_kind(),
            cluster_scoped: spec.cluster_scoped,
            terminating: registration.is_terminating() || registration.metadata.is_deleted(),
            scope: StorageScope::for_registration(registration),
        }
    }

    pub fn key(&self) -> RouteKey {
        RouteKey::new(&self.group, &self.version, &self.plural)
    }

    pub fn api_version(&self) -> String {
        api_version(&self.group, &self.version)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<RouteKey, RouteEntry>,
    /// Index revision this table was built from
    index_revision: u64,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Route every registration that is both accepted and an index owner
    pub fn build(index: &ValueSpaceIndex, registrations: &[Registration]) -> Self {
        let routes = registrations
            .iter()
            .filter(|r| r.is_accepted() && index.is_owner(r.name()))
            .map(RouteEntry::from_registration)
            .map(|entry| (entry.key(), entry))
            .collect();

        Self {
            routes,
            index_revision: index.revision(),
        }
    }

    pub fn get(&self, key: &RouteKey) -> Option<&RouteEntry> {
        self.routes.get(key)
    }

    /// The entry routed to `registration`, wherever its key now points
    pub fn entry_for(&self, registration: &str) -> Option<&RouteEntry> {
        self.routes.values().find(|e| e.registration == registration)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values()
    }

    pub fn index_revision(&self) -> u64 {
        self.index_revision
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The currently published route table
pub struct RouteSnapshot {
    current: ArcSwap<RouteTable>,
}

impl RouteSnapshot {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RouteTable::empty()),
        }
    }

    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    pub fn publish(&self, table: Arc<RouteTable>) {
        self.current.store(table);
    }
}

impl Default for RouteSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuilds and republishes the route table.
///
/// Refreshes are serialized so a slow rebuild can never overwrite the result
/// of one that started after it.
pub struct RouteRefresher {
    store: Arc<dyn RegistrationStore>,
    values: ValueSpace,
    snapshot: Arc<RouteSnapshot>,
    lock: Mutex<()>,
}

impl RouteRefresher {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        values: ValueSpace,
        snapshot: Arc<RouteSnapshot>,
    ) -> Self {
        Self {
            store,
            values,
            snapshot,
            lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> &Arc<RouteSnapshot> {
        &self.snapshot
    }

    pub async fn refresh(&self) -> Result<Arc<RouteTable>, StoreError> {
        let _guard = self.lock.lock().await;

        let registrations = self.store.list_registrations().await?;
        let index = self.values.snapshot();
        let table = Arc::new(RouteTable::build(&index, &registrations));

        debug!(
            routes = table.len(),
            index_revision = table.index_revision(),
            "Publishing route table"
        );
        self.snapshot.publish(table.clone());
        Ok(table)
    }
}
