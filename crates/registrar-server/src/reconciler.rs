//! Conflict detection reconciler
//!
//! Recomputes, for one registration at a time, whether its claimed
//! identifiers collide with another accepted registration, records the
//! verdict as the `NameConflict` condition and keeps the value-space index in
//! step with it.
//!
//! Work is sharded by API group: every group gets one queue drained by one
//! worker, so competing claims inside a group are decided in queue order and
//! the index has a single writer per group. Groups proceed in parallel.

use crate::router::{RouteEntry, RouteRefresher};
use crate::store::{RegistrationStore, StoreError};
use crate::value_space::{Conflict, ValueKey, ValueSpace};
use chrono::Utc;
use registrar_crd::{
    ConditionStatus, ConditionType, REASON_CONFLICTING_NAME, REASON_NO_CONFLICTS, Registration,
    RegistrationStatus, WatchEvent, WatchEventType,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Delay before retrying a registration whose reconcile hit a storage error
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// What a single reconcile decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every identifier is owned by this registration
    Accepted,
    /// At least one identifier belongs to another accepted registration
    Rejected(Conflict),
    /// The spec moved on while we were computing; nothing was applied
    Stale,
    /// Terminating without owning anything; left alone
    Skipped,
    /// The registration no longer exists
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub verdict: Verdict,
    /// Identifiers this pass gave up
    pub released: Vec<ValueKey>,
}

impl Reconciled {
    fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            released: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum WorkItem {
    Reconcile(String),
    /// The registration object was physically deleted
    Removed(String),
}

pub struct ConflictReconciler {
    store: Arc<dyn RegistrationStore>,
    values: ValueSpace,
    routes: Arc<RouteRefresher>,
    resync_interval: Duration,
}

impl ConflictReconciler {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        values: ValueSpace,
        routes: Arc<RouteRefresher>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            store,
            values,
            routes,
            resync_interval,
        }
    }

    /// Reconcile one registration against the current index.
    ///
    /// Must only be called from the worker that owns the registration's group.
    pub async fn reconcile(&self, name: &str) -> Result<Reconciled, StoreError> {
        let Some(registration) = self.store.get_registration(name).await? else {
            return self.forget(name).await;
        };

        let was_owner = self.values.is_owner(name);
        if registration.is_terminating() && !was_owner {
            debug!(registration = %name, "Terminating registration owns no identifiers; not claiming");
            return Ok(Reconciled::new(Verdict::Skipped));
        }

        let candidates = ValueKey::for_spec(&registration.spec);
        let conflict = self.values.find_conflict(name, &candidates);

        if !self.write_condition(&registration, conflict.as_ref()).await? {
            return Ok(Reconciled::new(Verdict::Stale));
        }

        let revision = self.values.revision();
        let result = match conflict {
            Some(conflict) => {
                let released = self.values.update(|index| index.release(name));
                if !released.is_empty() {
                    info!(registration = %name, conflict = %conflict, "Registration lost its identifiers");
                }
                Reconciled {
                    verdict: Verdict::Rejected(conflict),
                    released,
                }
            }
            None => {
                let claimed = self.values.update(|index| {
                    index.claim(name, registration.spec.cluster_scoped, candidates)
                });
                match claimed {
                    Ok(released) => Reconciled {
                        verdict: Verdict::Accepted,
                        released,
                    },
                    // Only reachable if something outside this group's worker wrote the index.
                    Err(conflict) => {
                        warn!(registration = %name, conflict = %conflict, "Claim raced with another writer");
                        Reconciled::new(Verdict::Rejected(conflict))
                    }
                }
            }
        };

        let accepted = matches!(result.verdict, Verdict::Accepted);
        if self.values.revision() != revision
            || registration.is_accepted() != accepted
            || self.route_is_stale(&registration, accepted)
        {
            self.routes.refresh().await?;
        }
        Ok(result)
    }

    /// Whether the published table disagrees with the current spec, e.g.
    /// after a version change that moved no identifier.
    fn route_is_stale(&self, registration: &Registration, accepted: bool) -> bool {
        let table = self.routes.snapshot().load();
        let published = table.entry_for(registration.name());
        if accepted {
            published != Some(&RouteEntry::from_registration(registration))
        } else {
            published.is_some()
        }
    }

    /// Release everything a vanished registration owned
    pub async fn forget(&self, name: &str) -> Result<Reconciled, StoreError> {
        let released = self.values.update(|index| index.release(name));
        if !released.is_empty() {
            info!(registration = %name, released = released.len(), "Released identifiers of removed registration");
            self.routes.refresh().await?;
        }
        Ok(Reconciled {
            verdict: Verdict::Gone,
            released,
        })
    }

    /// Write `NameConflict` if it changed. Returns false when the write was
    /// computed against a stale generation and must be discarded.
    async fn write_condition(
        &self,
        registration: &Registration,
        conflict: Option<&Conflict>,
    ) -> Result<bool, StoreError> {
        let name = registration.name();
        let mut conditions = registration.conditions();
        let now = Utc::now();

        let changed = match conflict {
            Some(conflict) => conditions.set(
                ConditionType::NameConflict,
                ConditionStatus::True,
                REASON_CONFLICTING_NAME,
                conflict.to_string(),
                now,
            ),
            None => conditions.set(
                ConditionType::NameConflict,
                ConditionStatus::False,
                REASON_NO_CONFLICTS,
                "no conflicts found",
                now,
            ),
        };
        if !changed {
            return Ok(true);
        }

        // Only the condition this reconciler owns goes out.
        let mut status = RegistrationStatus::default();
        if let Some(condition) = conditions.get(ConditionType::NameConflict) {
            status.conditions.upsert(condition.clone());
        }

        match self
            .store
            .update_status(name, &status, registration.metadata.generation)
            .await
        {
            Ok(_) => {
                match conflict {
                    Some(conflict) => {
                        info!(registration = %name, conflict = %conflict, "Registration rejected")
                    }
                    None => info!(registration = %name, "Registration accepted"),
                }
                Ok(true)
            }
            Err(StoreError::StaleGeneration {
                observed, current, ..
            }) => {
                debug!(registration = %name, observed, current, "Discarding status computed against a stale generation");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Names of other registrations in `group` that might now be acceptable
    async fn peers(&self, group: &str, except: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .list_registrations()
            .await?
            .into_iter()
            .filter(|r| r.spec.group == group && r.name() != except)
            .filter(|r| !self.values.is_owner(r.name()))
            .map(|r| r.metadata.name)
            .collect())
    }

    /// Run until `shutdown` flips: dispatch watch events to per-group
    /// workers and resync everything periodically.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // Subscribe before the initial listing so nothing slips between them.
        let mut events = self.store.watch_registrations();
        let mut queues = GroupQueues::new(self.clone(), shutdown.clone());

        let mut resync = tokio::time::interval(self.resync_interval);
        info!(resync = ?self.resync_interval, "Starting conflict reconciler");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                // The first tick fires immediately and performs the initial sync.
                _ = resync.tick() => self.enqueue_all(&mut queues).await,
                event = events.recv() => match event {
                    Ok(event) => queues.dispatch(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Reconciler fell behind on registration events; resyncing");
                        self.enqueue_all(&mut queues).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("Conflict reconciler stopped");
    }

    async fn enqueue_all(&self, queues: &mut GroupQueues) {
        match self.store.list_registrations().await {
            Ok(registrations) => {
                debug!(count = registrations.len(), "Resyncing registrations");
                for registration in registrations {
                    queues.send(
                        &registration.spec.group,
                        WorkItem::Reconcile(registration.metadata.name),
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to list registrations for resync"),
        }
    }

    async fn work(self: Arc<Self>, group: String, queue: GroupQueue, mut shutdown: watch::Receiver<bool>) {
        let GroupQueue { tx, mut rx } = queue;
        debug!(group = %group, "Reconcile worker started");

        loop {
            let item = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let (name, result) = match item {
                WorkItem::Reconcile(name) => {
                    let result = self.reconcile(&name).await;
                    (name, result)
                }
                WorkItem::Removed(name) => {
                    // Recreated under the same name before we got here.
                    let result = match self.store.get_registration(&name).await {
                        Ok(Some(_)) => self.reconcile(&name).await,
                        Ok(None) => self.forget(&name).await,
                        Err(e) => Err(e),
                    };
                    (name, result)
                }
            };

            match result {
                Ok(Reconciled {
                    verdict: Verdict::Stale,
                    ..
                }) => {
                    let _ = tx.send(WorkItem::Reconcile(name));
                }
                Ok(reconciled) if !reconciled.released.is_empty() => {
                    match self.peers(&group, &name).await {
                        Ok(peers) => {
                            debug!(group = %group, peers = peers.len(), "Requeueing registrations after release");
                            for peer in peers {
                                let _ = tx.send(WorkItem::Reconcile(peer));
                            }
                        }
                        Err(e) => warn!(group = %group, error = %e, "Failed to list peers; waiting for resync"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(registration = %name, error = %e, "Reconcile failed; retrying");
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(RETRY_DELAY).await;
                        let _ = tx.send(WorkItem::Reconcile(name));
                    });
                }
            }
        }
        debug!(group = %group, "Reconcile worker stopped");
    }
}

struct GroupQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: mpsc::UnboundedReceiver<WorkItem>,
}

/// Lazily spawned worker per group
struct GroupQueues {
    reconciler: Arc<ConflictReconciler>,
    shutdown: watch::Receiver<bool>,
    senders: HashMap<String, mpsc::UnboundedSender<WorkItem>>,
}

impl GroupQueues {
    fn new(reconciler: Arc<ConflictReconciler>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            reconciler,
            shutdown,
            senders: HashMap::new(),
        }
    }

    fn dispatch(&mut self, event: WatchEvent<Registration>) {
        let group = event.object.spec.group.clone();
        let name = event.object.metadata.name;
        let item = match event.event_type {
            WatchEventType::Deleted => WorkItem::Removed(name),
            WatchEventType::Added | WatchEventType::Modified => WorkItem::Reconcile(name),
        };
        self.send(&group, item);
    }

    fn send(&mut self, group: &str, item: WorkItem) {
        let sender = self.senders.entry(group.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let queue = GroupQueue { tx: tx.clone(), rx };
            tokio::spawn(self.reconciler.clone().work(
                group.to_string(),
                queue,
                self.shutdown.clone(),
            ));
            tx
        });
        if sender.send(item).is_err() {
            warn!(group = %group, "Reconcile worker is gone; dropping work item");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{RouteKey, RouteSnapshot, RouteTable};
    use crate::store::MemoryStore;
    use registrar_crd::{ConditionType, DRAIN_FINALIZER, IdentifierKind};

    struct Fixture {
        store: Arc<dyn RegistrationStore>,
        values: ValueSpace,
        routes: Arc<RouteSnapshot>,
        reconciler: ConflictReconciler,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn RegistrationStore> = Arc::new(MemoryStore::new());
        let values = ValueSpace::new();
        let routes = Arc::new(RouteSnapshot::new());
        let refresher = Arc::new(RouteRefresher::new(store.clone(), values.clone(), routes.clone()));
        let reconciler = ConflictReconciler::new(
            store.clone(),
            values.clone(),
            refresher,
            Duration::from_secs(30),
        );
        Fixture {
            store,
            values,
            routes,
            reconciler,
        }
    }

    fn widgets() -> Registration {
        Registration::new("example.com", "v1", "widgets", "Widget")
    }

    /// A second type in the same group that wants the `Widget` kind
    fn gadgets_sharing_widget_kind() -> Registration {
        Registration::new("example.com", "v1", "gadgets", "Widget")
    }

    fn route_for(routes: &RouteSnapshot, version: &str) -> Option<RouteEntry> {
        routes
            .load()
            .get(&RouteKey::new("example.com", version, "widgets"))
            .cloned()
    }

    async fn condition(store: &Arc<dyn RegistrationStore>, name: &str) -> ConditionStatus {
        store
            .get_registration(name)
            .await
            .unwrap()
            .unwrap()
            .conditions()
            .status(ConditionType::NameConflict)
    }

    #[tokio::test]
    async fn test_accepts_free_registration() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();

        let result = f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(condition(&f.store, "widgets.example.com").await, ConditionStatus::False);
        assert!(f.values.is_owner("widgets.example.com"));

        let table = f.routes.load();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_second_claimant_is_rejected() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();
        f.store.create_registration(&gadgets_sharing_widget_kind()).await.unwrap();

        f.reconciler.reconcile("widgets.example.com").await.unwrap();
        let result = f.reconciler.reconcile("gadgets.example.com").await.unwrap();

        match result.verdict {
            Verdict::Rejected(conflict) => {
                assert_eq!(conflict.owner, "widgets.example.com");
                assert_eq!(conflict.key.kind, IdentifierKind::Kind);
                assert_eq!(conflict.key.value, "Widget");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(condition(&f.store, "gadgets.example.com").await, ConditionStatus::True);
        assert_eq!(condition(&f.store, "widgets.example.com").await, ConditionStatus::False);

        let stored = f.store.get_registration("gadgets.example.com").await.unwrap().unwrap();
        let cond = stored.conditions().get(ConditionType::NameConflict).cloned().unwrap();
        assert_eq!(cond.reason, REASON_CONFLICTING_NAME);
        assert!(cond.message.contains("widgets.example.com"));
        assert!(cond.message.contains("kind \"Widget\""));
    }

    #[tokio::test]
    async fn test_rejected_registration_heals_after_owner_is_removed() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();
        f.store.create_registration(&gadgets_sharing_widget_kind()).await.unwrap();
        f.reconciler.reconcile("widgets.example.com").await.unwrap();
        f.reconciler.reconcile("gadgets.example.com").await.unwrap();

        f.store
            .mark_terminating("widgets.example.com", DRAIN_FINALIZER, Utc::now())
            .await
            .unwrap();
        f.store
            .remove_finalizer("widgets.example.com", DRAIN_FINALIZER)
            .await
            .unwrap();

        let forgotten = f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert_eq!(forgotten.verdict, Verdict::Gone);
        assert!(!forgotten.released.is_empty());

        let result = f.reconciler.reconcile("gadgets.example.com").await.unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(condition(&f.store, "gadgets.example.com").await, ConditionStatus::False);
    }

    #[tokio::test]
    async fn test_spec_change_into_conflict_releases_names() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();
        let gadgets = Registration::new("example.com", "v1", "gadgets", "Gadget");
        f.store.create_registration(&gadgets).await.unwrap();
        f.reconciler.reconcile("widgets.example.com").await.unwrap();
        f.reconciler.reconcile("gadgets.example.com").await.unwrap();

        // Gadgets now wants the Widget kind.
        let mut current = f.store.get_registration("gadgets.example.com").await.unwrap().unwrap();
        current.spec.kind = "Widget".to_string();
        current.spec.list_kind = Some("GadgetList".to_string());
        f.store.update_registration(&current).await.unwrap();

        let result = f.reconciler.reconcile("gadgets.example.com").await.unwrap();
        assert!(matches!(result.verdict, Verdict::Rejected(_)));
        assert!(!result.released.is_empty());
        assert!(!f.values.is_owner("gadgets.example.com"));
        assert_eq!(f.routes.load().len(), 1);
    }

    #[tokio::test]
    async fn test_version_change_republishes_route() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();
        f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert!(route_for(&f.routes, "v1").is_some());

        let mut current = f.store.get_registration("widgets.example.com").await.unwrap().unwrap();
        current.spec.version = "v2".to_string();
        f.store.update_registration(&current).await.unwrap();

        let result = f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);
        assert!(route_for(&f.routes, "v1").is_none());
        let entry = route_for(&f.routes, "v2").unwrap();
        assert_eq!(entry.api_version(), "example.com/v2");
        assert_eq!(f.routes.load().len(), 1);
    }

    #[tokio::test]
    async fn test_scope_change_republishes_route() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();
        f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert!(!route_for(&f.routes, "v1").unwrap().cluster_scoped);

        let mut current = f.store.get_registration("widgets.example.com").await.unwrap().unwrap();
        current.spec.cluster_scoped = true;
        f.store.update_registration(&current).await.unwrap();

        f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert!(route_for(&f.routes, "v1").unwrap().cluster_scoped);
    }

    #[tokio::test]
    async fn test_resync_restores_a_lost_route() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();
        f.reconciler.reconcile("widgets.example.com").await.unwrap();

        f.routes.publish(Arc::new(RouteTable::empty()));
        f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert!(route_for(&f.routes, "v1").is_some());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();
        f.reconciler.reconcile("widgets.example.com").await.unwrap();
        let before = f.store.get_registration("widgets.example.com").await.unwrap().unwrap();

        let result = f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);

        let after = f.store.get_registration("widgets.example.com").await.unwrap().unwrap();
        assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_terminating_loser_does_not_claim() {
        let f = fixture();
        f.store.create_registration(&widgets()).await.unwrap();
        f.store
            .mark_terminating("widgets.example.com", DRAIN_FINALIZER, Utc::now())
            .await
            .unwrap();

        let result = f.reconciler.reconcile("widgets.example.com").await.unwrap();
        assert_eq!(result.verdict, Verdict::Skipped);
        assert!(f.values.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_missing_registration_is_gone() {
        let f = fixture();
        let result = f.reconciler.reconcile("nothing.example.com").await.unwrap();
        assert_eq!(result.verdict, Verdict::Gone);
        assert!(result.released.is_empty());
    }

    #[tokio::test]
    async fn test_run_converges_and_heals() {
        let f = fixture();
        let reconciler = Arc::new(f.reconciler);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.clone().run(shutdown_rx));

        f.store.create_registration(&widgets()).await.unwrap();
        wait_for(&f.store, "widgets.example.com", ConditionStatus::False).await;
        f.store.create_registration(&gadgets_sharing_widget_kind()).await.unwrap();
        wait_for(&f.store, "gadgets.example.com", ConditionStatus::True).await;

        f.store
            .mark_terminating("widgets.example.com", DRAIN_FINALIZER, Utc::now())
            .await
            .unwrap();
        f.store
            .remove_finalizer("widgets.example.com", DRAIN_FINALIZER)
            .await
            .unwrap();
        wait_for(&f.store, "gadgets.example.com", ConditionStatus::False).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    async fn wait_for(store: &Arc<dyn RegistrationStore>, name: &str, want: ConditionStatus) {
        for _ in 0..200 {
            if let Ok(Some(reg)) = store.get_registration(name).await {
                if reg.conditions().status(ConditionType::NameConflict) == want {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached NameConflict={:?}", name, want);
    }
}
