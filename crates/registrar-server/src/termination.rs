//! Registration termination
//!
//! Deleting a registration is a three-state machine:
//!
//! ```text
//! Active --delete--> Terminating --drained + finalizer cleared--> Removed
//!                      |    ^
//!                      +----+ drain attempt (retried with backoff)
//! ```
//!
//! The delete request soft-deletes the registration: deletion timestamp, the
//! drain finalizer and `Terminating=True` land in one store write, and the
//! route table is republished before the request returns, so mutating
//! requests against the type are refused from then on. A per-registration
//! worker then closes the registration's storage scope, deletes every stored
//! instance and finally detaches the finalizer, which lets the store drop the
//! object. Closing the scope also refuses writes from handlers that were
//! selected before the delete, so a registration never reaches `Removed`
//! while instances might remain.

use crate::config::TerminationConfig;
use crate::router::RouteRefresher;
use crate::store::{InstanceStore, RegistrationStore, StorageScope, StoreError};
use chrono::Utc;
use parking_lot::Mutex;
use registrar_crd::{DRAIN_FINALIZER, Registration, WatchEventType};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Active,
    Terminating,
    /// The registration object no longer exists
    Removed,
}

impl TerminationState {
    pub fn of(registration: Option<&Registration>) -> Self {
        match registration {
            None => Self::Removed,
            Some(r) if r.is_terminating() || r.metadata.is_deleted() => Self::Terminating,
            Some(_) => Self::Active,
        }
    }
}

impl fmt::Display for TerminationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Removed => write!(f, "Removed"),
        }
    }
}

pub struct TerminationController {
    store: Arc<dyn RegistrationStore>,
    instances: Arc<dyn InstanceStore>,
    routes: Arc<RouteRefresher>,
    config: TerminationConfig,
    /// Registrations with a running drain worker
    draining: Mutex<HashSet<String>>,
    shutdown: watch::Receiver<bool>,
}

impl TerminationController {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        instances: Arc<dyn InstanceStore>,
        routes: Arc<RouteRefresher>,
        config: TerminationConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            instances,
            routes,
            config,
            draining: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    /// Active -> Terminating.
    ///
    /// Idempotent: deleting a registration that is already terminating just
    /// makes sure its drain worker is running.
    pub async fn request_delete(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<Registration, StoreError> {
        let registration = self
            .store
            .mark_terminating(name, DRAIN_FINALIZER, Utc::now())
            .await?;
        info!(registration = %name, "Registration terminating");

        // The soft delete is committed; the next refresh will publish it.
        if let Err(e) = self.routes.refresh().await {
            warn!(registration = %name, error = %e, "Failed to refresh routes after delete");
        }
        self.spawn_drain(name);
        Ok(registration)
    }

    /// One drain attempt: close `scope`, delete every instance in it and
    /// report how many are still there afterwards. Safe to repeat.
    pub async fn drain_step(&self, scope: &StorageScope) -> Result<usize, StoreError> {
        self.instances.close_scope(scope).await?;
        let instances = self.instances.list_instances(scope, None).await?;
        if instances.is_empty() {
            return Ok(0);
        }

        debug!(scope = %scope, count = instances.len(), "Deleting instances");
        for instance in &instances {
            self.instances
                .delete_instance(scope, instance.namespace(), instance.name())
                .await?;
        }

        Ok(self.instances.list_instances(scope, None).await?.len())
    }

    /// Terminating -> Removed, once storage is empty
    pub async fn finalize(&self, name: &str) -> Result<TerminationState, StoreError> {
        let remaining = self.store.remove_finalizer(name, DRAIN_FINALIZER).await?;
        Ok(TerminationState::of(remaining.as_ref()))
    }

    pub fn is_draining(&self, name: &str) -> bool {
        self.draining.lock().contains(name)
    }

    /// Start a drain worker unless one is already running for `name`
    pub fn spawn_drain(self: &Arc<Self>, name: &str) {
        if !self.draining.lock().insert(name.to_string()) {
            debug!(registration = %name, "Drain already running");
            return;
        }

        let controller = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            controller.drain(&name).await;
            controller.draining.lock().remove(&name);
        });
    }

    async fn drain(&self, name: &str) {
        let mut attempt: u32 = 0;
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                debug!(registration = %name, "Shutting down; drain will resume on restart");
                return;
            }

            // Exit if the registration vanished or was reactivated.
            let registration = match self.store.get_registration(name).await {
                Ok(Some(registration)) => Some(registration),
                Ok(None) => {
                    debug!(registration = %name, "Registration already removed");
                    return;
                }
                Err(e) => {
                    warn!(registration = %name, error = %e, "Failed to read registration");
                    None
                }
            };

            if let Some(registration) = registration {
                if !registration.is_terminating() {
                    info!(registration = %name, "Registration no longer terminating; drain cancelled");
                    return;
                }

                match self.attempt(&registration).await {
                    Ok(TerminationState::Removed) => {
                        info!(registration = %name, attempts = attempt + 1, "Registration removed");
                        if let Err(e) = self.routes.refresh().await {
                            warn!(registration = %name, error = %e, "Failed to refresh routes after removal");
                        }
                        return;
                    }
                    Ok(state) => {
                        debug!(registration = %name, state = %state, "Drain incomplete");
                    }
                    Err(e) => {
                        warn!(registration = %name, attempt = attempt + 1, error = %e, "Drain attempt failed");
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.backoff(attempt);
            debug!(registration = %name, delay = ?delay, "Retrying drain");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn attempt(&self, registration: &Registration) -> Result<TerminationState, StoreError> {
        let scope = StorageScope::for_registration(registration);
        let remaining = self.drain_step(&scope).await?;
        if remaining > 0 {
            debug!(registration = %registration.name(), remaining, "Instances remain");
            return Ok(TerminationState::Terminating);
        }
        self.finalize(registration.name()).await
    }

    /// Resume drains already in progress, then follow registration events
    /// (and a periodic sweep) so every terminating registration has a worker.
    pub async fn run(self: Arc<Self>, resync_interval: Duration) {
        let mut shutdown = self.shutdown.clone();
        let mut events = self.store.watch_registrations();
        let mut sweep = tokio::time::interval(resync_interval);
        info!("Starting termination controller");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                // First tick is immediate and resumes drains left over from a restart.
                _ = sweep.tick() => self.resume_all().await,
                event = events.recv() => match event {
                    Ok(event) => {
                        let registration = &event.object;
                        if event.event_type != WatchEventType::Deleted && registration.is_terminating() {
                            self.spawn_drain(registration.name());
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Termination controller fell behind; sweeping");
                        self.resume_all().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("Termination controller stopped");
    }

    async fn resume_all(self: &Arc<Self>) {
        match self.store.list_registrations().await {
            Ok(registrations) => {
                for registration in registrations
                    .iter()
                    .filter(|r| r.is_terminating())
                {
                    self.spawn_drain(registration.name());
                }
            }
            Err(e) => error!(error = %e, "Failed to list registrations for termination sweep"),
        }
    }
}
