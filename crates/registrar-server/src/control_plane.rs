//! Wiring of the registration subsystem
//!
//! The value-space index is created here and handed by reference to the
//! reconciler (its only writer) and to the route refresher (a reader).

use crate::config::RegistrarConfig;
use crate::handlers::{RegistrationHandler, builtin_owner, registration_type_spec};
use crate::reconciler::ConflictReconciler;
use crate::router::{DelegatingRouter, RouteRefresher, RouteSnapshot, StaticHandler, StaticRoute};
use crate::store::{InstanceStore, MemoryInstanceStore, MemoryStore, RegistrationStore};
use crate::termination::TerminationController;
use crate::value_space::ValueSpace;
use anyhow::{Context, anyhow};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct ControlPlane {
    config: RegistrarConfig,
    registrations: Arc<dyn RegistrationStore>,
    instances: Arc<dyn InstanceStore>,
    values: ValueSpace,
    refresher: Arc<RouteRefresher>,
    reconciler: Arc<ConflictReconciler>,
    termination: Arc<TerminationController>,
    router: Arc<DelegatingRouter>,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlPlane {
    pub fn new(
        config: RegistrarConfig,
        registrations: Arc<dyn RegistrationStore>,
        instances: Arc<dyn InstanceStore>,
    ) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let values = ValueSpace::new();
        let snapshot = Arc::new(RouteSnapshot::new());
        let refresher = Arc::new(RouteRefresher::new(
            registrations.clone(),
            values.clone(),
            snapshot.clone(),
        ));

        let reconciler = Arc::new(ConflictReconciler::new(
            registrations.clone(),
            values.clone(),
            refresher.clone(),
            config.reconciler.resync_interval(),
        ));
        let termination = Arc::new(TerminationController::new(
            registrations.clone(),
            instances.clone(),
            refresher.clone(),
            config.termination.clone(),
            shutdown_rx,
        ));

        let static_chain = StaticHandler::new().with_route(StaticRoute::new(
            registration_type_spec(),
            Arc::new(RegistrationHandler::new(
                registrations.clone(),
                termination.clone(),
            )),
        ));
        for route in static_chain.routes() {
            let owner = builtin_owner(&route.spec);
            values.reserve(&owner, &route.spec).map_err(|conflict| {
                anyhow!("built-in type {} cannot be reserved: {}", owner, conflict)
            })?;
            debug!(owner = %owner, "Reserved built-in identifiers");
        }

        let router = Arc::new(DelegatingRouter::new(
            snapshot,
            instances.clone(),
            static_chain,
        ));

        Ok(Self {
            config,
            registrations,
            instances,
            values,
            refresher,
            reconciler,
            termination,
            router,
            shutdown_tx,
        })
    }

    /// Control plane over in-memory stores
    pub fn in_memory(config: RegistrarConfig) -> anyhow::Result<Self> {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryInstanceStore::new()),
        )
    }

    /// Publish the initial route table and spawn the background workers
    pub async fn start(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        self.refresher
            .refresh()
            .await
            .context("failed to build the initial route table")?;

        let shutdown = self.shutdown_tx.subscribe();
        let reconciler = tokio::spawn(self.reconciler.clone().run(shutdown));
        let termination = tokio::spawn(
            self.termination
                .clone()
                .run(self.config.reconciler.resync_interval()),
        );

        info!("Control plane started");
        Ok(vec![reconciler, termination])
    }

    /// Ask every background worker to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<DelegatingRouter> {
        &self.router
    }

    pub fn registrations(&self) -> &Arc<dyn RegistrationStore> {
        &self.registrations
    }

    pub fn instances(&self) -> &Arc<dyn InstanceStore> {
        &self.instances
    }

    pub fn values(&self) -> &ValueSpace {
        &self.values
    }

    pub fn reconciler(&self) -> &Arc<ConflictReconciler> {
        &self.reconciler
    }

    pub fn termination(&self) -> &Arc<TerminationController> {
        &self.termination
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}
