//! Registrar control plane
//!
//! Serves dynamically registered API resource types next to the built-in
//! `Registration` type. Pieces, leaves first:
//!
//! - [`value_space`]: which accepted registration owns which identifier
//! - [`reconciler`]: decides acceptance and keeps the index current
//! - [`router`]: routes each request to the static chain or a dynamic handler
//! - [`termination`]: drains a deleted registration's data before removal
//! - [`store`]: registration persistence and the instance storage interface

pub mod api;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod event_manager;
pub mod handlers;
pub mod reconciler;
pub mod router;
pub mod store;
pub mod termination;
pub mod value_space;

#[cfg(test)]
pub mod test_helpers;

pub use config::RegistrarConfig;
pub use control_plane::ControlPlane;

use anyhow::Context;
use router::DelegatingRouter;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<DelegatingRouter>,
    pub control_plane: Arc<ControlPlane>,
}

impl AppState {
    pub fn new(control_plane: Arc<ControlPlane>) -> Self {
        Self {
            router: control_plane.router().clone(),
            control_plane,
        }
    }
}

/// Run an in-memory control plane and its HTTP API until `shutdown` flips to true.
pub async fn run(config: RegistrarConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let control_plane = Arc::new(ControlPlane::in_memory(config)?);
    serve(control_plane, shutdown).await
}

/// Serve an already built control plane
pub async fn serve(
    control_plane: Arc<ControlPlane>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listen = control_plane.config().listen;
    let workers = control_plane.start().await?;

    let app = api::api_router(AppState::new(control_plane.clone()));
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!(address = %listen, "Registrar API listening");

    let shutdown_signal = async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("Shutdown requested");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    control_plane.shutdown();
    for worker in workers {
        let _ = worker.await;
    }
    info!("Shutdown complete");
    Ok(())
}
