//! HTTP service
//!
//! `GET /health` reports the active backend; `POST /api/decompose` accepts a multipart
//! upload and returns the layers produced by the configured backend.

mod error;
mod handlers;

pub use self::error::ApiError;
pub use self::handlers::{DecomposeResponse, HealthResponse};

use crate::backends::{DecompositionBackend, FalBackend, LocalBackend};
use crate::config::{BackendKind, ServiceConfig};
use crate::error::{LayerFlowError, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared, read-only state for all requests
#[derive(Clone)]
pub struct AppState {
    config: Arc<ServiceConfig>,
    remote: Arc<dyn DecompositionBackend>,
    local: Arc<dyn DecompositionBackend>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("mode", &self.config.mode_label())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// State with the fal.ai and local backends built from `config`
    ///
    /// Nothing heavy happens here; the local pipeline loads on its first request.
    ///
    /// # Errors
    /// - Failed to create the HTTP client
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let remote = FalBackend::new(config.remote.clone())?;
        let local = LocalBackend::from_config(&config.local);
        Ok(Self::with_backends(config, Arc::new(remote), Arc::new(local)))
    }

    /// State with caller-provided backends
    #[must_use]
    pub fn with_backends(
        config: ServiceConfig,
        remote: Arc<dyn DecompositionBackend>,
        local: Arc<dyn DecompositionBackend>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            remote,
            local,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Backend selected by the startup configuration
    #[must_use]
    pub fn backend(&self) -> Arc<dyn DecompositionBackend> {
        match self.config.backend_kind() {
            BackendKind::Remote => Arc::clone(&self.remote),
            BackendKind::Local => Arc::clone(&self.local),
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let body_limit = state.config().max_upload_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/decompose", post(handlers::decompose))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until Ctrl-C
///
/// # Errors
/// - Invalid bind address or the port is unavailable
/// - Failed to create the backends
pub async fn serve(config: ServiceConfig) -> Result<()> {
    let addr = config.bind_addr()?;
    let mode = config.mode_label();
    let app = router(AppState::new(config)?);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| LayerFlowError::file_io_error("bind", addr.to_string(), &e))?;
    tracing::info!(%addr, mode, "LayerFlow API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
