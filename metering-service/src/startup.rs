//! Application startup and lifecycle management.

use crate::api::MeteringApi;
use crate::config::MeteringConfig;
use crate::context::{MeteringContext, StorageHandle};
use crate::services::{get_metrics, init_metrics};
use axum::{extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: MeteringConfig,
    pub api: MeteringApi,
    pub storage: StorageHandle,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    storage: StorageHandle,
}

/// Health check endpoint for Docker/K8s liveness checks.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "metering-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - storage unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "metering-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness checks.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    shutdown: CancellationToken,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MeteringConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let (ctx, storage) = MeteringContext::build(&config, run_migrations)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, storage = config.storage.as_str(), "Failed to build metering context");
                e
            })?;

        let shutdown = CancellationToken::new();
        let api = MeteringApi::with_shutdown(ctx, shutdown.clone());

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Metering service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            shutdown,
            state: AppState {
                config,
                api,
                storage,
            },
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn api(&self) -> &MeteringApi {
        &self.state.api
    }

    pub fn config(&self) -> &MeteringConfig {
        &self.state.config
    }

    /// Token cancelled on shutdown; running sweeps stop at the next
    /// subscription boundary.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve the health and metrics endpoints until the shutdown token fires.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            storage: self.state.storage.clone(),
        };

        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        tracing::info!(
            service = "metering-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let shutdown = self.shutdown.clone();
        axum::serve(self.http_listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}
