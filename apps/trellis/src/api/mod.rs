//! # Trellis HTTP API Module
//!
//! The HTTP REST API server, built on axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Pool health per store
//! - `GET /status` - Counts, pool statistics, pending transactions
//! - `POST /ingest` - Ingest an extraction batch
//! - `GET /entities/{id}` - An entity and its uncertainty history
//! - `POST /entities/{id}/retire` - Retire an entity
//! - `POST /snapshots` - Capture a graph snapshot
//! - `GET /snapshots` - List captured snapshots
//! - `GET /snapshots/{id}/table-view` - Table projection of a snapshot
//! - `GET /snapshots/{id}/vector-view` - Vector encoding of a snapshot
//! - `POST /transactions/retry` - Finish pending commits
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `TRELLIS_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `TRELLIS_API_KEY`: If set, requires Bearer token authentication

mod auth;
mod handlers;
mod types;

pub use auth::get_api_key_from_env;
pub use types::{
    ApiError, EntityResponse, ErrorResponse, HealthResponse, TableViewResponse,
    VectorViewResponse, status_for,
};

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use trellis_core::{Engine, TrellisError};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state. The engine synchronizes internally.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build CORS layer from `TRELLIS_CORS_ORIGINS`.
///
/// - `*`: any origin
/// - unset: localhost only
/// - otherwise: the comma-separated origins that parse
fn build_cors_layer() -> CorsLayer {
    let origins_env = std::env::var("TRELLIS_CORS_ORIGINS").ok();

    match origins_env.as_deref() {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins (TRELLIS_CORS_ORIGINS=*)");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => Some(hv),
                        Err(e) => {
                            tracing::warn!(origin = trimmed, error = %e, "CORS: invalid origin");
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!("CORS: no valid origins in TRELLIS_CORS_ORIGINS, using localhost");
                build_localhost_cors()
            } else {
                CorsLayer::new()
                    .allow_origin(allowed_origins)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            }
        }
        None => build_localhost_cors(),
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner): tracing, CORS, body limit,
/// authentication (when `TRELLIS_API_KEY` is set).
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer();

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED: set TRELLIS_API_KEY to require a bearer token"
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/ingest", post(handlers::ingest_handler))
        .route("/entities/{id}", get(handlers::entity_handler))
        .route("/entities/{id}/retire", post(handlers::retire_handler))
        .route(
            "/snapshots",
            post(handlers::snapshot_handler).get(handlers::list_snapshots_handler),
        )
        .route(
            "/snapshots/{id}/table-view",
            get(handlers::table_view_handler),
        )
        .route(
            "/snapshots/{id}/vector-view",
            get(handlers::vector_view_handler),
        )
        .route("/transactions/retry", post(handlers::retry_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Periodically finish commits left pending on a store.
fn spawn_commit_retrier(engine: Arc<Engine>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let engine = Arc::clone(&engine);
            match tokio::task::spawn_blocking(move || engine.retry_pending()).await {
                Ok(report) if !report.committed.is_empty() => {
                    tracing::info!(committed = report.committed.len(), "pending commits finished");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "commit retry task failed"),
            }
        }
    })
}

/// Serve until Ctrl+C, then shut the engine down.
pub async fn run_server(
    addr: &str,
    engine: Arc<Engine>,
    retry_every: Duration,
) -> Result<(), TrellisError> {
    let retrier = spawn_commit_retrier(Arc::clone(&engine), retry_every);
    let router = create_router(AppState::new(Arc::clone(&engine)));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| TrellisError::Io(format!("bind {addr} failed: {e}")))?;

    tracing::info!(%addr, "Trellis HTTP server listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|e| TrellisError::Io(format!("server error: {e}")));

    retrier.abort();
    engine.shutdown();
    served
}
