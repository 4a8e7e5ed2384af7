//! # API Endpoint Handlers
//!
//! Every engine call blocks on storage I/O, so handlers hand it to the
//! tokio blocking pool and await the result.

use super::{
    AppState,
    types::{ApiError, EntityResponse, HealthResponse, TableViewResponse, VectorViewResponse},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use std::sync::Arc;
use trellis_core::{Engine, InternalId, SnapshotId, TrellisError};

/// Run `f` against the engine on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Engine) -> Result<T, TrellisError> + Send + 'static,
    T: Send + 'static,
{
    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| ApiError(TrellisError::Io(format!("engine task failed: {e}"))))?
        .map_err(ApiError)
}

// =============================================================================
// HEALTH & STATUS
// =============================================================================

/// Probe both stores. 503 when either is unreachable.
pub async fn health_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let report = blocking(&state, |engine| Ok(engine.health())).await?;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(HealthResponse::from(report))))
}

/// Store counts, pool statistics and pending transactions.
pub async fn status_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let status = blocking(&state, Engine::status).await?;
    Ok(Json(status))
}

// =============================================================================
// WRITES
// =============================================================================

/// Ingest one extraction batch.
///
/// The body is read as text so malformed JSON gets the same structured
/// error as any other rejected batch.
pub async fn ingest_handler(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = blocking(&state, move |engine| engine.ingest_json(&body)).await?;
    Ok(Json(receipt))
}

pub async fn retire_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let internal_id = InternalId::parse(&id)?;
    let receipt = blocking(&state, move |engine| engine.retire_entity(internal_id)).await?;
    Ok(Json(receipt))
}

/// Finish transactions whose commit is still pending on a store.
pub async fn retry_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let report = blocking(&state, |engine| Ok(engine.retry_pending())).await?;
    Ok(Json(report))
}

// =============================================================================
// READS
// =============================================================================

pub async fn entity_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let internal_id = InternalId::parse(&id)?;
    let response = blocking(&state, move |engine| {
        Ok(EntityResponse {
            entity: engine.entity(internal_id)?,
            uncertainty_history: engine.uncertainty_history(internal_id)?,
        })
    })
    .await?;
    Ok(Json(response))
}

// =============================================================================
// SNAPSHOTS & VIEWS
// =============================================================================

/// Capture the current graph.
pub async fn snapshot_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let info = blocking(&state, Engine::snapshot).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_snapshots_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshots = blocking(&state, |engine| Ok(engine.snapshots())).await?;
    Ok(Json(snapshots))
}

pub async fn table_view_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot_id = SnapshotId::parse(&id)?;
    let view = blocking(&state, move |engine| engine.table_view(snapshot_id)).await?;
    Ok(Json(TableViewResponse {
        graph_snapshot_id: snapshot_id,
        table: view.output,
        fidelity_report: view.report,
    }))
}

pub async fn vector_view_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot_id = SnapshotId::parse(&id)?;
    let view = blocking(&state, move |engine| engine.vector_view(snapshot_id)).await?;
    Ok(Json(VectorViewResponse {
        graph_snapshot_id: snapshot_id,
        vector: view.output,
        fidelity_report: view.report,
    }))
}
