//! # API Request/Response Types
//!
//! JSON bodies of the HTTP API and the mapping from engine errors to HTTP
//! responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use trellis_core::storage::UncertaintyLogEntry;
use trellis_core::transform::{TableSnapshot, VectorView};
use trellis_core::{
    Entity, ErrorCode, FidelityReport, HealthReport, InternalId, SnapshotId, TrellisError, TxId,
};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub graph: bool,
    pub relational: bool,
}

impl From<HealthReport> for HealthResponse {
    fn from(report: HealthReport) -> Self {
        Self {
            status: if report.is_healthy() { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            graph: report.graph,
            relational: report.relational,
        }
    }
}

// =============================================================================
// ENTITY RESPONSE
// =============================================================================

/// An entity with its uncertainty audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct EntityResponse {
    pub entity: Entity,
    pub uncertainty_history: Vec<UncertaintyLogEntry>,
}

// =============================================================================
// VIEW RESPONSES
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TableViewResponse {
    pub graph_snapshot_id: SnapshotId,
    pub table: TableSnapshot,
    pub fidelity_report: FidelityReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorViewResponse {
    pub graph_snapshot_id: SnapshotId,
    pub vector: VectorView,
    pub fidelity_report: FidelityReport,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Body of every failed request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<TxId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_id: Option<InternalId>,
}

/// An engine error on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub TrellisError);

impl From<TrellisError> for ApiError {
    fn from(e: TrellisError) -> Self {
        Self(e)
    }
}

/// HTTP status for an error code.
#[must_use]
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidUncertainty | ErrorCode::InvalidInput | ErrorCode::Transform => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::IdentityCollision | ErrorCode::InvalidTransition => StatusCode::CONFLICT,
        ErrorCode::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let e = self.0;
        let code = e.code();
        let status = status_for(code);
        if status.is_server_error() {
            tracing::error!(code = code.as_str(), "{e}");
        } else {
            tracing::debug!(code = code.as_str(), "{e}");
        }
        let body = ErrorResponse {
            code,
            message: e.to_string(),
            retryable: e.is_retryable(),
            tx_id: e.tx_id(),
            internal_id: e.internal_id(),
        };
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::StoreKind;

    #[test]
    fn caller_faults_are_client_errors() {
        assert_eq!(status_for(ErrorCode::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorCode::InvalidUncertainty),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(ErrorCode::IdentityCollision), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorCode::PoolExhausted),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ErrorCode::PartialCommitPending),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_body_carries_transaction_id() {
        let tx_id = TxId::new_v4();
        let response = ApiError(TrellisError::PrepareFailed {
            tx_id,
            participant: StoreKind::Relational,
            reason: "disk full".to_string(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = ErrorResponse {
            code: ErrorCode::PrepareFailed,
            message: String::new(),
            retryable: true,
            tx_id: Some(tx_id),
            internal_id: None,
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["code"], "PREPARE_FAILED");
        assert_eq!(json["tx_id"], tx_id.to_string());
        assert!(json.get("internal_id").is_none());
    }
}
