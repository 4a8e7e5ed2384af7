//! # Error Types
//!
//! - No silent failures
//! - Use `Result<T, TrellisError>` for fallible operations
//! - Every error carries a machine-readable [`ErrorCode`] so retry logic can
//!   tell recoverable failures from terminal ones

use super::{InternalId, StoreKind, TxId};
use crate::txn::TxState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidUncertainty,
    InvalidInput,
    IdentityCollision,
    PoolExhausted,
    LeaseViolation,
    PrepareFailed,
    Aborted,
    PartialCommitPending,
    InvalidTransition,
    Transform,
    NotFound,
    Storage,
    Io,
    Serialization,
    Config,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUncertainty => "INVALID_UNCERTAINTY",
            Self::InvalidInput => "INVALID_INPUT",
            Self::IdentityCollision => "IDENTITY_COLLISION",
            Self::PoolExhausted => "POOL_EXHAUSTED",
            Self::LeaseViolation => "LEASE_VIOLATION",
            Self::PrepareFailed => "PREPARE_FAILED",
            Self::Aborted => "ABORTED",
            Self::PartialCommitPending => "PARTIAL_COMMIT_PENDING",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::Transform => "TRANSFORM",
            Self::NotFound => "NOT_FOUND",
            Self::Storage => "STORAGE",
            Self::Io => "IO",
            Self::Serialization => "SERIALIZATION",
            Self::Config => "CONFIG",
        }
    }
}

/// Errors that can occur in the Trellis engine.
#[derive(Debug, Error)]
pub enum TrellisError {
    /// A confidence or uncertainty value is malformed. Caller's fault.
    #[error("Invalid uncertainty {value}: {reason}")]
    InvalidUncertainty { value: f64, reason: String },

    /// Extraction input failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Two distinct canonical names map to the same native id of a store.
    #[error(
        "Identity collision in {store} store: native id '{native_id}' already belongs to {existing}, refusing '{requested}'"
    )]
    IdentityCollision {
        store: StoreKind,
        native_id: String,
        existing: InternalId,
        requested: String,
    },

    /// No connection became available before the acquire timeout.
    #[error("Connection pool for {store} store exhausted after {waited_ms} ms")]
    PoolExhausted { store: StoreKind, waited_ms: u64 },

    /// A lease was released by a non-owner, released twice, or used after expiry.
    #[error("Lease {lease_id} on {store} store misused: {reason}")]
    LeaseViolation {
        store: StoreKind,
        lease_id: u64,
        reason: String,
    },

    /// A participant could not stage its writes; the transaction was aborted.
    #[error("Transaction {tx_id}: prepare failed on {participant} store: {reason}")]
    PrepareFailed {
        tx_id: TxId,
        participant: StoreKind,
        reason: String,
    },

    /// The transaction was rolled back on every participant.
    #[error("Transaction {tx_id} aborted: {reason}")]
    Aborted { tx_id: TxId, reason: String },

    /// At least one participant committed and another has not yet.
    #[error("Transaction {tx_id} partially committed; {pending} commit retry pending")]
    PartialCommitPending { tx_id: TxId, pending: StoreKind },

    /// A 2PC state transition was attempted out of order.
    #[error("Transaction {tx_id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition { tx_id: TxId, from: TxState, to: TxState },

    /// A cross-modal transform could not reconstruct its output.
    #[error("Transform error: {0}")]
    Transform(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A backing store reported an error.
    #[error("{store} store error: {message}")]
    Storage { store: StoreKind, message: String },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TrellisError {
    /// Shorthand for a graph store failure.
    pub fn graph(e: impl std::fmt::Display) -> Self {
        Self::Storage {
            store: StoreKind::Graph,
            message: e.to_string(),
        }
    }

    /// Shorthand for a relational store failure.
    pub fn relational(e: impl std::fmt::Display) -> Self {
        Self::Storage {
            store: StoreKind::Relational,
            message: e.to_string(),
        }
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUncertainty { .. } => ErrorCode::InvalidUncertainty,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::IdentityCollision { .. } => ErrorCode::IdentityCollision,
            Self::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            Self::LeaseViolation { .. } => ErrorCode::LeaseViolation,
            Self::PrepareFailed { .. } => ErrorCode::PrepareFailed,
            Self::Aborted { .. } => ErrorCode::Aborted,
            Self::PartialCommitPending { .. } => ErrorCode::PartialCommitPending,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::Transform(_) => ErrorCode::Transform,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Storage { .. } => ErrorCode::Storage,
            Self::Io(_) => ErrorCode::Io,
            Self::Serialization(_) => ErrorCode::Serialization,
            Self::Config(_) => ErrorCode::Config,
        }
    }

    /// Whether the same request may succeed if retried later.
    ///
    /// Validation failures and identity collisions are terminal: they need a
    /// different request, not another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::PrepareFailed { .. }
                | Self::Aborted { .. }
                | Self::PartialCommitPending { .. }
                | Self::Storage { .. }
                | Self::Io(_)
        )
    }

    /// The transaction this error belongs to, if any.
    #[must_use]
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            Self::PrepareFailed { tx_id, .. }
            | Self::Aborted { tx_id, .. }
            | Self::PartialCommitPending { tx_id, .. }
            | Self::InvalidTransition { tx_id, .. } => Some(*tx_id),
            _ => None,
        }
    }

    /// The entity this error belongs to, if any.
    #[must_use]
    pub fn internal_id(&self) -> Option<InternalId> {
        match self {
            Self::IdentityCollision { existing, .. } => Some(*existing),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrellisError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<postcard::Error> for TrellisError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for TrellisError {
    fn from(e: rusqlite::Error) -> Self {
        Self::relational(e)
    }
}

// =============================================================================
// TESTS
// =============================================================================
