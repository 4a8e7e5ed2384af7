//! # Engine Primitives
//!
//! Fixed constants of the engine: format markers and input limits.
//! Tunable behaviour (pool sizes, timeouts, thresholds) lives in
//! [`crate::config::EngineConfig`], never here.

/// Magic bytes of the transaction write-ahead log.
pub const WAL_MAGIC: &[u8; 4] = b"TXWL";

/// Current write-ahead log format version.
///
/// Increment this when making breaking changes to the frame encoding.
pub const WAL_VERSION: u8 = 1;

/// Maximum encoded size of a single log frame.
///
/// A length prefix above this is treated as a torn or corrupted frame.
pub const MAX_WAL_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Tolerance for belief masses summing to 1 and for total-conflict detection.
pub const MASS_EPSILON: f64 = 1e-9;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for canonical entity names.
pub const MAX_NAME_LENGTH: usize = 1024;

/// Maximum length for entity and relationship type labels.
pub const MAX_LABEL_LENGTH: usize = 64;

/// Maximum length for attribute names.
pub const MAX_ATTRIBUTE_LENGTH: usize = 256;

/// Maximum number of entities plus relationships in one extraction batch.
pub const MAX_BATCH_SIZE: usize = 10_000;
