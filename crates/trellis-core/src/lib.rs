//! # trellis-core
//!
//! The knowledge representation engine of Trellis - THE LOGIC.
//!
//! Entity/relationship extractions go in; a canonical knowledge graph comes
//! out, persisted atomically across two stores and viewable as a table or a
//! vector matrix on demand.
//!
//! ## Components
//!
//! - `uncertainty`: sequential and Dempster-Shafer combination of confidence
//! - `transform`: graph ⇄ table ⇄ vector with fidelity reporting
//! - `txn`: two-phase commit across the graph and relational stores
//! - `pool`: bounded, health-checked connection pools
//! - `mapper`: bidirectional internal ⇄ native id mapping
//!
//! ## Architectural Constraints
//!
//! - Synchronous: no async runtime, no network dependencies
//! - No globals: `engine::Engine` wires every component explicitly
//! - The graph is canonical; table and vector views are always derived
//!   from it, never from raw input

// =============================================================================
// MODULES
// =============================================================================

pub mod config;
pub mod engine;
pub mod graph;
pub mod ingest;
pub mod mapper;
pub mod pool;
pub mod primitives;
pub mod storage;
pub mod transform;
pub mod txn;
pub mod types;
pub mod uncertainty;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Attributes, Entity, ErrorCode, InternalId, Relationship, SnapshotId, StoreKind, TrellisError,
    TxId, TypeLabel, Value, validate_canonical_name,
};

// =============================================================================
// RE-EXPORTS: Components
// =============================================================================

pub use config::EngineConfig;
pub use engine::{Engine, EngineStatus, HealthReport, SnapshotInfo};
pub use graph::{EndpointPolicy, GraphSnapshot};
pub use ingest::{ExtractionBatch, Ingestor, WriteReceipt};
pub use mapper::{IdMapper, Resolution};
pub use pool::{ConnectionLease, Pool, PoolStats};
pub use transform::{FidelityReport, RoundTripFidelityWarning, Transformed, Transformer};
pub use txn::{CommitOutcome, TransactionManager, TxState};
pub use uncertainty::{
    BeliefMass, CombinationMethod, UncertaintyRecord, combine_parallel, combine_sequential,
};
