//! # Storage Backends
//!
//! Two physical stores sit behind the engine:
//!
//! - [`graph_store`]: redb-backed property graph, the canonical modality
//! - [`relational`]: SQLite file with id mappings, provenance and the
//!   uncertainty audit log
//!
//! Both are reached only through pooled connections.

pub mod graph_store;
pub mod relational;

pub use graph_store::{GraphConnection, GraphConnector, GraphStore, GraphWrite, StagedGraphWrite};
pub use relational::{
    IdMapping, RelationalConnection, RelationalConnector, RelationalCounts, RelationalStore,
    RelationalWrite, UncertaintyLogEntry,
};

use crate::pool::Pool;
use crate::{StoreKind, TypeLabel};

pub type GraphPool = Pool<GraphConnector>;
pub type RelationalPool = Pool<RelationalConnector>;

/// The identifier a store uses natively for an entity.
///
/// The graph MERGEs on the case-folded canonical name alone, so two entity
/// types sharing a name collide there. The relational store keys on
/// `TYPE:name`.
#[must_use]
pub fn native_id(store: StoreKind, entity_type: &TypeLabel, canonical_name: &str) -> String {
    match store {
        StoreKind::Graph => canonical_name.trim().to_lowercase(),
        StoreKind::Relational => format!("{entity_type}:{canonical_name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_native_id_is_case_folded() {
        let org = TypeLabel::parse("ORG").expect("label");
        assert_eq!(native_id(StoreKind::Graph, &org, " Acme Corp "), "acme corp");
        assert_eq!(
            native_id(StoreKind::Relational, &org, "Acme Corp"),
            "ORG:Acme Corp"
        );
    }
}
