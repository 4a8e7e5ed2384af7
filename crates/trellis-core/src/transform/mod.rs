//! # Cross-Modal Transformer
//!
//! Converts between the canonical graph and its two derived modalities:
//!
//! ```text
//! GraphSnapshot ──graph_to_table──▶ TableSnapshot ──encode──▶ VectorSnapshot
//!       ▲                               │  ▲                      │
//!       └─────────table_to_graph────────┘  └────────decode────────┘
//! ```
//!
//! Graph → table → graph is exact. Table → vector → table is exact when the
//! vocabulary was built from the same table, and lossy otherwise; every lossy
//! step returns a [`FidelityReport`]. A report under the configured threshold
//! carries a [`RoundTripFidelityWarning`] but the transform still succeeds.

mod fidelity;
pub mod table;
pub mod vector;

pub use fidelity::{FidelityReport, RoundTripFidelityWarning, fidelity_score};
pub use table::{
    Column, ColumnKind, ColumnManifest, ManifestEntry, RowKind, TableSnapshot, graph_to_table,
    table_to_graph,
};
pub use vector::{Encoding, VectorSnapshot, VocabColumn, Vocabulary};

use crate::graph::GraphSnapshot;
use crate::TrellisError;
use serde::{Deserialize, Serialize};

/// Output of a transform together with what it lost.
#[derive(Debug, Clone, Serialize)]
pub struct Transformed<T> {
    pub output: T,
    pub report: FidelityReport,
}

/// A vector view and the vocabulary that decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorView {
    pub vector: VectorSnapshot,
    pub vocabulary: Vocabulary,
}

/// Threshold-aware front end over the modality conversions.
#[derive(Debug, Clone, Copy)]
pub struct Transformer {
    threshold: f64,
}

impl Transformer {
    pub fn new(fidelity_threshold: f64) -> Result<Self, TrellisError> {
        if !(0.0..=1.0).contains(&fidelity_threshold) {
            return Err(TrellisError::Config(format!(
                "fidelity threshold {fidelity_threshold} must lie in [0, 1]"
            )));
        }
        Ok(Self {
            threshold: fidelity_threshold,
        })
    }

    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Project a graph into a table.
    ///
    /// Without a manifest every attribute gets a column. With one, attributes
    /// it does not list are dropped and reported; the score is the fraction
    /// of attribute values kept.
    #[must_use]
    pub fn graph_to_table(
        &self,
        graph: &GraphSnapshot,
        manifest: Option<&ColumnManifest>,
    ) -> Transformed<TableSnapshot> {
        let manifest = manifest
            .cloned()
            .unwrap_or_else(|| ColumnManifest::from_graph(graph));
        let projection = table::project(graph, manifest);
        let score = if projection.total_values == 0 {
            1.0
        } else {
            projection.captured_values as f64 / projection.total_values as f64
        };
        let report = self.report(projection.dropped_fields, score, "graph_to_table");
        Transformed {
            output: projection.table,
            report,
        }
    }

    /// Rebuild a graph from a table, re-validating relationship endpoints.
    pub fn table_to_graph(&self, table: &TableSnapshot) -> Result<GraphSnapshot, TrellisError> {
        table_to_graph(table)
    }

    /// Encode a table as vectors.
    ///
    /// With no vocabulary one is built from `table` and the round trip is
    /// exact. With an existing vocabulary, unseen categories land in the
    /// out-of-vocabulary slot; the report scores the decoded table against
    /// `table`.
    pub fn table_to_vector(
        &self,
        table: &TableSnapshot,
        vocabulary: Option<&Vocabulary>,
    ) -> Result<Transformed<VectorView>, TrellisError> {
        let vocabulary = vocabulary
            .cloned()
            .unwrap_or_else(|| Vocabulary::from_table(table));
        let encoded = vector::encode(table, &vocabulary);
        let decoded = vector::decode(&encoded.vector, &vocabulary)?;
        let score = fidelity_score(table, &decoded);
        let report = self.report(encoded.dropped_fields, score, "table_to_vector");
        Ok(Transformed {
            output: VectorView {
                vector: encoded.vector,
                vocabulary,
            },
            report,
        })
    }

    /// Decode vectors back into a table.
    pub fn vector_to_table(&self, view: &VectorView) -> Result<TableSnapshot, TrellisError> {
        vector::decode(&view.vector, &view.vocabulary)
    }

    fn report(&self, dropped: Vec<String>, score: f64, direction: &str) -> FidelityReport {
        let report = FidelityReport::new(dropped, score, self.threshold);
        if let Some(warning) = &report.warning {
            tracing::warn!(
                direction,
                fidelity_score = warning.fidelity_score,
                threshold = warning.threshold,
                dropped_fields = warning.dropped_fields,
                "{warning}"
            );
        }
        report
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EndpointPolicy;
    use crate::{Attributes, Entity, Relationship, TypeLabel, UncertaintyRecord, Value};

    fn people(cities: &[&str]) -> GraphSnapshot {
        let mut graph = GraphSnapshot::new();
        let org = Entity::new(
            "Acme Corp",
            TypeLabel::parse("ORG").expect("label"),
            Attributes::new(),
            UncertaintyRecord::from_confidence(0.95, "ner").expect("record"),
        );
        graph.upsert_entity(org.clone());
        for (i, city) in cities.iter().enumerate() {
            let mut attrs = Attributes::new();
            attrs.insert("city".to_string(), Value::Text((*city).to_string()));
            attrs.insert("age".to_string(), Value::Int(30 + i as i64));
            let person = Entity::new(
                format!("person {i}"),
                TypeLabel::parse("PERSON").expect("label"),
                attrs,
                UncertaintyRecord::from_confidence(0.9, "ner").expect("record"),
            );
            let rel = Relationship::new(
                org.internal_id,
                person.internal_id,
                TypeLabel::parse("EMPLOYS").expect("label"),
                Attributes::new(),
                UncertaintyRecord::from_confidence(0.8, "re").expect("record"),
            );
            graph.upsert_entity(person);
            graph
                .insert_relationship(rel, EndpointPolicy::Live)
                .expect("endpoints");
        }
        graph
    }

    #[test]
    fn full_round_trip_through_vectors() {
        let transformer = Transformer::new(0.95).expect("threshold");
        let graph = people(&["Oslo", "Lima", "Oslo"]);
        let table = transformer.graph_to_table(&graph, None);
        assert!(table.report.is_lossless());

        let view = transformer
            .table_to_vector(&table.output, None)
            .expect("encode");
        assert!(view.report.warning.is_none());
        assert!((view.report.fidelity_score - 1.0).abs() < f64::EPSILON);

        let decoded = transformer.vector_to_table(&view.output).expect("decode");
        let back = transformer.table_to_graph(&decoded).expect("graph");
        assert!(graph.is_isomorphic_to(&back));
    }

    #[test]
    fn low_fidelity_warns_but_succeeds() {
        let transformer = Transformer::new(0.999).expect("threshold");
        let base = transformer.graph_to_table(&people(&["Oslo", "Lima"]), None);
        let vocabulary = Vocabulary::from_table(&base.output);

        let mut shifted = base.output.clone();
        let row = shifted
            .rows
            .iter()
            .position(|r| r.iter().any(|v| *v == Value::Text("Lima".to_string())))
            .expect("lima row");
        if let Some(cell) = shifted.rows.get_mut(row).and_then(|r| {
            let idx = base.output.column_index("entity.city")?;
            r.get_mut(idx)
        }) {
            *cell = Value::Text("Quito".to_string());
        }

        let view = transformer
            .table_to_vector(&shifted, Some(&vocabulary))
            .expect("lossy encode still succeeds");
        assert!(view.report.fidelity_score < 1.0);
        let warning = view.report.warning.expect("warning");
        assert!((warning.threshold - 0.999).abs() < f64::EPSILON);
    }

    #[test]
    fn threshold_must_be_unit_interval() {
        assert!(Transformer::new(1.5).is_err());
        assert!(Transformer::new(-0.1).is_err());
        assert!(Transformer::new(0.0).is_ok());
    }
}
