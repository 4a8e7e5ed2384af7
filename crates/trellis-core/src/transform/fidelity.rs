//! Round-trip fidelity measurement.

use super::table::TableSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fraction of `original` cells reproduced by `reconstructed`.
///
/// Cells are matched by column name and row position and compared with
/// [`crate::Value::same_content`]. Missing columns or rows count as
/// mismatches. An empty table scores `1.0`.
#[must_use]
pub fn fidelity_score(original: &TableSnapshot, reconstructed: &TableSnapshot) -> f64 {
    let total = original.cell_count();
    if total == 0 {
        return 1.0;
    }
    let mut matched = 0usize;
    for (col_idx, column) in original.columns.iter().enumerate() {
        let Some(other_idx) = reconstructed.column_index(&column.name) else {
            continue;
        };
        for (row, other_row) in original.rows.iter().zip(&reconstructed.rows) {
            if let (Some(a), Some(b)) = (row.get(col_idx), other_row.get(other_idx)) {
                if a.same_content(b) {
                    matched += 1;
                }
            }
        }
    }
    matched as f64 / total as f64
}

/// Raised, never thrown, when a round trip falls below the configured bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTripFidelityWarning {
    pub fidelity_score: f64,
    pub threshold: f64,
    pub dropped_fields: usize,
}

impl fmt::Display for RoundTripFidelityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "round-trip fidelity {:.4} below threshold {:.4} ({} dropped fields)",
            self.fidelity_score, self.threshold, self.dropped_fields
        )
    }
}

/// What a transform lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FidelityReport {
    pub dropped_fields: Vec<String>,
    pub fidelity_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<RoundTripFidelityWarning>,
}

impl FidelityReport {
    /// Build a report, attaching a warning when the score is under
    /// `threshold` or anything was dropped.
    #[must_use]
    pub fn new(dropped_fields: Vec<String>, fidelity_score: f64, threshold: f64) -> Self {
        let warning = (fidelity_score < threshold || !dropped_fields.is_empty()).then(|| {
            RoundTripFidelityWarning {
                fidelity_score,
                threshold,
                dropped_fields: dropped_fields.len(),
            }
        });
        Self {
            dropped_fields,
            fidelity_score,
            warning,
        }
    }

    #[must_use]
    pub fn is_lossless(&self) -> bool {
        self.dropped_fields.is_empty() && self.fidelity_score >= 1.0
    }
}
