//! # Uncertainty Module
//!
//! Uncertainty propagation across pipeline stages and evidence sources.
//!
//! Two composition rules:
//! - **Sequential**: stages applied one after another fail independently, so
//!   the combined uncertainty is `1 - Π(1 - u_i)`.
//! - **Parallel**: independent evidence about the same claim is fused with
//!   Dempster's rule over `{support, reject, uncertain}` belief masses.
//!
//! Every combination keeps its ordered inputs and a justification string, so
//! a stored value can always be audited and recomputed.
//!
//! `UncertaintyRecord::value` is an *uncertainty*: `0.0` is certain, `1.0` is
//! no information. Use [`UncertaintyRecord::confidence`] for `1 - value`.

use crate::TrellisError;
use crate::primitives::MASS_EPSILON;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

// =============================================================================
// VALIDATION
// =============================================================================

fn check_unit(value: f64, what: &str) -> Result<f64, TrellisError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(TrellisError::InvalidUncertainty {
            value,
            reason: format!("{what} must lie in [0, 1]"),
        })
    }
}

// =============================================================================
// SEQUENTIAL COMPOSITION
// =============================================================================

/// Combine per-stage uncertainties of a sequential pipeline.
///
/// Returns `1 - Π(1 - u_i)`; an empty pipeline is certain (`0.0`).
/// The result always lies in `[max(u_i), 1]` and is `0.0` only when every
/// stage is deterministic.
pub fn combine_sequential(components: &[f64]) -> Result<f64, TrellisError> {
    let mut max_component: f64 = 0.0;
    let mut log_survival = 0.0;
    for &u in components {
        check_unit(u, "stage uncertainty")?;
        max_component = max_component.max(u);
        log_survival += (-u).ln_1p();
    }
    let combined = -log_survival.exp_m1();
    // Rounding in ln_1p/exp_m1 can land a hair below the largest input.
    Ok(combined.clamp(max_component, 1.0))
}

// =============================================================================
// PARALLEL COMPOSITION (DEMPSTER-SHAFER)
// =============================================================================

/// A Dempster-Shafer mass assignment over `{support, reject, uncertain}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeliefMass {
    pub support: f64,
    pub reject: f64,
    pub uncertain: f64,
}

impl BeliefMass {
    /// Create a mass assignment; the three masses must each lie in `[0, 1]`
    /// and sum to 1.
    pub fn new(support: f64, reject: f64, uncertain: f64) -> Result<Self, TrellisError> {
        check_unit(support, "support mass")?;
        check_unit(reject, "reject mass")?;
        check_unit(uncertain, "uncertain mass")?;
        let sum = support + reject + uncertain;
        if (sum - 1.0).abs() > MASS_EPSILON {
            return Err(TrellisError::InvalidUncertainty {
                value: sum,
                reason: "belief masses must sum to 1".to_string(),
            });
        }
        Ok(Self {
            support,
            reject,
            uncertain,
        })
    }

    /// The vacuous assignment: no evidence either way.
    #[must_use]
    pub const fn vacuous() -> Self {
        Self {
            support: 0.0,
            reject: 0.0,
            uncertain: 1.0,
        }
    }

    /// Mass for a detector that reports confidence `c` and never rejects.
    pub fn from_confidence(confidence: f64) -> Result<Self, TrellisError> {
        let c = check_unit(confidence, "confidence")?;
        Ok(Self {
            support: c,
            reject: 0.0,
            uncertain: 1.0 - c,
        })
    }

    /// Conflict mass `K` between two assignments.
    #[must_use]
    pub fn conflict(&self, other: &BeliefMass) -> f64 {
        self.support * other.reject + self.reject * other.support
    }

    /// Dempster's rule of combination.
    ///
    /// Under total conflict (`K >= 1`) the result is vacuous instead of a
    /// division by zero. Otherwise the combined masses are normalized by
    /// their own sum, which is `1 - K` for inputs summing to 1 and stays
    /// exact when `K` is within rounding of 1. A sum that rounds to zero is
    /// treated as total conflict.
    #[must_use]
    pub fn combine(&self, other: &BeliefMass) -> BeliefMass {
        if self.conflict(other) >= 1.0 {
            return Self::vacuous();
        }
        let support = self.support * other.support
            + self.support * other.uncertain
            + self.uncertain * other.support;
        let reject = self.reject * other.reject
            + self.reject * other.uncertain
            + self.uncertain * other.reject;
        let uncertain = self.uncertain * other.uncertain;
        let total = support + reject + uncertain;
        if total <= 0.0 {
            return Self::vacuous();
        }
        Self {
            support: (support / total).clamp(0.0, 1.0),
            reject: (reject / total).clamp(0.0, 1.0),
            uncertain: (uncertain / total).clamp(0.0, 1.0),
        }
    }

    fn validate(&self) -> Result<(), TrellisError> {
        Self::new(self.support, self.reject, self.uncertain).map(|_| ())
    }
}

/// Outcome of folding several mass assignments.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ParallelOutcome {
    mass: BeliefMass,
    /// Index of the first input whose combination hit total conflict.
    total_conflict_at: Option<usize>,
}

fn fold_parallel(masses: &[BeliefMass]) -> Result<ParallelOutcome, TrellisError> {
    for mass in masses {
        mass.validate()?;
    }
    let Some((first, rest)) = masses.split_first() else {
        return Ok(ParallelOutcome {
            mass: BeliefMass::vacuous(),
            total_conflict_at: None,
        });
    };
    let mut acc = *first;
    let mut total_conflict_at = None;
    for (offset, next) in rest.iter().enumerate() {
        if acc.conflict(next) >= 1.0 && total_conflict_at.is_none() {
            total_conflict_at = Some(offset + 1);
        }
        acc = acc.combine(next);
    }
    Ok(ParallelOutcome {
        mass: acc,
        total_conflict_at,
    })
}

/// Fuse independent evidence about one claim with Dempster's rule, folding
/// left to right.
///
/// An empty input yields the vacuous mass. A pair in total conflict
/// combines to `{0, 0, 1}`, and the masses after it still combine into
/// that.
pub fn combine_parallel(masses: &[BeliefMass]) -> Result<BeliefMass, TrellisError> {
    fold_parallel(masses).map(|outcome| outcome.mass)
}

// =============================================================================
// UNCERTAINTY RECORD
// =============================================================================

/// How an [`UncertaintyRecord`] value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CombinationMethod {
    Sequential,
    ParallelDs,
    Leaf,
}

impl CombinationMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "SEQUENTIAL",
            Self::ParallelDs => "PARALLEL_DS",
            Self::Leaf => "LEAF",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TrellisError> {
        match s {
            "SEQUENTIAL" => Ok(Self::Sequential),
            "PARALLEL_DS" => Ok(Self::ParallelDs),
            "LEAF" => Ok(Self::Leaf),
            other => Err(TrellisError::InvalidInput(format!(
                "unknown combination method '{other}'"
            ))),
        }
    }
}

/// An auditable uncertainty value.
///
/// Components by method:
/// - `LEAF`: `[u]`
/// - `SEQUENTIAL`: the per-stage uncertainties, in stage order
/// - `PARALLEL_DS`: flattened `[support, reject, uncertain]` triples, in
///   evidence order
///
/// Fields are private: the value is always derived from the components, and
/// deserialisation recomputes it rather than trusting the stored number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord", into = "RawRecord")]
pub struct UncertaintyRecord {
    value: f64,
    method: CombinationMethod,
    components: Vec<f64>,
    justification: String,
}

/// Wire form of [`UncertaintyRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRecord {
    value: f64,
    method: CombinationMethod,
    components: Vec<f64>,
    justification: String,
}

impl TryFrom<RawRecord> for UncertaintyRecord {
    type Error = TrellisError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        Self::from_parts(raw.method, raw.components, raw.justification)
    }
}

impl From<UncertaintyRecord> for RawRecord {
    fn from(record: UncertaintyRecord) -> Self {
        Self {
            value: record.value,
            method: record.method,
            components: record.components,
            justification: record.justification,
        }
    }
}

fn fmt_components(components: &[f64]) -> String {
    components
        .iter()
        .map(|c| format!("{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn masses_from_components(components: &[f64]) -> Result<Vec<BeliefMass>, TrellisError> {
    if components.len() % 3 != 0 {
        return Err(TrellisError::InvalidUncertainty {
            value: components.len() as f64,
            reason: "parallel components must be whole [support, reject, uncertain] triples"
                .to_string(),
        });
    }
    components
        .chunks_exact(3)
        .map(|c| BeliefMass::new(c[0], c[1], c[2]))
        .collect()
}

impl UncertaintyRecord {
    /// A single measured uncertainty.
    pub fn leaf(uncertainty: f64, justification: impl Into<String>) -> Result<Self, TrellisError> {
        let u = check_unit(uncertainty, "uncertainty")?;
        Ok(Self {
            value: u,
            method: CombinationMethod::Leaf,
            components: vec![u],
            justification: justification.into(),
        })
    }

    /// A leaf from a detector confidence (`u = 1 - c`).
    pub fn from_confidence(confidence: f64, source: &str) -> Result<Self, TrellisError> {
        let c = check_unit(confidence, "confidence")?;
        Self::leaf(1.0 - c, format!("{source}: confidence {c}"))
    }

    /// Compose named stages sequentially.
    pub fn sequential(stages: &[(&str, f64)]) -> Result<Self, TrellisError> {
        let components: Vec<f64> = stages.iter().map(|(_, u)| *u).collect();
        let value = combine_sequential(&components)?;
        let mut justification = String::from("sequential 1-Π(1-u): ");
        let parts: Vec<String> = stages
            .iter()
            .map(|(stage, u)| format!("{stage}={u}"))
            .collect();
        justification.push_str(&parts.join(", "));
        let _ = write!(justification, " => {value}");
        Ok(Self {
            value,
            method: CombinationMethod::Sequential,
            components,
            justification,
        })
    }

    /// Append one more sequential stage after this record.
    ///
    /// A sequential record is extended in place; any other record becomes the
    /// first component of a new sequential composition.
    pub fn then(&self, stage: &str, uncertainty: f64) -> Result<Self, TrellisError> {
        check_unit(uncertainty, "stage uncertainty")?;
        let mut components = match self.method {
            CombinationMethod::Sequential => self.components.clone(),
            CombinationMethod::Leaf | CombinationMethod::ParallelDs => vec![self.value],
        };
        components.push(uncertainty);
        let value = combine_sequential(&components)?;
        Ok(Self {
            value,
            method: CombinationMethod::Sequential,
            components,
            justification: format!(
                "{}; then {stage}={uncertainty} => {value}",
                self.justification
            ),
        })
    }

    /// Fuse independent evidence records with Dempster's rule.
    pub fn parallel(records: &[UncertaintyRecord]) -> Result<Self, TrellisError> {
        let masses: Vec<BeliefMass> = records.iter().map(UncertaintyRecord::belief).collect();
        Self::from_masses(&masses)
    }

    /// Fuse raw mass assignments with Dempster's rule.
    pub fn from_masses(masses: &[BeliefMass]) -> Result<Self, TrellisError> {
        let outcome = fold_parallel(masses)?;
        let components: Vec<f64> = masses
            .iter()
            .flat_map(|m| [m.support, m.reject, m.uncertain])
            .collect();
        let mut justification = format!(
            "dempster-shafer over {} sources [{}]",
            masses.len(),
            fmt_components(&components)
        );
        if let Some(at) = outcome.total_conflict_at {
            let _ = write!(justification, "; total conflict at source {at}, reset to vacuous");
        }
        let _ = write!(
            justification,
            " => support={} reject={} uncertain={}",
            outcome.mass.support, outcome.mass.reject, outcome.mass.uncertain
        );
        Ok(Self {
            value: 1.0 - outcome.mass.support,
            method: CombinationMethod::ParallelDs,
            components,
            justification,
        })
    }

    /// Rebuild a record from its method and components, recomputing the value.
    pub fn from_parts(
        method: CombinationMethod,
        components: Vec<f64>,
        justification: String,
    ) -> Result<Self, TrellisError> {
        let value = match method {
            CombinationMethod::Leaf => {
                let [u] = components.as_slice() else {
                    return Err(TrellisError::InvalidUncertainty {
                        value: components.len() as f64,
                        reason: "a leaf record has exactly one component".to_string(),
                    });
                };
                check_unit(*u, "uncertainty")?
            }
            CombinationMethod::Sequential => combine_sequential(&components)?,
            CombinationMethod::ParallelDs => {
                let masses = masses_from_components(&components)?;
                1.0 - combine_parallel(&masses)?.support
            }
        };
        Ok(Self {
            value,
            method,
            components,
            justification,
        })
    }

    /// Combined uncertainty in `[0, 1]`.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// `1 - value`.
    #[must_use]
    pub fn confidence(&self) -> f64 {
        1.0 - self.value
    }

    #[must_use]
    pub fn method(&self) -> CombinationMethod {
        self.method
    }

    #[must_use]
    pub fn components(&self) -> &[f64] {
        &self.components
    }

    #[must_use]
    pub fn justification(&self) -> &str {
        &self.justification
    }

    /// Belief mass view of this record.
    ///
    /// Parallel records return their fused mass; others are treated as a
    /// detector that supports the claim with `1 - value` and never rejects it.
    #[must_use]
    pub fn belief(&self) -> BeliefMass {
        if self.method == CombinationMethod::ParallelDs {
            if let Ok(masses) = masses_from_components(&self.components) {
                if let Ok(mass) = combine_parallel(&masses) {
                    return mass;
                }
            }
        }
        BeliefMass {
            support: self.confidence(),
            reject: 0.0,
            uncertain: self.value,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
