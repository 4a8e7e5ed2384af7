//! # Core Type Definitions
//!
//! This module contains the data model shared by every component:
//! - Identifiers (`InternalId`, `TxId`, `SnapshotId`, `StoreKind`)
//! - Type labels for entities and relationships (`TypeLabel`)
//! - Attribute values (`Value`)
//! - Graph records (`Entity`, `Relationship`)
//! - Error types (`TrellisError`, `ErrorCode`)
//!
//! ## Identity
//!
//! Entity ids are UUIDv5 values derived from `(type, canonical name)` and
//! relationship ids from `(source, type, target)`. The same logical record
//! therefore always resolves to the same id, which keeps MERGE writes and
//! log replays idempotent.

mod error;

pub use error::{ErrorCode, TrellisError};

use crate::primitives::{MAX_LABEL_LENGTH, MAX_NAME_LENGTH};
use crate::uncertainty::UncertaintyRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Namespace for deterministic entity/relationship ids.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c84_93a7_4b5e_8c10_5d2e_7a41_c9b3);

/// Immutable engine-wide identifier of an entity or relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InternalId(pub Uuid);

impl InternalId {
    /// Id of the entity `(entity_type, canonical_name)`.
    #[must_use]
    pub fn for_entity(entity_type: &TypeLabel, canonical_name: &str) -> Self {
        let key = format!("entity\u{1f}{}\u{1f}{}", entity_type.as_str(), canonical_name);
        Self(Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()))
    }

    /// Id of the relationship `(source)-[rel_type]->(target)`.
    #[must_use]
    pub fn for_relationship(source: InternalId, rel_type: &TypeLabel, target: InternalId) -> Self {
        let key = format!("rel\u{1f}{}\u{1f}{}\u{1f}{}", source.0, rel_type.as_str(), target.0);
        Self(Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()))
    }

    /// Parse from the hyphenated textual form.
    pub fn parse(s: &str) -> Result<Self, TrellisError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TrellisError::InvalidInput(format!("invalid internal id '{s}': {e}")))
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub Uuid);

impl TxId {
    /// A fresh random transaction id.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a captured graph snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, TrellisError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TrellisError::InvalidInput(format!("invalid snapshot id '{s}': {e}")))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The two backing stores.
///
/// The derived order is the commit order: graph first, then relational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreKind {
    Graph,
    Relational,
}

impl StoreKind {
    /// Both stores, in commit order.
    pub const ALL: [StoreKind; 2] = [StoreKind::Graph, StoreKind::Relational];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Relational => "relational",
        }
    }

    /// Parse the lowercase name used in the `id_mapping` table.
    pub fn parse(s: &str) -> Result<Self, TrellisError> {
        match s {
            "graph" => Ok(Self::Graph),
            "relational" => Ok(Self::Relational),
            other => Err(TrellisError::InvalidInput(format!("unknown store '{other}'"))),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// TYPE LABELS
// =============================================================================

/// Type of an entity (`ORG`, `PERSON`) or relationship (`EMPLOYS`).
///
/// Labels are used verbatim as Cypher labels, so they are restricted to
/// `[A-Z][A-Z0-9_]*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeLabel(String);

impl TypeLabel {
    pub fn parse(s: impl Into<String>) -> Result<Self, TrellisError> {
        let s = s.into();
        let mut chars = s.chars();
        let valid_head = chars.next().is_some_and(|c| c.is_ascii_uppercase());
        let valid_tail = chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !valid_head || !valid_tail || s.len() > MAX_LABEL_LENGTH {
            return Err(TrellisError::InvalidInput(format!(
                "type label '{s}' must match [A-Z][A-Z0-9_]* and be at most {MAX_LABEL_LENGTH} bytes"
            )));
        }
        Ok(Self(s))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TypeLabel {
    type Error = TrellisError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<TypeLabel> for String {
    fn from(label: TypeLabel) -> Self {
        label.0
    }
}

impl fmt::Display for TypeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a canonical entity name.
pub fn validate_canonical_name(name: &str) -> Result<(), TrellisError> {
    if name.trim().is_empty() {
        return Err(TrellisError::InvalidInput(
            "canonical name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(TrellisError::InvalidInput(format!(
            "canonical name length {} exceeds maximum {MAX_NAME_LENGTH} bytes",
            name.len()
        )));
    }
    Ok(())
}

// =============================================================================
// VALUE
// =============================================================================

/// Attribute value.
///
/// `Unknown` never comes from input; it is the sentinel produced when a
/// vector cell decodes to an index with no vocabulary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Unknown,
}

impl Value {
    /// Convert a JSON scalar. Arrays and objects are rejected.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, TrellisError> {
        match json {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else {
                    n.as_f64().map(Self::Float).ok_or_else(|| {
                        TrellisError::InvalidInput(format!("unrepresentable number {n}"))
                    })
                }
            }
            serde_json::Value::String(s) => Ok(Self::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Err(
                TrellisError::InvalidInput("attribute values must be scalars".to_string()),
            ),
        }
    }

    /// Render as a plain JSON scalar (`Unknown` becomes the string `"UNKNOWN"`).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Unknown => serde_json::Value::String("UNKNOWN".to_string()),
        }
    }

    /// Numeric view, used by the vector encoder.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Total, type-tagged key used to order categorical vocabularies.
    #[must_use]
    pub fn category_key(&self) -> String {
        match self {
            Self::Null => "n:".to_string(),
            Self::Bool(b) => format!("b:{b}"),
            Self::Int(i) => format!("i:{i}"),
            Self::Float(f) => format!("f:{f}"),
            Self::Text(s) => format!("t:{s}"),
            Self::Unknown => "u:".to_string(),
        }
    }

    /// Equality that treats `Int(3)` and `Float(3.0)` as the same cell.
    #[must_use]
    pub fn same_content(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
            Self::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Attribute map. `BTreeMap` keeps column order deterministic.
pub type Attributes = BTreeMap<String, Value>;

// =============================================================================
// ENTITY & RELATIONSHIP
// =============================================================================

/// A node of the canonical graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub internal_id: InternalId,
    pub canonical_name: String,
    pub entity_type: TypeLabel,
    pub attributes: Attributes,
    pub confidence: UncertaintyRecord,
    /// Entities are never physically deleted, only retired.
    pub retired: bool,
}

impl Entity {
    /// Create a live entity whose id is derived from its type and name.
    #[must_use]
    pub fn new(
        canonical_name: impl Into<String>,
        entity_type: TypeLabel,
        attributes: Attributes,
        confidence: UncertaintyRecord,
    ) -> Self {
        let canonical_name = canonical_name.into();
        Self {
            internal_id: InternalId::for_entity(&entity_type, &canonical_name),
            canonical_name,
            entity_type,
            attributes,
            confidence,
            retired: false,
        }
    }

    /// Merge another observation of the same entity into this one.
    ///
    /// Attributes are unioned (incoming values win on key clashes) and the
    /// two confidence records are re-combined as parallel evidence.
    pub fn merge_from(&mut self, other: &Entity) -> Result<(), TrellisError> {
        for (key, value) in &other.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
        self.confidence =
            UncertaintyRecord::parallel(&[self.confidence.clone(), other.confidence.clone()])?;
        Ok(())
    }
}

/// A directed, typed edge of the canonical graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub internal_id: InternalId,
    pub source_id: InternalId,
    pub target_id: InternalId,
    pub rel_type: TypeLabel,
    pub attributes: Attributes,
    pub confidence: UncertaintyRecord,
}

impl Relationship {
    /// Create a relationship whose id is derived from its endpoints and type.
    #[must_use]
    pub fn new(
        source_id: InternalId,
        target_id: InternalId,
        rel_type: TypeLabel,
        attributes: Attributes,
        confidence: UncertaintyRecord,
    ) -> Self {
        Self {
            internal_id: InternalId::for_relationship(source_id, &rel_type, target_id),
            source_id,
            target_id,
            rel_type,
            attributes,
            confidence,
        }
    }

    /// Same merge rule as [`Entity::merge_from`].
    pub fn merge_from(&mut self, other: &Relationship) -> Result<(), TrellisError> {
        for (key, value) in &other.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
        self.confidence =
            UncertaintyRecord::parallel(&[self.confidence.clone(), other.confidence.clone()])?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_are_deterministic() {
        let org = TypeLabel::parse("ORG").expect("label");
        let a = InternalId::for_entity(&org, "Acme Corp");
        let b = InternalId::for_entity(&org, "Acme Corp");
        let c = InternalId::for_entity(&org, "ACME CORP");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn relationship_id_depends_on_direction() {
        let rel = TypeLabel::parse("EMPLOYS").expect("label");
        let org = TypeLabel::parse("ORG").expect("label");
        let a = InternalId::for_entity(&org, "a");
        let b = InternalId::for_entity(&org, "b");
        assert_ne!(
            InternalId::for_relationship(a, &rel, b),
            InternalId::for_relationship(b, &rel, a)
        );
    }

    #[test]
    fn type_label_validation() {
        assert!(TypeLabel::parse("PERSON").is_ok());
        assert!(TypeLabel::parse("WORKS_AT_2").is_ok());
        assert!(TypeLabel::parse("").is_err());
        assert!(TypeLabel::parse("person").is_err());
        assert!(TypeLabel::parse("1ORG").is_err());
        assert!(TypeLabel::parse("ORG) DETACH DELETE (n").is_err());
    }

    #[test]
    fn type_label_deserialization_validates() {
        let ok: Result<TypeLabel, _> = serde_json::from_str("\"ORG\"");
        assert!(ok.is_ok());
        let bad: Result<TypeLabel, _> = serde_json::from_str("\"org\"");
        assert!(bad.is_err());
    }

    #[test]
    fn value_from_json_scalars() {
        let v = Value::from_json(&serde_json::json!(3)).expect("int");
        assert_eq!(v, Value::Int(3));
        let v = Value::from_json(&serde_json::json!(2.5)).expect("float");
        assert_eq!(v, Value::Float(2.5));
        let v = Value::from_json(&serde_json::json!("x")).expect("text");
        assert_eq!(v, Value::Text("x".to_string()));
        assert!(Value::from_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn value_same_content_crosses_numeric_kinds() {
        assert!(Value::Int(3).same_content(&Value::Float(3.0)));
        assert!(!Value::Int(3).same_content(&Value::Text("3".to_string())));
        assert!(Value::Unknown.same_content(&Value::Unknown));
    }

    #[test]
    fn canonical_name_validation() {
        assert!(validate_canonical_name("Jane Doe").is_ok());
        assert!(validate_canonical_name("   ").is_err());
        assert!(validate_canonical_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }
}
