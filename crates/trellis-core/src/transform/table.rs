//! Graph ⇄ table projection.
//!
//! One row per entity, then one row per relationship, discriminated by the
//! `row_kind` column. System columns carry identity, type, retirement and
//! the full uncertainty record; attribute columns are listed in a
//! [`ColumnManifest`] so the inverse projection knows which columns belong to
//! which row kind.

use crate::graph::{EndpointPolicy, GraphSnapshot};
use crate::uncertainty::{CombinationMethod, UncertaintyRecord};
use crate::{Attributes, Entity, InternalId, Relationship, TrellisError, TypeLabel, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// SCHEMA
// =============================================================================

pub const COL_ROW_KIND: &str = "row_kind";
pub const COL_INTERNAL_ID: &str = "internal_id";
pub const COL_CANONICAL_NAME: &str = "canonical_name";
pub const COL_ENTITY_TYPE: &str = "entity_type";
pub const COL_SOURCE_ID: &str = "source_id";
pub const COL_TARGET_ID: &str = "target_id";
pub const COL_REL_TYPE: &str = "rel_type";
pub const COL_RETIRED: &str = "retired";
pub const COL_UNCERTAINTY: &str = "uncertainty";
pub const COL_METHOD: &str = "uncertainty_method";
pub const COL_COMPONENTS: &str = "uncertainty_components";
pub const COL_JUSTIFICATION: &str = "justification";

/// System columns, in table order.
pub const SYSTEM_COLUMNS: [(&str, ColumnKind); 12] = [
    (COL_ROW_KIND, ColumnKind::Text),
    (COL_INTERNAL_ID, ColumnKind::Text),
    (COL_CANONICAL_NAME, ColumnKind::Text),
    (COL_ENTITY_TYPE, ColumnKind::Text),
    (COL_SOURCE_ID, ColumnKind::Text),
    (COL_TARGET_ID, ColumnKind::Text),
    (COL_REL_TYPE, ColumnKind::Text),
    (COL_RETIRED, ColumnKind::Bool),
    (COL_UNCERTAINTY, ColumnKind::Float),
    (COL_METHOD, ColumnKind::Text),
    (COL_COMPONENTS, ColumnKind::Text),
    (COL_JUSTIFICATION, ColumnKind::Text),
];

/// Which record a table row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Entity,
    Relationship,
}

impl RowKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Relationship => "relationship",
        }
    }

    const fn column_prefix(self) -> &'static str {
        match self {
            Self::Entity => "entity.",
            Self::Relationship => "rel.",
        }
    }

    fn parse(s: &str) -> Result<Self, TrellisError> {
        match s {
            "entity" => Ok(Self::Entity),
            "relationship" => Ok(Self::Relationship),
            other => Err(TrellisError::Transform(format!("unknown row kind '{other}'"))),
        }
    }
}

/// Inferred value kind of a column. Drives the vector encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Int,
    Float,
    Bool,
    Text,
    /// Values of more than one non-numeric kind.
    Mixed,
}

impl ColumnKind {
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }

    /// Infer from the non-null values of a column. An all-null column is text.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut kind: Option<Self> = None;
        for value in values {
            let this = match value {
                Value::Null => continue,
                Value::Int(_) => Self::Int,
                Value::Float(_) => Self::Float,
                Value::Bool(_) => Self::Bool,
                Value::Text(_) | Value::Unknown => Self::Text,
            };
            kind = Some(match (kind, this) {
                (None, k) => k,
                (Some(a), b) if a == b => a,
                (Some(Self::Int | Self::Float), Self::Int | Self::Float) => Self::Float,
                _ => Self::Mixed,
            });
        }
        kind.unwrap_or(Self::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

/// One attribute column of a table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub row_kind: RowKind,
    pub attribute: String,
    pub column: String,
}

/// Attribute columns of a table, sorted by `(row_kind, attribute)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnManifest {
    pub entries: Vec<ManifestEntry>,
}

impl ColumnManifest {
    /// Manifest covering every attribute present in `graph`.
    #[must_use]
    pub fn from_graph(graph: &GraphSnapshot) -> Self {
        let mut seen: BTreeSet<(RowKind, &str)> = BTreeSet::new();
        for entity in graph.entities() {
            seen.extend(entity.attributes.keys().map(|k| (RowKind::Entity, k.as_str())));
        }
        for rel in graph.relationships() {
            seen.extend(rel.attributes.keys().map(|k| (RowKind::Relationship, k.as_str())));
        }
        let entries = seen
            .into_iter()
            .map(|(row_kind, attribute)| ManifestEntry {
                row_kind,
                attribute: attribute.to_string(),
                column: format!("{}{attribute}", row_kind.column_prefix()),
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn column_for(&self, row_kind: RowKind, attribute: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.row_kind == row_kind && e.attribute == attribute)
            .map(|e| e.column.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A relational projection of a [`GraphSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
    pub manifest: ColumnManifest,
}

impl TableSnapshot {
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    #[must_use]
    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Mutable cell access, mostly for tests that perturb a table.
    pub fn cell_mut(&mut self, row: usize, column: &str) -> Option<&mut Value> {
        let idx = self.column_index(column)?;
        self.rows.get_mut(row)?.get_mut(idx)
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Total number of cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.rows.len() * self.columns.len()
    }
}

// =============================================================================
// COMPONENT ENCODING
// =============================================================================

/// Encode uncertainty components as `;`-separated shortest round-trip floats.
#[must_use]
pub fn encode_components(components: &[f64]) -> String {
    components
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

pub fn decode_components(encoded: &str) -> Result<Vec<f64>, TrellisError> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    encoded
        .split(';')
        .map(|part| {
            part.parse::<f64>().map_err(|e| {
                TrellisError::Transform(format!("bad uncertainty component '{part}': {e}"))
            })
        })
        .collect()
}

// =============================================================================
// GRAPH → TABLE
// =============================================================================

/// Project a graph with a manifest covering all of its attributes. Lossless.
#[must_use]
pub fn graph_to_table(graph: &GraphSnapshot) -> TableSnapshot {
    project(graph, ColumnManifest::from_graph(graph)).table
}

/// Outcome of projecting against a fixed manifest.
#[derive(Debug, Clone)]
pub struct Projection {
    pub table: TableSnapshot,
    /// `"<row kind>.<attribute>"` for every attribute the manifest lacks.
    pub dropped_fields: Vec<String>,
    /// Attribute values that made it into the table.
    pub captured_values: usize,
    /// Attribute values present in the graph.
    pub total_values: usize,
}

/// Project a graph using an existing manifest.
///
/// Attributes the manifest has no column for are left out and listed in
/// [`Projection::dropped_fields`].
#[must_use]
pub fn project(graph: &GraphSnapshot, manifest: ColumnManifest) -> Projection {
    let mut dropped: BTreeSet<String> = BTreeSet::new();
    let mut captured_values = 0;
    let mut total_values = 0;
    let width = SYSTEM_COLUMNS.len() + manifest.len();
    let mut rows = Vec::with_capacity(graph.entity_count() + graph.relationship_count());

    let mut attribute_cells = |row: &mut Vec<Value>, kind: RowKind, attributes: &Attributes| {
        let mut cells: BTreeMap<&str, &Value> = BTreeMap::new();
        for (key, value) in attributes {
            if value.is_null() {
                continue;
            }
            total_values += 1;
            match manifest.column_for(kind, key) {
                Some(column) => {
                    captured_values += 1;
                    cells.insert(column, value);
                }
                None => {
                    dropped.insert(format!("{}.{key}", kind.as_str()));
                }
            }
        }
        for entry in &manifest.entries {
            let cell = if entry.row_kind == kind {
                cells.get(entry.column.as_str()).map(|v| (*v).clone())
            } else {
                None
            };
            row.push(cell.unwrap_or(Value::Null));
        }
    };

    for entity in graph.entities() {
        let mut row = Vec::with_capacity(width);
        row.extend([
            Value::Text(RowKind::Entity.as_str().to_string()),
            Value::Text(entity.internal_id.to_string()),
            Value::Text(entity.canonical_name.clone()),
            Value::Text(entity.entity_type.to_string()),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Bool(entity.retired),
        ]);
        push_uncertainty(&mut row, &entity.confidence);
        attribute_cells(&mut row, RowKind::Entity, &entity.attributes);
        rows.push(row);
    }

    for rel in graph.relationships() {
        let mut row = Vec::with_capacity(width);
        row.extend([
            Value::Text(RowKind::Relationship.as_str().to_string()),
            Value::Text(rel.internal_id.to_string()),
            Value::Null,
            Value::Null,
            Value::Text(rel.source_id.to_string()),
            Value::Text(rel.target_id.to_string()),
            Value::Text(rel.rel_type.to_string()),
            Value::Null,
        ]);
        push_uncertainty(&mut row, &rel.confidence);
        attribute_cells(&mut row, RowKind::Relationship, &rel.attributes);
        rows.push(row);
    }

    let mut columns: Vec<Column> = SYSTEM_COLUMNS
        .iter()
        .map(|(name, kind)| Column {
            name: (*name).to_string(),
            kind: *kind,
        })
        .collect();
    let system_width = columns.len();
    for (offset, entry) in manifest.entries.iter().enumerate() {
        let idx = system_width + offset;
        columns.push(Column {
            name: entry.column.clone(),
            kind: ColumnKind::infer(rows.iter().filter_map(|r| r.get(idx))),
        });
    }

    Projection {
        table: TableSnapshot {
            columns,
            rows,
            manifest,
        },
        dropped_fields: dropped.into_iter().collect(),
        captured_values,
        total_values,
    }
}

fn push_uncertainty(row: &mut Vec<Value>, record: &UncertaintyRecord) {
    row.extend([
        Value::Float(record.value()),
        Value::Text(record.method().as_str().to_string()),
        Value::Text(encode_components(record.components())),
        Value::Text(record.justification().to_string()),
    ]);
}

// =============================================================================
// TABLE → GRAPH
// =============================================================================

struct RowReader<'a> {
    table: &'a TableSnapshot,
    row: &'a [Value],
    index: usize,
}

impl RowReader<'_> {
    fn cell(&self, column: &str) -> Result<&Value, TrellisError> {
        let idx = self.table.column_index(column).ok_or_else(|| {
            TrellisError::Transform(format!("table has no '{column}' column"))
        })?;
        self.row.get(idx).ok_or_else(|| {
            TrellisError::Transform(format!("row {} is shorter than the header", self.index))
        })
    }

    fn text(&self, column: &str) -> Result<&str, TrellisError> {
        match self.cell(column)? {
            Value::Text(s) => Ok(s),
            other => Err(TrellisError::Transform(format!(
                "row {}: column '{column}' must be text, found {other}",
                self.index
            ))),
        }
    }

    fn id(&self, column: &str) -> Result<InternalId, TrellisError> {
        InternalId::parse(self.text(column)?).map_err(|e| self.wrap(e))
    }

    fn label(&self, column: &str) -> Result<TypeLabel, TrellisError> {
        TypeLabel::parse(self.text(column)?).map_err(|e| self.wrap(e))
    }

    fn uncertainty(&self) -> Result<UncertaintyRecord, TrellisError> {
        let method = CombinationMethod::parse(self.text(COL_METHOD)?).map_err(|e| self.wrap(e))?;
        let components = decode_components(self.text(COL_COMPONENTS)?)?;
        let justification = self.text(COL_JUSTIFICATION)?.to_string();
        UncertaintyRecord::from_parts(method, components, justification).map_err(|e| self.wrap(e))
    }

    fn attributes(&self, kind: RowKind) -> Result<Attributes, TrellisError> {
        let mut attributes = Attributes::new();
        for entry in self.table.manifest.entries.iter().filter(|e| e.row_kind == kind) {
            let value = self.cell(&entry.column)?;
            if !value.is_null() {
                attributes.insert(entry.attribute.clone(), value.clone());
            }
        }
        Ok(attributes)
    }

    fn wrap(&self, e: TrellisError) -> TrellisError {
        TrellisError::Transform(format!("row {}: {e}", self.index))
    }
}

/// Rebuild the graph a table was projected from.
///
/// Relationship endpoints are re-validated: a relationship whose source or
/// target row is missing fails the whole reconstruction.
pub fn table_to_graph(table: &TableSnapshot) -> Result<GraphSnapshot, TrellisError> {
    let mut graph = GraphSnapshot::new();
    for (index, row) in table.rows.iter().enumerate() {
        let reader = RowReader { table, row, index };
        match RowKind::parse(reader.text(COL_ROW_KIND)?)? {
            RowKind::Entity => {
                let retired = match reader.cell(COL_RETIRED)? {
                    Value::Bool(b) => *b,
                    other => {
                        return Err(TrellisError::Transform(format!(
                            "row {index}: retired flag must be boolean, found {other}"
                        )));
                    }
                };
                graph.upsert_entity(Entity {
                    internal_id: reader.id(COL_INTERNAL_ID)?,
                    canonical_name: reader.text(COL_CANONICAL_NAME)?.to_string(),
                    entity_type: reader.label(COL_ENTITY_TYPE)?,
                    attributes: reader.attributes(RowKind::Entity)?,
                    confidence: reader.uncertainty()?,
                    retired,
                });
            }
            RowKind::Relationship => {
                graph.insert_relationship_unchecked(Relationship {
                    internal_id: reader.id(COL_INTERNAL_ID)?,
                    source_id: reader.id(COL_SOURCE_ID)?,
                    target_id: reader.id(COL_TARGET_ID)?,
                    rel_type: reader.label(COL_REL_TYPE)?,
                    attributes: reader.attributes(RowKind::Relationship)?,
                    confidence: reader.uncertainty()?,
                });
            }
        }
    }
    graph.validate(EndpointPolicy::Exists)?;
    Ok(graph)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> GraphSnapshot {
        let org = TypeLabel::parse("ORG").expect("label");
        let person = TypeLabel::parse("PERSON").expect("label");
        let mut acme_attrs = Attributes::new();
        acme_attrs.insert("employees".to_string(), Value::Int(40));
        acme_attrs.insert("sector".to_string(), Value::Text("tools".to_string()));
        let acme = Entity::new(
            "Acme Corp",
            org,
            acme_attrs,
            UncertaintyRecord::sequential(&[("ner", 0.05), ("resolution", 0.02)]).expect("seq"),
        );
        let jane = Entity::new(
            "Jane Doe",
            person,
            Attributes::new(),
            UncertaintyRecord::from_confidence(0.9, "ner").expect("leaf"),
        );
        let mut rel_attrs = Attributes::new();
        rel_attrs.insert("since".to_string(), Value::Int(2019));
        let employs = Relationship::new(
            acme.internal_id,
            jane.internal_id,
            TypeLabel::parse("EMPLOYS").expect("label"),
            rel_attrs,
            UncertaintyRecord::from_confidence(0.8, "re").expect("leaf"),
        );
        let mut graph = GraphSnapshot::new();
        graph.upsert_entity(acme);
        graph.upsert_entity(jane);
        graph
            .insert_relationship(employs, EndpointPolicy::Live)
            .expect("endpoints");
        graph
    }

    #[test]
    fn projection_has_one_row_per_record() {
        let graph = sample_graph();
        let table = graph_to_table(&graph);
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.columns.len(), SYSTEM_COLUMNS.len() + 3);
        assert_eq!(
            table.cell(0, COL_ROW_KIND),
            Some(&Value::Text("entity".to_string()))
        );
        assert_eq!(
            table.cell(2, COL_ROW_KIND),
            Some(&Value::Text("relationship".to_string()))
        );
    }

    #[test]
    fn attribute_columns_are_prefixed_by_row_kind() {
        let table = graph_to_table(&sample_graph());
        assert!(table.column_index("entity.employees").is_some());
        assert!(table.column_index("rel.since").is_some());
        let employees = table
            .columns
            .iter()
            .find(|c| c.name == "entity.employees")
            .expect("column");
        assert_eq!(employees.kind, ColumnKind::Int);
    }

    #[test]
    fn graph_table_graph_is_exact() {
        let graph = sample_graph();
        let back = table_to_graph(&graph_to_table(&graph)).expect("reconstruct");
        assert!(graph.is_isomorphic_to(&back));
        assert_eq!(graph, back);
    }

    #[test]
    fn fixed_manifest_reports_dropped_fields() {
        let graph = sample_graph();
        let mut manifest = ColumnManifest::from_graph(&graph);
        manifest.entries.retain(|e| e.attribute != "sector");
        let projection = project(&graph, manifest);
        assert_eq!(projection.dropped_fields, vec!["entity.sector".to_string()]);
        assert_eq!(projection.total_values, 3);
        assert_eq!(projection.captured_values, 2);
    }

    #[test]
    fn missing_endpoint_row_fails_reconstruction() {
        let graph = sample_graph();
        let mut table = graph_to_table(&graph);
        // drop Jane's row, keep the relationship pointing at her
        let jane_row = table
            .rows
            .iter()
            .position(|r| r.get(2) == Some(&Value::Text("Jane Doe".to_string())))
            .expect("jane row");
        table.rows.remove(jane_row);
        let err = table_to_graph(&table).expect_err("dangling relationship");
        assert!(matches!(err, TrellisError::Transform(_)));
    }

    #[test]
    fn components_round_trip_exactly() {
        let components = [0.1, 1.0 / 3.0, 0.0, 1e-17];
        let decoded = decode_components(&encode_components(&components)).expect("decode");
        assert_eq!(decoded, components);
        assert!(decode_components("").expect("empty").is_empty());
        assert!(decode_components("0.1;x").is_err());
    }

    #[test]
    fn column_kind_inference() {
        let ints = [Value::Int(1), Value::Null, Value::Int(2)];
        assert_eq!(ColumnKind::infer(&ints), ColumnKind::Int);
        let nums = [Value::Int(1), Value::Float(2.5)];
        assert_eq!(ColumnKind::infer(&nums), ColumnKind::Float);
        let mixed = [Value::Bool(true), Value::Text("x".to_string())];
        assert_eq!(ColumnKind::infer(&mixed), ColumnKind::Mixed);
        assert_eq!(ColumnKind::infer(&[Value::Null]), ColumnKind::Text);
    }
}
