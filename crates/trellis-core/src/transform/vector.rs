//! Table ⇄ vector encoding.
//!
//! Numeric columns take one dimension each (`NaN` encodes a null cell).
//! Every other column is one-hot encoded over its observed categories plus a
//! trailing out-of-vocabulary slot, so a value never seen while building the
//! [`Vocabulary`] still has somewhere to go and decodes to
//! [`Value::Unknown`].

use super::table::{Column, ColumnKind, ColumnManifest, TableSnapshot};
use crate::{TrellisError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest magnitude decoded back into `Value::Int`.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Dense numeric rows, one per table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSnapshot {
    pub dimensions: usize,
    pub rows: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Encoding {
    Numeric,
    /// Slot `i` is `categories[i]`; slot `categories.len()` is out-of-vocabulary.
    OneHot { categories: Vec<Value> },
}

impl Encoding {
    #[must_use]
    pub fn width(&self) -> usize {
        match self {
            Self::Numeric => 1,
            Self::OneHot { categories } => categories.len() + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub offset: usize,
    pub encoding: Encoding,
}

/// Layout of a vector space plus the column manifest needed to turn decoded
/// tables back into graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub manifest: ColumnManifest,
    pub columns: Vec<VocabColumn>,
    pub dimensions: usize,
}

impl Vocabulary {
    /// Build a vocabulary covering every value in `table`.
    #[must_use]
    pub fn from_table(table: &TableSnapshot) -> Self {
        let mut columns = Vec::with_capacity(table.columns.len());
        let mut offset = 0;
        for (idx, column) in table.columns.iter().enumerate() {
            let encoding = if column.kind.is_numeric() {
                Encoding::Numeric
            } else {
                let mut categories: BTreeMap<String, Value> = BTreeMap::new();
                for value in table.rows.iter().filter_map(|r| r.get(idx)) {
                    if !value.is_null() && *value != Value::Unknown {
                        categories
                            .entry(value.category_key())
                            .or_insert_with(|| value.clone());
                    }
                }
                Encoding::OneHot {
                    categories: categories.into_values().collect(),
                }
            };
            let width = encoding.width();
            columns.push(VocabColumn {
                name: column.name.clone(),
                kind: column.kind,
                offset,
                encoding,
            });
            offset += width;
        }
        Self {
            manifest: table.manifest.clone(),
            columns,
            dimensions: offset,
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&VocabColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Result of encoding a table.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub vector: VectorSnapshot,
    /// Table columns the vocabulary has no slot for.
    pub dropped_fields: Vec<String>,
}

/// Encode `table` in the space described by `vocabulary`.
#[must_use]
pub fn encode(table: &TableSnapshot, vocabulary: &Vocabulary) -> Encoded {
    let dropped_fields = table
        .columns
        .iter()
        .filter(|c| vocabulary.column(&c.name).is_none())
        .map(|c| c.name.clone())
        .collect();

    let sources: Vec<Option<usize>> = vocabulary
        .columns
        .iter()
        .map(|c| table.column_index(&c.name))
        .collect();

    let rows = table
        .rows
        .iter()
        .map(|row| {
            let mut out = vec![0.0; vocabulary.dimensions];
            for (column, source) in vocabulary.columns.iter().zip(&sources) {
                let value = source.and_then(|idx| row.get(idx)).unwrap_or(&Value::Null);
                encode_cell(value, column, &mut out);
            }
            out
        })
        .collect();

    Encoded {
        vector: VectorSnapshot {
            dimensions: vocabulary.dimensions,
            rows,
        },
        dropped_fields,
    }
}

fn encode_cell(value: &Value, column: &VocabColumn, out: &mut [f64]) {
    match &column.encoding {
        Encoding::Numeric => {
            if let Some(slot) = out.get_mut(column.offset) {
                *slot = value.as_f64().unwrap_or(f64::NAN);
            }
        }
        Encoding::OneHot { categories } => {
            if value.is_null() {
                return;
            }
            let hit = categories
                .iter()
                .position(|c| c == value)
                .unwrap_or(categories.len());
            if let Some(slot) = out.get_mut(column.offset + hit) {
                *slot = 1.0;
            }
        }
    }
}

/// Decode a vector back into a table laid out by `vocabulary`.
pub fn decode(vector: &VectorSnapshot, vocabulary: &Vocabulary) -> Result<TableSnapshot, TrellisError> {
    if vector.dimensions != vocabulary.dimensions {
        return Err(TrellisError::Transform(format!(
            "vector has {} dimensions, vocabulary expects {}",
            vector.dimensions, vocabulary.dimensions
        )));
    }
    let mut rows = Vec::with_capacity(vector.rows.len());
    for (index, encoded) in vector.rows.iter().enumerate() {
        if encoded.len() != vocabulary.dimensions {
            return Err(TrellisError::Transform(format!(
                "vector row {index} has {} components, expected {}",
                encoded.len(),
                vocabulary.dimensions
            )));
        }
        rows.push(
            vocabulary
                .columns
                .iter()
                .map(|column| decode_cell(encoded, column))
                .collect(),
        );
    }
    Ok(TableSnapshot {
        columns: vocabulary
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                kind: c.kind,
            })
            .collect(),
        rows,
        manifest: vocabulary.manifest.clone(),
    })
}

fn decode_cell(encoded: &[f64], column: &VocabColumn) -> Value {
    match &column.encoding {
        Encoding::Numeric => {
            let x = encoded.get(column.offset).copied().unwrap_or(f64::NAN);
            if x.is_nan() {
                Value::Null
            } else if column.kind == ColumnKind::Int && x.fract() == 0.0 && x.abs() <= MAX_EXACT_INT
            {
                Value::Int(x as i64)
            } else {
                Value::Float(x)
            }
        }
        Encoding::OneHot { categories } => {
            let slots = encoded
                .get(column.offset..column.offset + categories.len() + 1)
                .unwrap_or(&[]);
            let best = slots
                .iter()
                .enumerate()
                .filter(|(_, v)| **v > 0.5)
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i);
            match best {
                None => Value::Null,
                Some(i) => categories.get(i).cloned().unwrap_or(Value::Unknown),
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableSnapshot {
        TableSnapshot {
            columns: vec![
                Column {
                    name: "age".to_string(),
                    kind: ColumnKind::Int,
                },
                Column {
                    name: "city".to_string(),
                    kind: ColumnKind::Text,
                },
            ],
            rows: vec![
                vec![Value::Int(30), Value::Text("Oslo".to_string())],
                vec![Value::Null, Value::Text("Lima".to_string())],
                vec![Value::Int(41), Value::Null],
            ],
            manifest: ColumnManifest::default(),
        }
    }

    #[test]
    fn layout_reserves_out_of_vocabulary_slot() {
        let vocab = Vocabulary::from_table(&table());
        // age: 1, city: Lima + Oslo + OOV
        assert_eq!(vocab.dimensions, 4);
        let city = vocab.column("city").expect("city");
        assert_eq!(city.offset, 1);
        assert_eq!(city.encoding.width(), 3);
    }

    #[test]
    fn encode_decode_is_exact_with_own_vocabulary() {
        let t = table();
        let vocab = Vocabulary::from_table(&t);
        let encoded = encode(&t, &vocab);
        assert!(encoded.dropped_fields.is_empty());
        assert!(encoded.vector.rows[1][0].is_nan());
        let back = decode(&encoded.vector, &vocab).expect("decode");
        assert_eq!(back.rows, t.rows);
    }

    #[test]
    fn unseen_category_decodes_to_unknown() {
        let t = table();
        let vocab = Vocabulary::from_table(&t);
        let mut other = t.clone();
        other.rows[0][1] = Value::Text("Quito".to_string());
        let encoded = encode(&other, &vocab);
        let back = decode(&encoded.vector, &vocab).expect("decode");
        assert_eq!(back.rows[0][1], Value::Unknown);
    }

    #[test]
    fn columns_outside_vocabulary_are_dropped() {
        let t = table();
        let vocab = Vocabulary::from_table(&t);
        let mut wider = t.clone();
        wider.columns.push(Column {
            name: "extra".to_string(),
            kind: ColumnKind::Bool,
        });
        for row in &mut wider.rows {
            row.push(Value::Bool(true));
        }
        let encoded = encode(&wider, &vocab);
        assert_eq!(encoded.dropped_fields, vec!["extra".to_string()]);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let vocab = Vocabulary::from_table(&table());
        let bad = VectorSnapshot {
            dimensions: 2,
            rows: vec![vec![0.0, 1.0]],
        };
        assert!(decode(&bad, &vocab).is_err());
    }
}
