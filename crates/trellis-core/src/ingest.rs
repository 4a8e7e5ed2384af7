//! # Write Pipeline
//!
//! Turns one extraction batch into one distributed transaction:
//!
//! 1. Parse and validate the batch (names, labels, confidences, endpoints).
//! 2. Lock every touched entity and relationship id, then finish any
//!    pending commit that writes one of them.
//! 3. Resolve entities through the [`IdMapper`], reserving new mappings.
//! 4. Combine uncertainty: duplicate mentions in parallel, then the
//!    pipeline stages sequentially, then parallel again with what is stored.
//! 5. Project the delta through `graph_to_table` for the fidelity report.
//! 6. Commit graph MERGEs and relational rows through the DTM.

use crate::config::PipelineConfig;
use crate::graph::{EndpointPolicy, GraphSnapshot};
use crate::mapper::IdMapper;
use crate::primitives::{MAX_ATTRIBUTE_LENGTH, MAX_BATCH_SIZE};
use crate::storage::{GraphPool, GraphWrite, RelationalWrite};
use crate::transform::{FidelityReport, RowKind, Transformer};
use crate::txn::{CommitOutcome, Operation, TransactionManager};
use crate::uncertainty::UncertaintyRecord;
use crate::{
    Attributes, Entity, InternalId, Relationship, TrellisError, TxId, TypeLabel, Value,
    validate_canonical_name,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// INPUT
// =============================================================================

/// Extraction batch as produced by the upstream NLP stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionBatch {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractedEntity {
    /// Batch-local id, referenced by relationships.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub confidence: f64,
}

impl ExtractionBatch {
    pub fn from_json(text: &str) -> Result<Self, TrellisError> {
        serde_json::from_str(text)
            .map_err(|e| TrellisError::InvalidInput(format!("malformed extraction batch: {e}")))
    }
}

/// Result of a committed write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteReceipt {
    pub tx_id: TxId,
    pub outcome: CommitOutcome,
    pub entity_ids: Vec<InternalId>,
    pub relationship_ids: Vec<InternalId>,
    pub fidelity: FidelityReport,
}

// =============================================================================
// VALIDATION
// =============================================================================

struct Mention {
    canonical_name: String,
    entity_type: TypeLabel,
    attributes: Attributes,
    record: UncertaintyRecord,
}

struct RelMention {
    source: InternalId,
    target: InternalId,
    rel_type: TypeLabel,
    attributes: Attributes,
    record: UncertaintyRecord,
}

/// A batch that passed validation, grouped by internal id.
struct ValidBatch {
    entity_order: Vec<InternalId>,
    entities: BTreeMap<InternalId, Vec<Mention>>,
    rel_order: Vec<InternalId>,
    relationships: BTreeMap<InternalId, Vec<RelMention>>,
}

/// Convert JSON attributes. Nulls mean "absent" and are dropped.
fn convert_attributes(
    raw: &serde_json::Map<String, serde_json::Value>,
) -> Result<Attributes, TrellisError> {
    let mut attributes = Attributes::new();
    for (key, value) in raw {
        if key.is_empty() || key.len() > MAX_ATTRIBUTE_LENGTH {
            return Err(TrellisError::InvalidInput(format!(
                "attribute name must be 1..={MAX_ATTRIBUTE_LENGTH} bytes, got '{key}'"
            )));
        }
        let value = Value::from_json(value)
            .map_err(|e| TrellisError::InvalidInput(format!("attribute '{key}': {e}")))?;
        if !value.is_null() {
            attributes.insert(key.clone(), value);
        }
    }
    Ok(attributes)
}

fn validate(batch: &ExtractionBatch) -> Result<ValidBatch, TrellisError> {
    let size = batch.entities.len() + batch.relationships.len();
    if size == 0 {
        return Err(TrellisError::InvalidInput("extraction batch is empty".to_string()));
    }
    if size > MAX_BATCH_SIZE {
        return Err(TrellisError::InvalidInput(format!(
            "batch of {size} records exceeds maximum {MAX_BATCH_SIZE}"
        )));
    }

    let mut local_ids: BTreeMap<&str, InternalId> = BTreeMap::new();
    let mut entity_order = Vec::new();
    let mut entities: BTreeMap<InternalId, Vec<Mention>> = BTreeMap::new();
    for raw in &batch.entities {
        if raw.id.is_empty() {
            return Err(TrellisError::InvalidInput("entity id must not be empty".to_string()));
        }
        validate_canonical_name(&raw.name)?;
        let entity_type = TypeLabel::parse(raw.entity_type.as_str())?;
        let record = UncertaintyRecord::from_confidence(raw.confidence, "extraction")?;
        let internal_id = InternalId::for_entity(&entity_type, &raw.name);
        if local_ids.insert(raw.id.as_str(), internal_id).is_some() {
            return Err(TrellisError::InvalidInput(format!(
                "entity id '{}' appears twice in the batch",
                raw.id
            )));
        }
        let mentions = entities.entry(internal_id).or_default();
        if mentions.is_empty() {
            entity_order.push(internal_id);
        }
        mentions.push(Mention {
            canonical_name: raw.name.clone(),
            entity_type,
            attributes: convert_attributes(&raw.attributes)?,
            record,
        });
    }

    let mut rel_order = Vec::new();
    let mut relationships: BTreeMap<InternalId, Vec<RelMention>> = BTreeMap::new();
    for raw in &batch.relationships {
        let endpoint = |local: &str, role: &str| {
            local_ids.get(local).copied().ok_or_else(|| {
                TrellisError::InvalidInput(format!(
                    "relationship {role} '{local}' is not an entity of this batch"
                ))
            })
        };
        let source = endpoint(&raw.source, "source")?;
        let target = endpoint(&raw.target, "target")?;
        let rel_type = TypeLabel::parse(raw.rel_type.as_str())?;
        let record = UncertaintyRecord::from_confidence(raw.confidence, "extraction")?;
        let internal_id = InternalId::for_relationship(source, &rel_type, target);
        let mentions = relationships.entry(internal_id).or_default();
        if mentions.is_empty() {
            rel_order.push(internal_id);
        }
        mentions.push(RelMention {
            source,
            target,
            rel_type,
            attributes: convert_attributes(&raw.attributes)?,
            record,
        });
    }

    Ok(ValidBatch {
        entity_order,
        entities,
        rel_order,
        relationships,
    })
}

// =============================================================================
// INGESTOR
// =============================================================================

/// One pass of the write pipeline over borrowed engine components.
pub struct Ingestor<'a> {
    mapper: &'a IdMapper,
    dtm: &'a TransactionManager,
    graph_pool: &'a GraphPool,
    transformer: &'a Transformer,
    stages: PipelineConfig,
}

impl<'a> Ingestor<'a> {
    #[must_use]
    pub fn new(
        mapper: &'a IdMapper,
        dtm: &'a TransactionManager,
        graph_pool: &'a GraphPool,
        transformer: &'a Transformer,
        stages: PipelineConfig,
    ) -> Self {
        Self {
            mapper,
            dtm,
            graph_pool,
            transformer,
            stages,
        }
    }

    /// Fold mentions in parallel, then apply the deterministic stages.
    fn staged_record(&self, records: Vec<UncertaintyRecord>) -> Result<UncertaintyRecord, TrellisError> {
        let extracted = match records.as_slice() {
            [single] => single.clone(),
            _ => UncertaintyRecord::parallel(&records)?,
        };
        extracted
            .then("normalization", self.stages.normalization_uncertainty)?
            .then("persistence", self.stages.persistence_uncertainty)
    }

    /// Validate, resolve, merge and commit one batch.
    pub fn ingest(&self, batch: &ExtractionBatch) -> Result<WriteReceipt, TrellisError> {
        let valid = validate(batch)?;
        let touched: BTreeSet<InternalId> = valid
            .entity_order
            .iter()
            .chain(valid.rel_order.iter())
            .copied()
            .collect();
        let _locks = self.mapper.lock_many(touched.iter().copied());
        // merges below read the stored records
        self.dtm.settle(&touched)?;

        let mut mappings = self.mapper.batch();
        let mut delta = GraphSnapshot::new();
        let mut lease = self.graph_pool.acquire(None)?;
        {
            let conn = lease.connection()?;
            for internal_id in &valid.entity_order {
                let Some(mentions) = valid.entities.get(internal_id) else {
                    continue;
                };
                let mut attributes = Attributes::new();
                for mention in mentions {
                    attributes.extend(mention.attributes.clone());
                }
                let first = &mentions[0];
                mappings.resolve_or_create(&first.canonical_name, &first.entity_type)?;
                let record = self.staged_record(mentions.iter().map(|m| m.record.clone()).collect())?;
                let observed = Entity::new(
                    first.canonical_name.clone(),
                    first.entity_type.clone(),
                    attributes,
                    record,
                );
                let merged = match conn.entity(*internal_id)? {
                    Some(mut stored) => {
                        stored.merge_from(&observed)?;
                        stored
                    }
                    None => observed,
                };
                delta.upsert_entity(merged);
            }

            for internal_id in &valid.rel_order {
                let Some(mentions) = valid.relationships.get(internal_id) else {
                    continue;
                };
                let mut attributes = Attributes::new();
                for mention in mentions {
                    attributes.extend(mention.attributes.clone());
                }
                let first = &mentions[0];
                let record = self.staged_record(mentions.iter().map(|m| m.record.clone()).collect())?;
                let observed = Relationship::new(
                    first.source,
                    first.target,
                    first.rel_type.clone(),
                    attributes,
                    record,
                );
                let merged = match conn.relationship(*internal_id)? {
                    Some(mut stored) => {
                        stored.merge_from(&observed)?;
                        stored
                    }
                    None => observed,
                };
                delta.insert_relationship(merged, EndpointPolicy::Live)?;
            }
        }
        lease.release(None)?;

        let fidelity = self.transformer.graph_to_table(&delta, None).report;

        let mut operations = Vec::new();
        for entity in delta.entities() {
            operations.push(Operation::Graph(GraphWrite::MergeEntity(entity.clone())));
        }
        for rel in delta.relationships() {
            operations.push(Operation::Graph(GraphWrite::MergeRelationship(rel.clone())));
        }
        for mapping in mappings.mappings() {
            operations.push(Operation::Relational(RelationalWrite::MapId(mapping.clone())));
        }
        let audited = delta
            .entities()
            .map(|e| (e.internal_id, &e.confidence, RowKind::Entity))
            .chain(
                delta
                    .relationships()
                    .map(|r| (r.internal_id, &r.confidence, RowKind::Relationship)),
            );
        for (internal_id, record, row_kind) in audited {
            operations.push(Operation::Relational(RelationalWrite::LogUncertainty {
                internal_id,
                record: record.clone(),
            }));
            operations.push(Operation::Relational(RelationalWrite::Provenance {
                internal_id,
                row_kind,
            }));
        }

        let receipt = self.dtm.execute(operations)?;
        mappings.confirm();
        tracing::info!(
            tx_id = %receipt.tx_id,
            entities = valid.entity_order.len(),
            relationships = valid.rel_order.len(),
            "extraction batch committed"
        );
        Ok(WriteReceipt {
            tx_id: receipt.tx_id,
            outcome: receipt.outcome,
            entity_ids: valid.entity_order,
            relationship_ids: valid.rel_order,
            fidelity,
        })
    }

    /// Soft-delete an entity. Its relationships stay; new ones may not
    /// point at it.
    pub fn retire_entity(&self, internal_id: InternalId) -> Result<WriteReceipt, TrellisError> {
        self.mapper
            .map_to_native(internal_id, crate::StoreKind::Graph)?;
        let _lock = self.mapper.lock_many([internal_id]);
        self.dtm.settle(&BTreeSet::from([internal_id]))?;

        let mut lease = self.graph_pool.acquire(None)?;
        let stored = lease.connection()?.entity(internal_id)?;
        lease.release(None)?;
        let mut entity =
            stored.ok_or_else(|| TrellisError::NotFound(format!("entity {internal_id}")))?;
        entity.retired = true;

        let receipt = self.dtm.execute(vec![
            Operation::Graph(GraphWrite::MergeEntity(entity)),
            Operation::Relational(RelationalWrite::Provenance {
                internal_id,
                row_kind: RowKind::Entity,
            }),
        ])?;
        tracing::info!(tx_id = %receipt.tx_id, %internal_id, "entity retired");
        Ok(WriteReceipt {
            tx_id: receipt.tx_id,
            outcome: receipt.outcome,
            entity_ids: vec![internal_id],
            relationship_ids: Vec::new(),
            fidelity: FidelityReport::new(Vec::new(), 1.0, self.transformer.threshold()),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
