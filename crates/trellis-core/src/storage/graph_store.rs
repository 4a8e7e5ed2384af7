//! # redb-backed Graph Store
//!
//! Embedded property graph with MERGE semantics.
//!
//! Tables:
//! - `entities`: native key (case-folded canonical name) → entity
//! - `entity_keys`: internal id → native key
//! - `relationships`: internal id → relationship
//! - `relationship_index`: `(source, target, type)` → relationship id
//! - `applied_transactions`: tx id → commit time, written in the same native
//!   transaction as the data so a replay can tell the writes already landed
//!
//! Records are `postcard`-encoded. redb allows one writer at a time and
//! `begin_write` waits without a limit, so staged writes queue on a
//! writer gate first. The gate can be waited on with a budget.

use super::native_id;
use crate::graph::{EndpointPolicy, GraphSnapshot};
use crate::pool::ConnectionFactory;
use crate::{Entity, InternalId, Relationship, StoreKind, TrellisError, TxId};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
const ENTITY_KEYS: TableDefinition<u128, &str> = TableDefinition::new("entity_keys");
const RELATIONSHIPS: TableDefinition<u128, &[u8]> = TableDefinition::new("relationships");
const RELATIONSHIP_INDEX: TableDefinition<(u128, u128, &str), u128> =
    TableDefinition::new("relationship_index");
const APPLIED: TableDefinition<u128, i64> = TableDefinition::new("applied_transactions");

// =============================================================================
// WRITES
// =============================================================================

/// One MERGE against the graph store.
///
/// Writes carry the full post-merge record, so applying the same write twice
/// leaves the store unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphWrite {
    MergeEntity(Entity),
    MergeRelationship(Relationship),
}

impl GraphWrite {
    /// Cypher rendering, for audit logs.
    #[must_use]
    pub fn to_cypher(&self) -> String {
        match self {
            Self::MergeEntity(e) => format!(
                "MERGE (e:Entity {{canonical_name: {}}}) ON CREATE SET e.internal_id = '{}' \
                 SET e:{}, e.retired = {}, e.uncertainty = {} SET e += {}",
                quote(&e.canonical_name),
                e.internal_id,
                e.entity_type,
                e.retired,
                e.confidence.value(),
                attribute_map(&e.attributes)
            ),
            Self::MergeRelationship(r) => format!(
                "MATCH (a:Entity {{internal_id: '{}'}}), (b:Entity {{internal_id: '{}'}}) \
                 MERGE (a)-[r:{}]->(b) ON CREATE SET r.internal_id = '{}' \
                 SET r.uncertainty = {} SET r += {}",
                r.source_id,
                r.target_id,
                r.rel_type,
                r.internal_id,
                r.confidence.value(),
                attribute_map(&r.attributes)
            ),
        }
    }
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn attribute_map(attributes: &crate::Attributes) -> String {
    let pairs: Vec<String> = attributes
        .iter()
        .map(|(k, v)| format!("`{k}`: {}", v.to_json()))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

// =============================================================================
// WRITER GATE
// =============================================================================

/// Admits one staged write at a time, ahead of redb's own writer lock.
#[derive(Default)]
struct WriterGate {
    busy: Mutex<bool>,
    freed: Condvar,
}

fn lock_gate(mutex: &Mutex<bool>) -> MutexGuard<'_, bool> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl WriterGate {
    /// Wait for the gate, giving up after `budget` when one is given.
    fn enter(gate: &Arc<Self>, budget: Option<Duration>) -> Result<WriterPermit, TrellisError> {
        let deadline = budget.map(|b| Instant::now() + b);
        let mut busy = lock_gate(&gate.busy);
        while *busy {
            busy = match deadline {
                None => match gate.freed.wait(busy) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(TrellisError::graph(format!(
                            "graph writer busy for more than {} ms",
                            budget.unwrap_or_default().as_millis()
                        )));
                    }
                    match gate.freed.wait_timeout(busy, left) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
        *busy = true;
        Ok(WriterPermit {
            gate: Arc::clone(gate),
        })
    }
}

/// Held by a staged write until it commits, rolls back or is dropped.
struct WriterPermit {
    gate: Arc<WriterGate>,
}

impl Drop for WriterPermit {
    fn drop(&mut self) {
        *lock_gate(&self.gate.busy) = false;
        self.gate.freed.notify_one();
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Handle on the redb file. Cheap to clone.
#[derive(Clone)]
pub struct GraphStore {
    db: Arc<Database>,
    gate: Arc<WriterGate>,
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore").finish_non_exhaustive()
    }
}

impl GraphStore {
    /// Open or create the graph database and its tables.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrellisError> {
        let db = Database::create(path.as_ref()).map_err(TrellisError::graph)?;
        let write_txn = db.begin_write().map_err(TrellisError::graph)?;
        {
            write_txn.open_table(ENTITIES).map_err(TrellisError::graph)?;
            write_txn.open_table(ENTITY_KEYS).map_err(TrellisError::graph)?;
            write_txn
                .open_table(RELATIONSHIPS)
                .map_err(TrellisError::graph)?;
            write_txn
                .open_table(RELATIONSHIP_INDEX)
                .map_err(TrellisError::graph)?;
            write_txn.open_table(APPLIED).map_err(TrellisError::graph)?;
        }
        write_txn.commit().map_err(TrellisError::graph)?;
        Ok(Self {
            db: Arc::new(db),
            gate: Arc::default(),
        })
    }

    #[must_use]
    pub fn connector(&self) -> GraphConnector {
        GraphConnector {
            db: Arc::clone(&self.db),
            gate: Arc::clone(&self.gate),
        }
    }
}

/// Pool factory for graph connections.
pub struct GraphConnector {
    db: Arc<Database>,
    gate: Arc<WriterGate>,
}

impl ConnectionFactory for GraphConnector {
    type Connection = GraphConnection;

    fn store(&self) -> StoreKind {
        StoreKind::Graph
    }

    fn connect(&self) -> Result<GraphConnection, TrellisError> {
        Ok(GraphConnection {
            db: Arc::clone(&self.db),
            gate: Arc::clone(&self.gate),
        })
    }

    fn is_healthy(&self, conn: &mut GraphConnection) -> bool {
        match conn.db.begin_read() {
            Ok(txn) => txn.open_table(APPLIED).is_ok(),
            Err(_) => false,
        }
    }
}

/// A pooled session on the graph database.
pub struct GraphConnection {
    db: Arc<Database>,
    gate: Arc<WriterGate>,
}

/// Writes applied inside an open redb write transaction, not yet committed.
pub struct StagedGraphWrite {
    txn: WriteTransaction,
    tx_id: TxId,
    writes: usize,
    // dropped after `txn`, so the next writer never waits on redb
    _permit: WriterPermit,
}

impl StagedGraphWrite {
    pub fn commit(self) -> Result<(), TrellisError> {
        let Self {
            txn,
            tx_id,
            writes,
            _permit,
        } = self;
        txn.commit().map_err(TrellisError::graph)?;
        tracing::debug!(%tx_id, writes, "graph writes committed");
        Ok(())
    }

    pub fn rollback(self) -> Result<(), TrellisError> {
        let Self { txn, tx_id, _permit, .. } = self;
        txn.abort().map_err(TrellisError::graph)?;
        tracing::debug!(%tx_id, "graph writes rolled back");
        Ok(())
    }
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, TrellisError> {
    postcard::from_bytes(bytes).map_err(TrellisError::from)
}

impl GraphConnection {
    /// Open a write transaction and apply every write without committing.
    ///
    /// Entities whose native key already belongs to a different internal id
    /// are rejected with `IdentityCollision`; relationships need existing,
    /// live endpoints (in the store or earlier in `writes`).
    pub fn stage(&self, tx_id: TxId, writes: &[GraphWrite]) -> Result<StagedGraphWrite, TrellisError> {
        self.stage_within(tx_id, writes, None)
    }

    /// [`stage`](Self::stage), but fail instead of waiting longer than
    /// `budget` for another staged write to finish.
    pub fn stage_within(
        &self,
        tx_id: TxId,
        writes: &[GraphWrite],
        budget: Option<Duration>,
    ) -> Result<StagedGraphWrite, TrellisError> {
        let permit = WriterGate::enter(&self.gate, budget)?;
        let txn = self.db.begin_write().map_err(TrellisError::graph)?;
        {
            let mut entities = txn.open_table(ENTITIES).map_err(TrellisError::graph)?;
            let mut keys = txn.open_table(ENTITY_KEYS).map_err(TrellisError::graph)?;
            let mut relationships = txn.open_table(RELATIONSHIPS).map_err(TrellisError::graph)?;
            let mut rel_index = txn
                .open_table(RELATIONSHIP_INDEX)
                .map_err(TrellisError::graph)?;
            let mut applied = txn.open_table(APPLIED).map_err(TrellisError::graph)?;

            for write in writes {
                tracing::trace!(%tx_id, cypher = %write.to_cypher(), "staging graph write");
                match write {
                    GraphWrite::MergeEntity(entity) => {
                        let key = native_id(
                            StoreKind::Graph,
                            &entity.entity_type,
                            &entity.canonical_name,
                        );
                        let existing: Option<Entity> = entities
                            .get(key.as_str())
                            .map_err(TrellisError::graph)?
                            .map(|guard| decode(guard.value()))
                            .transpose()?;
                        if let Some(existing) = existing {
                            if existing.internal_id != entity.internal_id {
                                return Err(TrellisError::IdentityCollision {
                                    store: StoreKind::Graph,
                                    native_id: key,
                                    existing: existing.internal_id,
                                    requested: entity.canonical_name.clone(),
                                });
                            }
                        }
                        let bytes = postcard::to_allocvec(entity)?;
                        entities
                            .insert(key.as_str(), bytes.as_slice())
                            .map_err(TrellisError::graph)?;
                        keys.insert(entity.internal_id.0.as_u128(), key.as_str())
                            .map_err(TrellisError::graph)?;
                    }
                    GraphWrite::MergeRelationship(rel) => {
                        for (role, id) in [("source", rel.source_id), ("target", rel.target_id)] {
                            let key = keys
                                .get(id.0.as_u128())
                                .map_err(TrellisError::graph)?
                                .map(|guard| guard.value().to_string())
                                .ok_or_else(|| {
                                    TrellisError::InvalidInput(format!(
                                        "relationship {} has unknown {role} {id}",
                                        rel.internal_id
                                    ))
                                })?;
                            let endpoint: Option<Entity> = entities
                                .get(key.as_str())
                                .map_err(TrellisError::graph)?
                                .map(|guard| decode(guard.value()))
                                .transpose()?;
                            if endpoint.is_none_or(|e| e.retired) {
                                return Err(TrellisError::InvalidInput(format!(
                                    "relationship {} points at retired {role} {id}",
                                    rel.internal_id
                                )));
                            }
                        }
                        let bytes = postcard::to_allocvec(rel)?;
                        relationships
                            .insert(rel.internal_id.0.as_u128(), bytes.as_slice())
                            .map_err(TrellisError::graph)?;
                        rel_index
                            .insert(
                                (
                                    rel.source_id.0.as_u128(),
                                    rel.target_id.0.as_u128(),
                                    rel.rel_type.as_str(),
                                ),
                                rel.internal_id.0.as_u128(),
                            )
                            .map_err(TrellisError::graph)?;
                    }
                }
            }
            applied
                .insert(tx_id.0.as_u128(), chrono::Utc::now().timestamp_millis())
                .map_err(TrellisError::graph)?;
        }
        Ok(StagedGraphWrite {
            txn,
            tx_id,
            writes: writes.len(),
            _permit: permit,
        })
    }

    /// Whether a transaction's writes are already committed here.
    pub fn has_applied(&self, tx_id: TxId) -> Result<bool, TrellisError> {
        let txn = self.db.begin_read().map_err(TrellisError::graph)?;
        let applied = txn.open_table(APPLIED).map_err(TrellisError::graph)?;
        Ok(applied
            .get(tx_id.0.as_u128())
            .map_err(TrellisError::graph)?
            .is_some())
    }

    pub fn entity(&self, id: InternalId) -> Result<Option<Entity>, TrellisError> {
        let txn = self.db.begin_read().map_err(TrellisError::graph)?;
        let keys = txn.open_table(ENTITY_KEYS).map_err(TrellisError::graph)?;
        let Some(key) = keys
            .get(id.0.as_u128())
            .map_err(TrellisError::graph)?
            .map(|guard| guard.value().to_string())
        else {
            return Ok(None);
        };
        let entities = txn.open_table(ENTITIES).map_err(TrellisError::graph)?;
        entities
            .get(key.as_str())
            .map_err(TrellisError::graph)?
            .map(|guard| decode(guard.value()))
            .transpose()
    }

    pub fn relationship(&self, id: InternalId) -> Result<Option<Relationship>, TrellisError> {
        let txn = self.db.begin_read().map_err(TrellisError::graph)?;
        let relationships = txn.open_table(RELATIONSHIPS).map_err(TrellisError::graph)?;
        relationships
            .get(id.0.as_u128())
            .map_err(TrellisError::graph)?
            .map(|guard| decode(guard.value()))
            .transpose()
    }

    /// Relationship id stored under the `(source)-[type]->(target)` MERGE key.
    pub fn find_relationship(
        &self,
        source: InternalId,
        rel_type: &crate::TypeLabel,
        target: InternalId,
    ) -> Result<Option<InternalId>, TrellisError> {
        let txn = self.db.begin_read().map_err(TrellisError::graph)?;
        let index = txn
            .open_table(RELATIONSHIP_INDEX)
            .map_err(TrellisError::graph)?;
        Ok(index
            .get((source.0.as_u128(), target.0.as_u128(), rel_type.as_str()))
            .map_err(TrellisError::graph)?
            .map(|guard| InternalId(uuid::Uuid::from_u128(guard.value()))))
    }

    /// `(entities, relationships)` currently stored.
    pub fn counts(&self) -> Result<(u64, u64), TrellisError> {
        let txn = self.db.begin_read().map_err(TrellisError::graph)?;
        let entities = txn.open_table(ENTITIES).map_err(TrellisError::graph)?;
        let relationships = txn.open_table(RELATIONSHIPS).map_err(TrellisError::graph)?;
        Ok((
            entities.len().map_err(TrellisError::graph)?,
            relationships.len().map_err(TrellisError::graph)?,
        ))
    }

    /// Read the whole graph in one read transaction.
    pub fn load_snapshot(&self) -> Result<GraphSnapshot, TrellisError> {
        let txn = self.db.begin_read().map_err(TrellisError::graph)?;
        let mut snapshot = GraphSnapshot::new();

        let entities = txn.open_table(ENTITIES).map_err(TrellisError::graph)?;
        for entry in entities.iter().map_err(TrellisError::graph)? {
            let (_, value) = entry.map_err(TrellisError::graph)?;
            snapshot.upsert_entity(decode(value.value())?);
        }

        let relationships = txn.open_table(RELATIONSHIPS).map_err(TrellisError::graph)?;
        for entry in relationships.iter().map_err(TrellisError::graph)? {
            let (_, value) = entry.map_err(TrellisError::graph)?;
            snapshot.insert_relationship_unchecked(decode(value.value())?);
        }

        snapshot.validate(EndpointPolicy::Exists)?;
        Ok(snapshot)
    }
}

// =============================================================================
// TESTS
// =============================================================================
