//! # Engine
//!
//! Explicit wiring of every component. `Engine::open` builds the stores,
//! pools, transaction manager and id mapper from an [`EngineConfig`], runs
//! crash recovery, and starts the pool health checks. Nothing is global:
//! the process entry point owns the engine and hands out references.

use crate::config::EngineConfig;
use crate::graph::GraphSnapshot;
use crate::ingest::{ExtractionBatch, Ingestor, WriteReceipt};
use crate::mapper::IdMapper;
use crate::pool::{Pool, PoolSettings, PoolStats};
use crate::storage::{
    GraphPool, GraphStore, RelationalCounts, RelationalPool, RelationalStore, UncertaintyLogEntry,
};
use crate::transform::{TableSnapshot, Transformed, Transformer, VectorView};
use crate::txn::{
    GraphParticipant, Participant, RecoveryReport, RelationalParticipant, RetryReport,
    TransactionManager, TxSettings, TxStatus,
};
use crate::{Entity, InternalId, SnapshotId, TrellisError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Metadata of a captured graph snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub snapshot_id: SnapshotId,
    pub entities: usize,
    pub relationships: usize,
    pub captured_at: DateTime<Utc>,
}

struct CatalogEntry {
    info: SnapshotInfo,
    graph: Arc<GraphSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub graph: bool,
    pub relational: bool,
}

impl HealthReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.graph && self.relational
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub entities: u64,
    pub relationships: u64,
    pub relational: RelationalCounts,
    pub mapped_entities: usize,
    pub snapshots: usize,
    pub pools: Vec<PoolStats>,
    pub transactions: TxStatus,
}

pub struct Engine {
    config: EngineConfig,
    graph_pool: Arc<GraphPool>,
    relational_pool: Arc<RelationalPool>,
    dtm: TransactionManager,
    mapper: IdMapper,
    transformer: Transformer,
    snapshots: Mutex<BTreeMap<SnapshotId, CatalogEntry>>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("graph_path", &self.config.storage.graph_path)
            .field("relational_path", &self.config.storage.relational_path)
            .finish()
    }
}

fn ensure_parent(path: &Path) -> Result<(), TrellisError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

impl Engine {
    /// Open (or create) the stores and bring the engine to a consistent state.
    pub fn open(config: EngineConfig) -> Result<Self, TrellisError> {
        config.validate()?;
        let storage = &config.storage;
        for path in [&storage.graph_path, &storage.relational_path, &storage.wal_path] {
            ensure_parent(path)?;
        }

        let graph_store = GraphStore::open(&storage.graph_path)?;
        let relational_store = RelationalStore::open(
            &storage.relational_path,
            config.transactions.prepare_timeout(),
        )?;
        let settings = PoolSettings::from_config(&config.pool);
        let graph_pool = Arc::new(Pool::new(
            graph_store.connector(),
            config.pool.graph,
            settings,
        )?);
        let relational_pool = Arc::new(Pool::new(
            relational_store.connector(),
            config.pool.relational,
            settings,
        )?);

        let participants: Vec<Arc<dyn Participant>> = vec![
            Arc::new(GraphParticipant::new(Arc::clone(&graph_pool))),
            Arc::new(RelationalParticipant::new(Arc::clone(&relational_pool))),
        ];
        let dtm = TransactionManager::open(
            &storage.wal_path,
            participants,
            TxSettings::from_config(&config.transactions),
        )?;
        let recovery = dtm.recover();

        // after recovery, so replayed mappings are included
        let mut lease = relational_pool.acquire(None)?;
        let mappings = lease.connection()?.load_mappings()?;
        lease.release(None)?;
        let mapper = IdMapper::from_mappings(&mappings);

        let transformer = Transformer::new(config.transform.fidelity_threshold)?;
        graph_pool.start_health_checks()?;
        relational_pool.start_health_checks()?;

        tracing::info!(
            graph = %storage.graph_path.display(),
            relational = %storage.relational_path.display(),
            entities = mapper.len(),
            "engine opened"
        );
        Ok(Self {
            config,
            graph_pool,
            relational_pool,
            dtm,
            mapper,
            transformer,
            snapshots: Mutex::new(BTreeMap::new()),
            recovery,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What startup recovery did.
    #[must_use]
    pub fn last_recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    #[must_use]
    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.dtm
    }

    #[must_use]
    pub fn mapper(&self) -> &IdMapper {
        &self.mapper
    }

    #[must_use]
    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    fn ingestor(&self) -> Ingestor<'_> {
        Ingestor::new(
            &self.mapper,
            &self.dtm,
            &self.graph_pool,
            &self.transformer,
            self.config.pipeline,
        )
    }

    // ===== WRITES =====

    pub fn ingest(&self, batch: &ExtractionBatch) -> Result<WriteReceipt, TrellisError> {
        self.ingestor().ingest(batch)
    }

    pub fn ingest_json(&self, text: &str) -> Result<WriteReceipt, TrellisError> {
        self.ingest(&ExtractionBatch::from_json(text)?)
    }

    pub fn retire_entity(&self, internal_id: InternalId) -> Result<WriteReceipt, TrellisError> {
        self.ingestor().retire_entity(internal_id)
    }

    // ===== READS =====

    pub fn entity(&self, internal_id: InternalId) -> Result<Entity, TrellisError> {
        let mut lease = self.graph_pool.acquire(None)?;
        let entity = lease.connection()?.entity(internal_id)?;
        lease.release(None)?;
        entity.ok_or_else(|| TrellisError::NotFound(format!("entity {internal_id}")))
    }

    pub fn uncertainty_history(
        &self,
        internal_id: InternalId,
    ) -> Result<Vec<UncertaintyLogEntry>, TrellisError> {
        let mut lease = self.relational_pool.acquire(None)?;
        let history = lease.connection()?.uncertainty_history(internal_id)?;
        lease.release(None)?;
        Ok(history)
    }

    // ===== SNAPSHOTS =====

    fn catalog(&self) -> MutexGuard<'_, BTreeMap<SnapshotId, CatalogEntry>> {
        match self.snapshots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("snapshot catalog mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Capture the current canonical graph under a new snapshot id.
    pub fn snapshot(&self) -> Result<SnapshotInfo, TrellisError> {
        let mut lease = self.graph_pool.acquire(None)?;
        let graph = lease.connection()?.load_snapshot()?;
        lease.release(None)?;

        let info = SnapshotInfo {
            snapshot_id: SnapshotId::new_v4(),
            entities: graph.entity_count(),
            relationships: graph.relationship_count(),
            captured_at: Utc::now(),
        };
        self.catalog().insert(
            info.snapshot_id,
            CatalogEntry {
                info: info.clone(),
                graph: Arc::new(graph),
            },
        );
        tracing::info!(snapshot_id = %info.snapshot_id, entities = info.entities, "snapshot captured");
        Ok(info)
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<SnapshotInfo> {
        self.catalog().values().map(|e| e.info.clone()).collect()
    }

    pub fn graph_snapshot(&self, id: SnapshotId) -> Result<Arc<GraphSnapshot>, TrellisError> {
        self.catalog()
            .get(&id)
            .map(|e| Arc::clone(&e.graph))
            .ok_or_else(|| TrellisError::NotFound(format!("snapshot {id}")))
    }

    pub fn table_view(&self, id: SnapshotId) -> Result<Transformed<TableSnapshot>, TrellisError> {
        let graph = self.graph_snapshot(id)?;
        Ok(self.transformer.graph_to_table(&graph, None))
    }

    /// Vector view of a snapshot, with a vocabulary built from its own table.
    pub fn vector_view(&self, id: SnapshotId) -> Result<Transformed<VectorView>, TrellisError> {
        let table = self.table_view(id)?;
        let mut view = self.transformer.table_to_vector(&table.output, None)?;
        // fields the table projection already lost stay reported
        for field in table.report.dropped_fields {
            if !view.report.dropped_fields.contains(&field) {
                view.report.dropped_fields.push(field);
            }
        }
        Ok(view)
    }

    // ===== OPERATIONS =====

    pub fn recover(&self) -> RecoveryReport {
        self.dtm.recover()
    }

    pub fn retry_pending(&self) -> RetryReport {
        self.dtm.retry_pending()
    }

    pub fn checkpoint(&self) -> Result<usize, TrellisError> {
        self.dtm.checkpoint()
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            graph: self.graph_pool.health_check(),
            relational: self.relational_pool.health_check(),
        }
    }

    pub fn status(&self) -> Result<EngineStatus, TrellisError> {
        let mut graph_lease = self.graph_pool.acquire(None)?;
        let (entities, relationships) = graph_lease.connection()?.counts()?;
        graph_lease.release(None)?;
        let mut rel_lease = self.relational_pool.acquire(None)?;
        let relational = rel_lease.connection()?.counts()?;
        rel_lease.release(None)?;

        Ok(EngineStatus {
            entities,
            relationships,
            relational,
            mapped_entities: self.mapper.len(),
            snapshots: self.catalog().len(),
            pools: vec![self.graph_pool.stats(), self.relational_pool.stats()],
            transactions: self.dtm.status(),
        })
    }

    /// Stop background health checks and close idle connections.
    pub fn shutdown(&self) {
        self.graph_pool.shutdown();
        self.relational_pool.shutdown();
        tracing::info!("engine shut down");
    }
}
