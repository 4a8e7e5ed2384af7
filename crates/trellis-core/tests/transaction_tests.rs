//! # Distributed Transaction Tests
//!
//! End-to-end writes through the 2PC coordinator, with a fault-injecting
//! participant wrapped around the real stores.

#![allow(clippy::panic)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use trellis_core::config::PipelineConfig;
use trellis_core::pool::PoolSettings;
use trellis_core::storage::{
    GraphPool, GraphStore, GraphWrite, IdMapping, RelationalPool, RelationalStore, RelationalWrite,
};
use trellis_core::txn::{
    Enlisted, GraphParticipant, Operation, Participant, RelationalParticipant, TransactionRecord,
    TxSettings, Wal, WalEntry,
};
use trellis_core::{
    CommitOutcome, Engine, EngineConfig, Entity, ErrorCode, ExtractionBatch, IdMapper, Ingestor,
    InternalId, Pool, StoreKind, TrellisError, TransactionManager, Transformer, TxId, TxState,
    TypeLabel, UncertaintyRecord, Value,
};

const EXAMPLE: &str = r#"{
    "entities": [
        {"id": "e1", "name": "Acme Corp", "type": "ORG", "confidence": 0.9},
        {"id": "e2", "name": "Jane Doe", "type": "PERSON", "confidence": 0.8,
         "attributes": {"title": "CEO"}}
    ],
    "relationships": [
        {"source": "e1", "target": "e2", "type": "EMPLOYS", "confidence": 0.7,
         "attributes": {"since": 2019}}
    ]
}"#;

// =============================================================================
// FAULT INJECTION
// =============================================================================

#[derive(Default)]
struct Faults {
    fail_prepare: AtomicBool,
    /// Number of commit and replay attempts that fail before one succeeds.
    fail_commits: AtomicUsize,
    prepare_delay_ms: AtomicU64,
}

impl Faults {
    fn take_commit_failure(&self) -> bool {
        self.fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn injected(store: StoreKind, what: &str) -> TrellisError {
    TrellisError::Storage {
        store,
        message: format!("injected {what} failure"),
    }
}

struct Faulty {
    inner: Arc<dyn Participant>,
    faults: Arc<Faults>,
}

impl Participant for Faulty {
    fn store(&self) -> StoreKind {
        self.inner.store()
    }

    fn enlist(&self, tx_id: TxId) -> Result<Box<dyn Enlisted>, TrellisError> {
        Ok(Box::new(FaultyEnlisted {
            inner: self.inner.enlist(tx_id)?,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn replay(&self, record: &TransactionRecord) -> Result<(), TrellisError> {
        if self.faults.take_commit_failure() {
            return Err(injected(self.store(), "replay"));
        }
        self.inner.replay(record)
    }

    fn has_committed(&self, tx_id: TxId) -> Result<bool, TrellisError> {
        self.inner.has_committed(tx_id)
    }
}

struct FaultyEnlisted {
    inner: Box<dyn Enlisted>,
    faults: Arc<Faults>,
}

impl Enlisted for FaultyEnlisted {
    fn store(&self) -> StoreKind {
        self.inner.store()
    }

    fn prepare(&mut self, record: &TransactionRecord, budget: Duration) -> Result<(), TrellisError> {
        let delay = self.faults.prepare_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.faults.fail_prepare.load(Ordering::SeqCst) {
            return Err(injected(self.store(), "prepare"));
        }
        self.inner.prepare(record, budget)
    }

    fn commit(&mut self) -> Result<(), TrellisError> {
        if self.faults.take_commit_failure() {
            return Err(injected(self.store(), "commit"));
        }
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), TrellisError> {
        self.inner.rollback()
    }

    fn release(self: Box<Self>) -> Result<(), TrellisError> {
        self.inner.release()
    }
}

// =============================================================================
// HARNESS
// =============================================================================

struct Harness {
    _dir: TempDir,
    graph_pool: Arc<GraphPool>,
    relational_pool: Arc<RelationalPool>,
    dtm: TransactionManager,
    mapper: IdMapper,
    transformer: Transformer,
    graph_faults: Arc<Faults>,
    relational_faults: Arc<Faults>,
}

const NO_STAGES: PipelineConfig = PipelineConfig {
    normalization_uncertainty: 0.0,
    persistence_uncertainty: 0.0,
};

fn settings(prepare_timeout_ms: u64) -> TxSettings {
    TxSettings {
        prepare_timeout: Duration::from_millis(prepare_timeout_ms),
        commit_backoff: vec![Duration::from_millis(1), Duration::from_millis(1)],
    }
}

fn harness(tx_settings: TxSettings) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let config = EngineConfig::rooted_at(dir.path());
    let pool_settings = PoolSettings::from_config(&config.pool);
    let graph_store = GraphStore::open(&config.storage.graph_path).expect("graph store");
    let relational_store =
        RelationalStore::open(&config.storage.relational_path, tx_settings.prepare_timeout)
            .expect("relational store");
    let graph_pool = Arc::new(
        Pool::new(graph_store.connector(), config.pool.graph, pool_settings).expect("graph pool"),
    );
    let relational_pool = Arc::new(
        Pool::new(relational_store.connector(), config.pool.relational, pool_settings)
            .expect("relational pool"),
    );

    let graph_faults = Arc::new(Faults::default());
    let relational_faults = Arc::new(Faults::default());
    let participants: Vec<Arc<dyn Participant>> = vec![
        Arc::new(Faulty {
            inner: Arc::new(GraphParticipant::new(Arc::clone(&graph_pool))),
            faults: Arc::clone(&graph_faults),
        }),
        Arc::new(Faulty {
            inner: Arc::new(RelationalParticipant::new(Arc::clone(&relational_pool))),
            faults: Arc::clone(&relational_faults),
        }),
    ];
    let dtm = TransactionManager::open(&config.storage.wal_path, participants, tx_settings)
        .expect("transaction manager");

    Harness {
        _dir: dir,
        graph_pool,
        relational_pool,
        dtm,
        mapper: IdMapper::new(),
        transformer: Transformer::new(0.95).expect("threshold"),
        graph_faults,
        relational_faults,
    }
}

impl Harness {
    fn ingestor(&self) -> Ingestor<'_> {
        Ingestor::new(
            &self.mapper,
            &self.dtm,
            &self.graph_pool,
            &self.transformer,
            NO_STAGES,
        )
    }

    fn ingest(&self, json: &str) -> Result<trellis_core::WriteReceipt, TrellisError> {
        self.ingestor()
            .ingest(&ExtractionBatch::from_json(json).expect("parse"))
    }

    fn graph_counts(&self) -> (u64, u64) {
        let mut lease = self.graph_pool.acquire(None).expect("lease");
        let counts = lease.connection().expect("conn").counts().expect("counts");
        lease.release(None).expect("release");
        counts
    }

    fn relational_counts(&self) -> trellis_core::storage::RelationalCounts {
        let mut lease = self.relational_pool.acquire(None).expect("lease");
        let counts = lease.connection().expect("conn").counts().expect("counts");
        lease.release(None).expect("release");
        counts
    }

    fn assert_no_leases(&self) {
        assert_eq!(self.graph_pool.stats().leased, 0);
        assert_eq!(self.relational_pool.stats().leased, 0);
    }
}

fn label(s: &str) -> TypeLabel {
    TypeLabel::parse(s).expect("label")
}

fn acme_id() -> InternalId {
    InternalId::for_entity(&label("ORG"), "Acme Corp")
}

impl Harness {
    fn acme(&self) -> Entity {
        let mut lease = self.graph_pool.acquire(None).expect("lease");
        let acme = lease
            .connection()
            .expect("conn")
            .entity(acme_id())
            .expect("read")
            .expect("stored");
        lease.release(None).expect("release");
        acme
    }
}

const ACME_WITH_X: &str = r#"{"entities": [
    {"id": "a", "name": "Acme Corp", "type": "ORG", "confidence": 0.9, "attributes": {"x": 1}}
]}"#;

// =============================================================================
// HAPPY PATH
// =============================================================================

#[test]
fn example_batch_lands_in_both_stores() {
    let dir = TempDir::new().expect("tempdir");
    let engine = Engine::open(EngineConfig::rooted_at(dir.path())).expect("engine");

    let receipt = engine.ingest_json(EXAMPLE).expect("ingest");
    assert_eq!(receipt.outcome, CommitOutcome::Committed);
    assert_eq!(receipt.entity_ids.len(), 2);
    assert_eq!(receipt.relationship_ids.len(), 1);
    assert!(receipt.fidelity.is_lossless());

    let status = engine.status().expect("status");
    assert_eq!((status.entities, status.relationships), (2, 1));
    assert_eq!(status.relational.transactions, 1);
    assert_eq!(status.relational.id_mappings, 4);
    assert_eq!(status.relational.uncertainty_records, 3);
    assert_eq!(status.relational.provenance_rows, 3);
    assert_eq!(status.mapped_entities, 2);

    let acme = engine.entity(acme_id()).expect("acme");
    assert!((acme.confidence.value() - 0.1).abs() < 1e-9);
    assert_eq!(engine.uncertainty_history(acme_id()).expect("history").len(), 1);

    let snapshot = engine.snapshot().expect("snapshot");
    let graph = engine.graph_snapshot(snapshot.snapshot_id).expect("graph");
    let table = engine.table_view(snapshot.snapshot_id).expect("table");
    assert_eq!(table.output.row_count(), 3);
    let rebuilt = engine
        .transformer()
        .table_to_graph(&table.output)
        .expect("rebuild");
    assert!(graph.is_isomorphic_to(&rebuilt));

    let vectors = engine.vector_view(snapshot.snapshot_id).expect("vectors");
    assert_eq!(vectors.output.vector.rows.len(), 3);
    assert!((vectors.report.fidelity_score - 1.0).abs() < f64::EPSILON);
    engine.shutdown();
}

#[test]
fn repeated_mentions_merge_as_parallel_evidence() {
    let h = harness(settings(5_000));
    h.ingest(EXAMPLE).expect("first");
    h.ingest(EXAMPLE).expect("second");

    assert_eq!(h.graph_counts(), (2, 1));
    let acme = h.acme();
    // two independent 0.9 observations agree, so uncertainty shrinks
    assert!(acme.confidence.value() < 0.1);

    let counts = h.relational_counts();
    assert_eq!(counts.transactions, 2);
    assert_eq!(counts.id_mappings, 4);
    assert_eq!(counts.uncertainty_records, 6);
    h.assert_no_leases();
}

// =============================================================================
// FAILURE PATHS
// =============================================================================

#[test]
fn prepare_failure_on_either_store_leaves_nothing_visible() {
    for store in StoreKind::ALL {
        let h = harness(settings(5_000));
        let faults = match store {
            StoreKind::Graph => &h.graph_faults,
            StoreKind::Relational => &h.relational_faults,
        };
        faults.fail_prepare.store(true, Ordering::SeqCst);

        let err = h.ingest(EXAMPLE).expect_err("prepare must fail");
        match &err {
            TrellisError::PrepareFailed {
                tx_id, participant, ..
            } => {
                assert_eq!(*participant, store);
                assert_eq!(h.dtm.state(*tx_id), Some(TxState::Aborted));
            }
            other => panic!("expected PrepareFailed, got {other:?}"),
        }
        assert_eq!(h.graph_counts(), (0, 0));
        let counts = h.relational_counts();
        assert_eq!(counts.id_mappings, 0);
        assert_eq!(counts.transactions, 0);
        assert!(h.mapper.is_empty());
        h.assert_no_leases();

        // the next write goes through once the fault clears
        faults.fail_prepare.store(false, Ordering::SeqCst);
        h.ingest(EXAMPLE).expect("retry after fault");
        assert_eq!(h.graph_counts(), (2, 1));
    }
}

#[test]
fn prepare_timeout_aborts() {
    let h = harness(settings(20));
    h.relational_faults
        .prepare_delay_ms
        .store(60, Ordering::SeqCst);

    let err = h.ingest(EXAMPLE).expect_err("timeout");
    assert_eq!(err.code(), ErrorCode::Aborted);
    assert_eq!(h.graph_counts(), (0, 0));
    assert_eq!(h.relational_counts().transactions, 0);
    h.assert_no_leases();
}

#[test]
fn prepare_stops_waiting_for_a_busy_graph_writer_at_the_deadline() {
    let h = harness(settings(50));
    let mut holder = h.graph_pool.acquire(None).expect("lease");
    let held = holder
        .connection()
        .expect("conn")
        .stage(TxId::new_v4(), &[])
        .expect("hold the writer");

    let started = Instant::now();
    let err = h.ingest(EXAMPLE).expect_err("writer busy");
    assert_eq!(err.code(), ErrorCode::Aborted);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.relational_counts().transactions, 0);

    held.rollback().expect("rollback");
    holder.release(None).expect("release");
    h.ingest(EXAMPLE).expect("writer free again");
    assert_eq!(h.graph_counts(), (2, 1));
    h.assert_no_leases();
}

#[test]
fn failed_commit_is_retried_until_pending_then_finished() {
    let h = harness(settings(5_000));
    // the commit plus both backoff replays fail
    h.relational_faults.fail_commits.store(3, Ordering::SeqCst);

    let receipt = h.ingest(EXAMPLE).expect("decision is durable");
    assert_eq!(
        receipt.outcome,
        CommitOutcome::CommittedWithRetryPending {
            pending: vec![StoreKind::Relational]
        }
    );
    assert_eq!(h.dtm.state(receipt.tx_id), Some(TxState::Committing));
    assert_eq!(h.dtm.status().pending_commit, vec![receipt.tx_id]);
    assert_eq!(h.graph_counts(), (2, 1));
    assert_eq!(h.relational_counts().transactions, 0);

    let report = h.dtm.retry_pending();
    assert_eq!(report.committed, vec![receipt.tx_id]);
    assert!(report.still_pending.is_empty());
    assert_eq!(h.dtm.state(receipt.tx_id), Some(TxState::Committed));
    assert_eq!(h.relational_counts().id_mappings, 4);
    h.assert_no_leases();
}

#[test]
fn pending_commit_lands_before_a_newer_write_to_the_same_entity() {
    let h = harness(settings(5_000));
    // the commit plus both backoff replays fail
    h.graph_faults.fail_commits.store(3, Ordering::SeqCst);
    let first = h.ingest(EXAMPLE).expect("decision is durable");
    assert_eq!(
        first.outcome,
        CommitOutcome::CommittedWithRetryPending {
            pending: vec![StoreKind::Graph]
        }
    );
    assert_eq!(h.graph_counts(), (0, 0));

    let second = h.ingest(ACME_WITH_X).expect("newer write");
    assert_eq!(second.outcome, CommitOutcome::Committed);
    assert_eq!(h.dtm.state(first.tx_id), Some(TxState::Committed));

    // nothing left for a later retry to overwrite
    let report = h.dtm.retry_pending();
    assert!(report.committed.is_empty());
    assert!(report.still_pending.is_empty());
    let acme = h.acme();
    assert_eq!(acme.attributes.get("x"), Some(&Value::Int(1)));
    assert!(acme.confidence.value() < 0.1);
    assert_eq!(h.graph_counts(), (2, 1));
    assert_eq!(h.relational_counts().transactions, 2);
    h.assert_no_leases();
}

#[test]
fn newer_write_is_refused_while_an_older_commit_cannot_land() {
    let h = harness(settings(5_000));
    // one more failure than the commit and its backoff replays
    h.graph_faults.fail_commits.store(4, Ordering::SeqCst);
    let first = h.ingest(EXAMPLE).expect("decision is durable");

    let err = h.ingest(ACME_WITH_X).expect_err("older commit still pending");
    assert_eq!(err.code(), ErrorCode::PartialCommitPending);
    assert!(err.is_retryable());
    assert_eq!(err.tx_id(), Some(first.tx_id));
    assert_eq!(h.graph_counts(), (0, 0));
    assert_eq!(h.relational_counts().transactions, 1);
    h.assert_no_leases();

    h.ingest(ACME_WITH_X).expect("retry once the store recovers");
    assert_eq!(h.dtm.state(first.tx_id), Some(TxState::Committed));
    assert_eq!(h.acme().attributes.get("x"), Some(&Value::Int(1)));
}

#[test]
fn writes_to_unrelated_entities_ignore_a_pending_commit() {
    let h = harness(settings(5_000));
    h.graph_faults.fail_commits.store(4, Ordering::SeqCst);
    let first = h.ingest(EXAMPLE).expect("decision is durable");

    h.ingest(r#"{"entities":[{"id":"g","name":"Globex","type":"ORG","confidence":0.6}]}"#)
        .expect("disjoint write");
    assert_eq!(h.dtm.state(first.tx_id), Some(TxState::Committing));
}

#[test]
fn concurrent_writers_to_one_entity_all_land() {
    let h = harness(settings(5_000));
    let writers = 8;
    std::thread::scope(|scope| {
        for i in 0..writers {
            let h = &h;
            scope.spawn(move || {
                let batch = format!(
                    r#"{{"entities":[{{"id":"a","name":"Acme Corp","type":"ORG",
                        "confidence":0.9,"attributes":{{"k{i}":{i}}}}}]}}"#
                );
                h.ingest(&batch).expect("ingest")
            });
        }
    });

    let acme = h.acme();
    assert_eq!(acme.attributes.len(), writers);
    for i in 0..writers {
        assert_eq!(
            acme.attributes.get(&format!("k{i}")),
            Some(&Value::Int(i as i64))
        );
    }
    assert_eq!(h.graph_counts(), (1, 0));
    let counts = h.relational_counts();
    assert_eq!(counts.transactions, writers as u64);
    assert_eq!(counts.uncertainty_records, writers as u64);
    let mut lease = h.relational_pool.acquire(None).expect("lease");
    let history = lease
        .connection()
        .expect("conn")
        .uncertainty_history(acme_id())
        .expect("history");
    lease.release(None).expect("release");
    assert_eq!(history.len(), writers);
    assert_eq!(h.mapper.len(), 1);
    h.assert_no_leases();
}

#[test]
fn single_commit_failure_is_absorbed_by_backoff() {
    let h = harness(settings(5_000));
    h.graph_faults.fail_commits.store(1, Ordering::SeqCst);

    let receipt = h.ingest(EXAMPLE).expect("ingest");
    assert_eq!(receipt.outcome, CommitOutcome::Committed);
    assert_eq!(h.graph_counts(), (2, 1));
    assert_eq!(h.relational_counts().transactions, 1);
}

#[test]
fn replay_is_idempotent() {
    let h = harness(settings(5_000));
    let receipt = h.ingest(EXAMPLE).expect("ingest");

    h.dtm.replay_commit(receipt.tx_id).expect("no-op on committed");
    assert!(matches!(
        h.dtm.replay_commit(TxId::new_v4()),
        Err(TrellisError::NotFound(_))
    ));

    let entity = Entity::new(
        "Globex",
        label("ORG"),
        trellis_core::Attributes::new(),
        UncertaintyRecord::from_confidence(0.6, "ner").expect("record"),
    );
    let mut record = TransactionRecord::new(
        TxId::new_v4(),
        vec![
            Operation::Graph(GraphWrite::MergeEntity(entity.clone())),
            Operation::Relational(RelationalWrite::MapId(IdMapping::for_entity(
                StoreKind::Relational,
                &entity.entity_type,
                &entity.canonical_name,
            ))),
        ],
    );
    record.state = TxState::Committing;
    let graph = GraphParticipant::new(Arc::clone(&h.graph_pool));
    let relational = RelationalParticipant::new(Arc::clone(&h.relational_pool));
    for _ in 0..2 {
        graph.replay(&record).expect("graph replay");
        relational.replay(&record).expect("relational replay");
    }
    assert_eq!(h.graph_counts(), (3, 1));
    let counts = h.relational_counts();
    assert_eq!(counts.transactions, 2);
    assert_eq!(counts.id_mappings, 5);
}

#[test]
fn identity_collision_is_rejected_before_commit() {
    let h = harness(settings(5_000));
    h.ingest(r#"{"entities":[{"id":"a","name":"Apple","type":"ORG","confidence":0.9}]}"#)
        .expect("first");

    let err = h
        .ingest(r#"{"entities":[{"id":"b","name":"apple","type":"FRUIT","confidence":0.9}]}"#)
        .expect_err("collision");
    assert_eq!(err.code(), ErrorCode::IdentityCollision);
    assert_eq!(h.graph_counts(), (1, 0));
    assert_eq!(h.relational_counts().transactions, 1);
    assert_eq!(h.mapper.len(), 1);
    h.assert_no_leases();
}

#[test]
fn retired_entity_takes_no_new_relationships() {
    let h = harness(settings(5_000));
    h.ingest(EXAMPLE).expect("ingest");
    h.ingestor().retire_entity(acme_id()).expect("retire");

    let err = h
        .ingest(
            r#"{
            "entities": [
                {"id": "a", "name": "Acme Corp", "type": "ORG", "confidence": 0.9},
                {"id": "b", "name": "John Roe", "type": "PERSON", "confidence": 0.9}
            ],
            "relationships": [
                {"source": "a", "target": "b", "type": "EMPLOYS", "confidence": 0.9}
            ]
        }"#,
        )
        .expect_err("retired endpoint");
    assert_eq!(err.code(), ErrorCode::InvalidInput);
    // the existing relationship survives retirement
    assert_eq!(h.graph_counts(), (2, 1));
    h.assert_no_leases();
}

#[test]
fn retiring_an_unknown_entity_is_not_found() {
    let h = harness(settings(5_000));
    let err = h
        .ingestor()
        .retire_entity(acme_id())
        .expect_err("unknown");
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn dropped_transaction_aborts() {
    let h = harness(settings(5_000));
    let entity = Entity::new(
        "Initech",
        label("ORG"),
        trellis_core::Attributes::new(),
        UncertaintyRecord::from_confidence(0.5, "ner").expect("record"),
    );
    let tx_id = {
        let mut tx = h
            .dtm
            .begin(vec![Operation::Graph(GraphWrite::MergeEntity(entity))])
            .expect("begin");
        tx.prepare().expect("prepare");
        assert_eq!(tx.state(), TxState::Prepared);
        tx.tx_id()
    };
    assert_eq!(h.dtm.state(tx_id), Some(TxState::Aborted));
    assert_eq!(h.graph_counts(), (0, 0));
    assert_eq!(h.dtm.status().in_flight, 0);
    h.assert_no_leases();
}

// =============================================================================
// RECOVERY
// =============================================================================

fn globex_record() -> TransactionRecord {
    let entity = Entity::new(
        "Globex",
        label("ORG"),
        trellis_core::Attributes::new(),
        UncertaintyRecord::from_confidence(0.6, "ner").expect("record"),
    );
    let mut operations = vec![Operation::Graph(GraphWrite::MergeEntity(entity.clone()))];
    for store in StoreKind::ALL {
        operations.push(Operation::Relational(RelationalWrite::MapId(
            IdMapping::for_entity(store, &entity.entity_type, &entity.canonical_name),
        )));
    }
    TransactionRecord::new(TxId::new_v4(), operations)
}

fn write_crashed_log(path: &Path, record: &TransactionRecord, states: &[TxState]) {
    let (mut wal, existing) = Wal::open(path).expect("wal");
    assert!(existing.is_empty());
    wal.append(&WalEntry::Begin(record.clone())).expect("begin");
    for state in states {
        wal.append(&WalEntry::Transition {
            tx_id: record.tx_id,
            state: *state,
        })
        .expect("transition");
    }
}

#[test]
fn recovery_aborts_prepared_transactions() {
    let dir = TempDir::new().expect("tempdir");
    let config = EngineConfig::rooted_at(dir.path());
    let record = globex_record();
    write_crashed_log(&config.storage.wal_path, &record, &[TxState::Prepared]);

    let engine = Engine::open(config).expect("engine");
    assert_eq!(engine.last_recovery().aborted, vec![record.tx_id]);
    assert!(engine.last_recovery().replayed.is_empty());
    assert_eq!(
        engine.transaction_manager().state(record.tx_id),
        Some(TxState::Aborted)
    );
    let status = engine.status().expect("status");
    assert_eq!(status.entities, 0);
    assert_eq!(status.relational.id_mappings, 0);
    assert!(engine.mapper().is_empty());
}

#[test]
fn recovery_replays_committing_transactions() {
    let dir = TempDir::new().expect("tempdir");
    let config = EngineConfig::rooted_at(dir.path());
    let record = globex_record();
    write_crashed_log(
        &config.storage.wal_path,
        &record,
        &[TxState::Prepared, TxState::Committing],
    );

    let engine = Engine::open(config.clone()).expect("engine");
    assert_eq!(engine.last_recovery().replayed, vec![record.tx_id]);
    assert_eq!(
        engine.transaction_manager().state(record.tx_id),
        Some(TxState::Committed)
    );
    let status = engine.status().expect("status");
    assert_eq!(status.entities, 1);
    assert_eq!(status.relational.id_mappings, 2);
    assert_eq!(engine.mapper().len(), 1);
    let globex = InternalId::for_entity(&label("ORG"), "Globex");
    assert_eq!(
        engine
            .mapper()
            .map_from_native("GLOBEX", StoreKind::Graph)
            .expect("mapped"),
        globex
    );
    engine.shutdown();
    drop(engine);

    // a second start has nothing left to do
    let engine = Engine::open(config).expect("reopen");
    assert!(engine.last_recovery().replayed.is_empty());
    assert!(engine.last_recovery().aborted.is_empty());
    assert_eq!(engine.status().expect("status").entities, 1);
}

#[test]
fn replay_after_checkpoint_is_a_no_op() {
    let h = harness(settings(5_000));
    let receipt = h.ingest(EXAMPLE).expect("ingest");
    h.dtm.checkpoint().expect("checkpoint");
    assert_eq!(h.dtm.state(receipt.tx_id), None);

    h.dtm
        .replay_commit(receipt.tx_id)
        .expect("the stores know it committed");
    assert_eq!(h.graph_counts(), (2, 1));
    let counts = h.relational_counts();
    assert_eq!(counts.transactions, 1);
    assert_eq!(counts.uncertainty_records, 3);
}

#[test]
fn checkpoint_shrinks_the_log() {
    let h = harness(settings(5_000));
    h.ingest(EXAMPLE).expect("first");
    h.ingest(EXAMPLE).expect("second");
    let before = h.dtm.status();
    assert_eq!(before.finished, 2);

    let kept = h.dtm.checkpoint().expect("checkpoint");
    assert_eq!(kept, 0);
    let after = h.dtm.status();
    assert_eq!(after.finished, 0);
    assert!(after.wal_bytes < before.wal_bytes);
}
