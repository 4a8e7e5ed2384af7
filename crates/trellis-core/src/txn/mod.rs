//! # Distributed Transaction Manager
//!
//! Two-phase commit across the graph and relational stores.
//!
//! ```text
//! PREPARING ──▶ PREPARED ──▶ COMMITTING ──▶ COMMITTED
//!     │             │
//!     └──────┬──────┘
//!            ▼
//!        ABORTING ──▶ ABORTED
//! ```
//!
//! Every transition is appended to the write-ahead log before the
//! coordinator acts on it. The `BEGIN` entry carries the full list of
//! writes, so a transaction that reached COMMITTING can always be finished
//! by replaying it, even after a crash. Anything that never reached
//! COMMITTING is presumed aborted on recovery.
//!
//! Participants are always prepared and committed in [`StoreKind`] order
//! (graph, then relational).

mod participant;
mod wal;

pub use participant::{Enlisted, GraphParticipant, Participant, RelationalParticipant};
pub use wal::{Wal, WalEntry, fold};

use crate::config::TransactionConfig;
use crate::storage::{GraphWrite, RelationalWrite};
use crate::{InternalId, StoreKind, TrellisError, TxId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxState {
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Aborting => "ABORTING",
            Self::Aborted => "ABORTED",
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Preparing, Prepared | Aborting)
                | (Prepared, Committing | Aborting)
                | (Committing, Committed)
                | (Aborting, Aborted)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// One write addressed to one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Graph(GraphWrite),
    Relational(RelationalWrite),
}

impl Operation {
    #[must_use]
    pub fn store(&self) -> StoreKind {
        match self {
            Self::Graph(_) => StoreKind::Graph,
            Self::Relational(_) => StoreKind::Relational,
        }
    }

    /// The entity or relationship this operation writes.
    #[must_use]
    pub fn internal_id(&self) -> InternalId {
        match self {
            Self::Graph(GraphWrite::MergeEntity(e)) => e.internal_id,
            Self::Graph(GraphWrite::MergeRelationship(r)) => r.internal_id,
            Self::Relational(RelationalWrite::MapId(m)) => m.internal_id,
            Self::Relational(
                RelationalWrite::LogUncertainty { internal_id, .. }
                | RelationalWrite::Provenance { internal_id, .. },
            ) => *internal_id,
        }
    }
}

/// Everything needed to finish or undo a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_id: TxId,
    pub state: TxState,
    /// Stores with at least one operation.
    pub participants: BTreeSet<StoreKind>,
    pub operations: Vec<Operation>,
    pub created_at_ms: i64,
    /// Participants whose commit is known to have landed.
    pub committed: BTreeSet<StoreKind>,
}

impl TransactionRecord {
    #[must_use]
    pub fn new(tx_id: TxId, operations: Vec<Operation>) -> Self {
        Self {
            tx_id,
            state: TxState::Preparing,
            participants: operations.iter().map(Operation::store).collect(),
            operations,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            committed: BTreeSet::new(),
        }
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn transition(&mut self, next: TxState) -> Result<(), TrellisError> {
        if !self.state.can_transition_to(next) {
            return Err(TrellisError::InvalidTransition {
                tx_id: self.tx_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    #[must_use]
    pub fn graph_writes(&self) -> Vec<GraphWrite> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::Graph(w) => Some(w.clone()),
                Operation::Relational(_) => None,
            })
            .collect()
    }

    #[must_use]
    pub fn relational_writes(&self) -> Vec<RelationalWrite> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::Relational(w) => Some(w.clone()),
                Operation::Graph(_) => None,
            })
            .collect()
    }

    /// Participants that still owe a commit.
    #[must_use]
    pub fn pending(&self) -> Vec<StoreKind> {
        self.participants
            .difference(&self.committed)
            .copied()
            .collect()
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed,
    /// The commit decision is durable but these stores have not applied it
    /// yet, or their commit marker could not be logged; `retry_pending` or
    /// recovery will finish them.
    CommittedWithRetryPending { pending: Vec<StoreKind> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub tx_id: TxId,
    pub outcome: CommitOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub aborted: Vec<TxId>,
    pub replayed: Vec<TxId>,
    pub still_pending: Vec<TxId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub committed: Vec<TxId>,
    pub still_pending: Vec<TxId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxStatus {
    pub in_flight: usize,
    pub pending_commit: Vec<TxId>,
    pub finished: usize,
    pub wal_bytes: u64,
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Debug, Clone)]
pub struct TxSettings {
    pub prepare_timeout: Duration,
    /// One replay attempt per entry, after sleeping that long.
    pub commit_backoff: Vec<Duration>,
}

impl TxSettings {
    #[must_use]
    pub fn from_config(config: &TransactionConfig) -> Self {
        Self {
            prepare_timeout: config.prepare_timeout(),
            commit_backoff: config.backoff(),
        }
    }
}

#[derive(Default)]
struct TxTable {
    active: BTreeMap<TxId, TransactionRecord>,
    finished: BTreeMap<TxId, TxState>,
    /// Transactions driven by a live [`Transaction`] handle.
    in_flight: BTreeSet<TxId>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("transaction manager mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// 2PC coordinator.
pub struct TransactionManager {
    participants: Vec<Arc<dyn Participant>>,
    settings: TxSettings,
    /// Lock order: `table`, then `wal`.
    table: Mutex<TxTable>,
    wal: Mutex<Wal>,
    replay_lock: Mutex<()>,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field(
                "participants",
                &self.participants.iter().map(|p| p.store()).collect::<Vec<_>>(),
            )
            .field("settings", &self.settings)
            .finish()
    }
}

impl TransactionManager {
    /// Open the log and rebuild the transaction table from it.
    ///
    /// Unfinished transactions stay in the table until [`recover`] runs.
    ///
    /// [`recover`]: TransactionManager::recover
    pub fn open(
        wal_path: &Path,
        mut participants: Vec<Arc<dyn Participant>>,
        settings: TxSettings,
    ) -> Result<Self, TrellisError> {
        participants.sort_by_key(|p| p.store());
        let (wal, entries) = Wal::open(wal_path)?;
        let mut table = TxTable::default();
        for (tx_id, record) in fold(entries) {
            if record.state.is_terminal() {
                table.finished.insert(tx_id, record.state);
            } else {
                table.active.insert(tx_id, record);
            }
        }
        if !table.active.is_empty() {
            tracing::info!(unfinished = table.active.len(), "transaction log has unfinished work");
        }
        Ok(Self {
            participants,
            settings,
            table: Mutex::new(table),
            wal: Mutex::new(wal),
            replay_lock: Mutex::new(()),
        })
    }

    fn participant(&self, store: StoreKind) -> Result<&Arc<dyn Participant>, TrellisError> {
        self.participants
            .iter()
            .find(|p| p.store() == store)
            .ok_or_else(|| TrellisError::Config(format!("no participant for {store} store")))
    }

    /// Log and apply a state change. Returns the updated record.
    fn transition(&self, tx_id: TxId, next: TxState) -> Result<TransactionRecord, TrellisError> {
        let mut table = lock(&self.table);
        let record = table
            .active
            .get_mut(&tx_id)
            .ok_or_else(|| TrellisError::NotFound(format!("transaction {tx_id}")))?;
        let mut updated = record.clone();
        updated.transition(next)?;
        lock(&self.wal).append(&WalEntry::Transition { tx_id, state: next })?;
        *record = updated.clone();
        if next.is_terminal() {
            table.active.remove(&tx_id);
            table.finished.insert(tx_id, next);
        }
        tracing::debug!(%tx_id, state = %next, "transaction state logged");
        Ok(updated)
    }

    fn mark_committed(&self, tx_id: TxId, store: StoreKind) -> Result<(), TrellisError> {
        let mut table = lock(&self.table);
        lock(&self.wal).append(&WalEntry::ParticipantCommitted { tx_id, store })?;
        if let Some(record) = table.active.get_mut(&tx_id) {
            record.committed.insert(store);
        }
        Ok(())
    }

    fn active_record(&self, tx_id: TxId) -> Result<TransactionRecord, TrellisError> {
        lock(&self.table)
            .active
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| TrellisError::NotFound(format!("transaction {tx_id}")))
    }

    /// Log `BEGIN` and lease a connection from every store the operations
    /// touch. Blocks up to the pool acquire timeout per store.
    pub fn begin(&self, operations: Vec<Operation>) -> Result<Transaction<'_>, TrellisError> {
        if operations.is_empty() {
            return Err(TrellisError::InvalidInput(
                "transaction has no operations".to_string(),
            ));
        }
        let record = TransactionRecord::new(TxId::new_v4(), operations);
        let tx_id = record.tx_id;
        for store in &record.participants {
            self.participant(*store)?;
        }
        {
            let mut table = lock(&self.table);
            lock(&self.wal).append(&WalEntry::Begin(record.clone()))?;
            table.active.insert(tx_id, record.clone());
            table.in_flight.insert(tx_id);
        }

        let mut tx = Transaction {
            manager: self,
            tx_id,
            record,
            enlisted: Vec::new(),
            done: false,
        };
        for participant in &self.participants {
            if !tx.record.participants.contains(&participant.store()) {
                continue;
            }
            match participant.enlist(tx_id) {
                Ok(enlisted) => tx.enlisted.push(enlisted),
                Err(e) => {
                    tracing::warn!(%tx_id, store = %participant.store(), error = %e, "enlist failed");
                    tx.abort_inner(&e.to_string())?;
                    return Err(e);
                }
            }
        }
        tracing::debug!(%tx_id, operations = tx.record.operations.len(), "transaction begun");
        Ok(tx)
    }

    /// Begin, prepare and commit in one call.
    pub fn execute(&self, operations: Vec<Operation>) -> Result<CommitReceipt, TrellisError> {
        let mut tx = self.begin(operations)?;
        let tx_id = tx.tx_id();
        tx.prepare()?;
        let outcome = tx.commit()?;
        Ok(CommitReceipt { tx_id, outcome })
    }

    /// Replay each store, sleeping through the backoff schedule between
    /// attempts. Returns the stores that still did not commit.
    fn retry_stores(&self, record: &TransactionRecord, stores: &[StoreKind]) -> Vec<StoreKind> {
        let tx_id = record.tx_id;
        let mut pending = Vec::new();
        'stores: for &store in stores {
            let Ok(participant) = self.participant(store) else {
                pending.push(store);
                continue;
            };
            for (attempt, delay) in self.settings.commit_backoff.iter().enumerate() {
                std::thread::sleep(*delay);
                match participant.replay(record) {
                    Ok(()) => {
                        if let Err(e) = self.mark_committed(tx_id, store) {
                            tracing::warn!(%tx_id, %store, error = %e, "could not log commit marker");
                        }
                        continue 'stores;
                    }
                    Err(e) => tracing::warn!(
                        %tx_id,
                        %store,
                        attempt = attempt + 1,
                        error = %e,
                        "commit retry failed"
                    ),
                }
            }
            pending.push(store);
        }
        pending
    }

    /// Finish a COMMITTING transaction by replaying its pending stores.
    ///
    /// Already committed transactions are a no-op.
    pub fn replay_commit(&self, tx_id: TxId) -> Result<(), TrellisError> {
        let _replay = lock(&self.replay_lock);
        let record = {
            let table = lock(&self.table);
            if table.in_flight.contains(&tx_id) {
                return Err(TrellisError::InvalidInput(format!(
                    "transaction {tx_id} is still being driven by its coordinator"
                )));
            }
            match (table.active.get(&tx_id), table.finished.get(&tx_id)) {
                (Some(record), _) => Some(record.clone()),
                (None, Some(TxState::Committed)) => return Ok(()),
                (None, Some(state)) => {
                    return Err(TrellisError::InvalidTransition {
                        tx_id,
                        from: *state,
                        to: TxState::Committed,
                    });
                }
                (None, None) => None,
            }
        };
        let Some(record) = record else {
            return self.committed_before_checkpoint(tx_id);
        };
        if record.state != TxState::Committing {
            return Err(TrellisError::InvalidTransition {
                tx_id,
                from: record.state,
                to: TxState::Committed,
            });
        }
        for store in record.pending() {
            self.participant(store)?.replay(&record).map_err(|e| {
                tracing::warn!(%tx_id, %store, error = %e, "replay failed");
                TrellisError::PartialCommitPending {
                    tx_id,
                    pending: store,
                }
            })?;
            self.mark_committed(tx_id, store)?;
        }
        self.transition(tx_id, TxState::Committed)?;
        tracing::info!(%tx_id, "pending commit finished");
        Ok(())
    }

    /// A checkpoint forgets finished transactions; the stores still know
    /// which ones they applied.
    fn committed_before_checkpoint(&self, tx_id: TxId) -> Result<(), TrellisError> {
        for participant in &self.participants {
            if participant.has_committed(tx_id)? {
                tracing::debug!(%tx_id, store = %participant.store(), "committed before the last checkpoint");
                return Ok(());
            }
        }
        Err(TrellisError::NotFound(format!("transaction {tx_id}")))
    }

    /// Finish every pending commit that writes one of `ids`.
    ///
    /// Writes carry whole post-merge records, so a pending commit must land
    /// before anything reads those records to merge into them. Fails with
    /// [`TrellisError::PartialCommitPending`] when one still cannot land.
    pub fn settle(&self, ids: &BTreeSet<InternalId>) -> Result<(), TrellisError> {
        let pending: Vec<(TxId, StoreKind)> = {
            let table = lock(&self.table);
            table
                .active
                .values()
                .filter(|r| r.state == TxState::Committing && !table.in_flight.contains(&r.tx_id))
                .filter(|r| r.operations.iter().any(|op| ids.contains(&op.internal_id())))
                .filter_map(|r| r.pending().first().map(|store| (r.tx_id, *store)))
                .collect()
        };
        for (tx_id, store) in pending {
            tracing::info!(%tx_id, "finishing pending commit before a newer write");
            self.replay_commit(tx_id).map_err(|e| match e {
                TrellisError::PartialCommitPending { .. } => e,
                other => {
                    tracing::warn!(%tx_id, error = %other, "could not finish pending commit");
                    TrellisError::PartialCommitPending {
                        tx_id,
                        pending: store,
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Retry every transaction stuck in COMMITTING.
    pub fn retry_pending(&self) -> RetryReport {
        let candidates: Vec<TxId> = {
            let table = lock(&self.table);
            table
                .active
                .values()
                .filter(|r| r.state == TxState::Committing && !table.in_flight.contains(&r.tx_id))
                .map(|r| r.tx_id)
                .collect()
        };
        let mut report = RetryReport::default();
        for tx_id in candidates {
            match self.replay_commit(tx_id) {
                Ok(()) => report.committed.push(tx_id),
                Err(e) => {
                    tracing::error!(%tx_id, error = %e, alert = "partial_commit_pending", "commit still pending");
                    report.still_pending.push(tx_id);
                }
            }
        }
        report
    }

    /// Resolve every unfinished transaction found in the log.
    ///
    /// Anything before COMMITTING is aborted: staged writes die with the
    /// process that staged them. COMMITTING is replayed to completion.
    pub fn recover(&self) -> RecoveryReport {
        let unfinished: Vec<TransactionRecord> = {
            let table = lock(&self.table);
            table
                .active
                .values()
                .filter(|r| !table.in_flight.contains(&r.tx_id))
                .cloned()
                .collect()
        };
        let mut report = RecoveryReport::default();
        for record in unfinished {
            let tx_id = record.tx_id;
            match record.state {
                TxState::Preparing | TxState::Prepared | TxState::Aborting => {
                    let aborted = if record.state == TxState::Aborting {
                        self.transition(tx_id, TxState::Aborted)
                    } else {
                        self.transition(tx_id, TxState::Aborting)
                            .and_then(|_| self.transition(tx_id, TxState::Aborted))
                    };
                    match aborted {
                        Ok(_) => {
                            tracing::info!(%tx_id, from = %record.state, "presumed abort");
                            report.aborted.push(tx_id);
                        }
                        Err(e) => {
                            tracing::error!(%tx_id, error = %e, "could not log abort");
                            report.still_pending.push(tx_id);
                        }
                    }
                }
                TxState::Committing => match self.replay_commit(tx_id) {
                    Ok(()) => report.replayed.push(tx_id),
                    Err(e) => {
                        tracing::error!(%tx_id, error = %e, alert = "partial_commit_pending", "recovery replay failed");
                        report.still_pending.push(tx_id);
                    }
                },
                TxState::Committed | TxState::Aborted => {}
            }
        }
        if !report.aborted.is_empty() || !report.replayed.is_empty() {
            tracing::info!(
                aborted = report.aborted.len(),
                replayed = report.replayed.len(),
                still_pending = report.still_pending.len(),
                "transaction recovery complete"
            );
        }
        report
    }

    /// Rewrite the log with only unfinished transactions.
    pub fn checkpoint(&self) -> Result<usize, TrellisError> {
        let mut table = lock(&self.table);
        let entries: Vec<WalEntry> = table
            .active
            .values()
            .cloned()
            .map(WalEntry::Begin)
            .collect();
        lock(&self.wal).rewrite(&entries)?;
        let dropped = table.finished.len();
        table.finished.clear();
        tracing::info!(kept = entries.len(), dropped, "transaction log checkpointed");
        Ok(entries.len())
    }

    #[must_use]
    pub fn state(&self, tx_id: TxId) -> Option<TxState> {
        let table = lock(&self.table);
        table
            .active
            .get(&tx_id)
            .map(|r| r.state)
            .or_else(|| table.finished.get(&tx_id).copied())
    }

    #[must_use]
    pub fn status(&self) -> TxStatus {
        let table = lock(&self.table);
        let wal_bytes = lock(&self.wal).len_bytes();
        TxStatus {
            in_flight: table.in_flight.len(),
            pending_commit: table
                .active
                .values()
                .filter(|r| r.state == TxState::Committing && !table.in_flight.contains(&r.tx_id))
                .map(|r| r.tx_id)
                .collect(),
            finished: table.finished.len(),
            wal_bytes,
        }
    }
}

// =============================================================================
// TRANSACTION HANDLE
// =============================================================================

/// A live transaction holding one lease per participant.
///
/// Dropping it before commit aborts it.
pub struct Transaction<'m> {
    manager: &'m TransactionManager,
    tx_id: TxId,
    record: TransactionRecord,
    enlisted: Vec<Box<dyn Enlisted>>,
    done: bool,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tx_id", &self.tx_id)
            .field("state", &self.record.state)
            .finish()
    }
}

impl Transaction<'_> {
    #[must_use]
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.record.state
    }

    #[must_use]
    pub fn record(&self) -> &TransactionRecord {
        &self.record
    }

    /// Stage the writes on every participant.
    ///
    /// Each participant waits for its store's write lock only as long as
    /// the prepare timeout has left. Any failure, or overrunning the
    /// timeout, rolls back every participant and logs ABORTED before
    /// returning.
    pub fn prepare(&mut self) -> Result<(), TrellisError> {
        let tx_id = self.tx_id;
        if self.record.state != TxState::Preparing {
            return Err(TrellisError::InvalidTransition {
                tx_id,
                from: self.record.state,
                to: TxState::Prepared,
            });
        }
        let timeout = self.manager.settings.prepare_timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = || TrellisError::Aborted {
            tx_id,
            reason: format!("prepare exceeded {} ms", timeout.as_millis()),
        };
        let mut failure = None;
        for enlisted in &mut self.enlisted {
            let store = enlisted.store();
            let budget = deadline.saturating_duration_since(Instant::now());
            if budget.is_zero() {
                failure = Some(timed_out());
                break;
            }
            if let Err(e) = enlisted.prepare(&self.record, budget) {
                failure = Some(if Instant::now() >= deadline {
                    tracing::debug!(%tx_id, %store, error = %e, "prepare ran out of time");
                    timed_out()
                } else {
                    TrellisError::PrepareFailed {
                        tx_id,
                        participant: store,
                        reason: e.to_string(),
                    }
                });
                break;
            }
        }
        if failure.is_none() && Instant::now() > deadline {
            failure = Some(timed_out());
        }

        if let Some(err) = failure {
            tracing::warn!(%tx_id, error = %err, "prepare failed, aborting");
            self.abort_inner(&err.to_string())?;
            return Err(err);
        }
        self.record = self.manager.transition(tx_id, TxState::Prepared)?;
        Ok(())
    }

    /// Commit every participant.
    ///
    /// Once COMMITTING is logged the transaction will commit. A participant
    /// that fails is retried on the backoff schedule; if it still fails the
    /// result is [`CommitOutcome::CommittedWithRetryPending`] and the
    /// remainder is left to [`TransactionManager::retry_pending`].
    pub fn commit(mut self) -> Result<CommitOutcome, TrellisError> {
        let manager = self.manager;
        let tx_id = self.tx_id;
        if self.record.state != TxState::Prepared {
            return Err(TrellisError::InvalidTransition {
                tx_id,
                from: self.record.state,
                to: TxState::Committing,
            });
        }
        self.record = manager.transition(tx_id, TxState::Committing)?;

        let mut failed = Vec::new();
        for enlisted in &mut self.enlisted {
            let store = enlisted.store();
            match enlisted.commit() {
                Ok(()) => {
                    if let Err(e) = manager.mark_committed(tx_id, store) {
                        // replay finds the writes applied and logs the marker
                        tracing::warn!(%tx_id, %store, error = %e, "could not log commit marker");
                        failed.push(store);
                    }
                }
                Err(e) => {
                    tracing::warn!(%tx_id, %store, error = %e, "participant commit failed");
                    failed.push(store);
                }
            }
        }
        self.release_leases();

        let pending = if failed.is_empty() {
            failed
        } else {
            let record = manager.active_record(tx_id)?;
            manager.retry_stores(&record, &failed)
        };

        let pending = if pending.is_empty() {
            match manager.transition(tx_id, TxState::Committed) {
                Ok(record) => {
                    self.record = record;
                    pending
                }
                Err(e) => {
                    tracing::warn!(%tx_id, error = %e, "could not log COMMITTED");
                    manager
                        .active_record(tx_id)
                        .map(|r| r.pending())
                        .unwrap_or_else(|_| self.record.participants.iter().copied().collect())
                }
            }
        } else {
            pending
        };

        let outcome = if self.record.state == TxState::Committed {
            tracing::info!(%tx_id, "transaction committed");
            CommitOutcome::Committed
        } else {
            tracing::error!(
                %tx_id,
                pending = ?pending,
                alert = "partial_commit_pending",
                "partial commit, retry pending"
            );
            CommitOutcome::CommittedWithRetryPending { pending }
        };
        self.finish();
        Ok(outcome)
    }

    /// Roll back every participant and log ABORTED.
    pub fn abort(mut self, reason: &str) -> Result<(), TrellisError> {
        self.abort_inner(reason)
    }

    fn abort_inner(&mut self, reason: &str) -> Result<(), TrellisError> {
        let tx_id = self.tx_id;
        if self.record.state != TxState::Aborting {
            self.record = self.manager.transition(tx_id, TxState::Aborting)?;
        }
        for enlisted in &mut self.enlisted {
            if let Err(e) = enlisted.rollback() {
                tracing::warn!(%tx_id, store = %enlisted.store(), error = %e, "rollback failed");
            }
        }
        self.record = self.manager.transition(tx_id, TxState::Aborted)?;
        tracing::info!(%tx_id, reason, "transaction aborted");
        self.finish();
        Ok(())
    }

    fn release_leases(&mut self) {
        for enlisted in self.enlisted.drain(..) {
            let store = enlisted.store();
            if let Err(e) = enlisted.release() {
                tracing::warn!(tx_id = %self.tx_id, %store, error = %e, "lease release failed");
            }
        }
    }

    fn finish(&mut self) {
        self.release_leases();
        lock(&self.manager.table).in_flight.remove(&self.tx_id);
        self.done = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if matches!(
            self.record.state,
            TxState::Preparing | TxState::Prepared | TxState::Aborting
        ) {
            if let Err(e) = self.abort_inner("transaction dropped before commit") {
                tracing::error!(tx_id = %self.tx_id, error = %e, "abort on drop failed");
            }
        }
        if !self.done {
            self.finish();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
