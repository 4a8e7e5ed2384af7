//! # 2PC Participants
//!
//! A [`Participant`] is one store as seen by the coordinator. Enlisting it
//! in a transaction leases a pooled connection owned by that transaction;
//! the returned [`Enlisted`] handle stages, commits or rolls back on that
//! connection and gives it back on release.

use super::TransactionRecord;
use crate::pool::ConnectionLease;
use crate::storage::{
    GraphConnector, GraphPool, RelationalConnector, RelationalPool, StagedGraphWrite,
};
use crate::{StoreKind, TrellisError, TxId};
use std::sync::Arc;
use std::time::Duration;

pub trait Participant: Send + Sync {
    fn store(&self) -> StoreKind;

    /// Lease a connection for `tx_id`.
    fn enlist(&self, tx_id: TxId) -> Result<Box<dyn Enlisted>, TrellisError>;

    /// Apply and commit this store's writes of `record` unless they already
    /// landed. Safe to call any number of times.
    fn replay(&self, record: &TransactionRecord) -> Result<(), TrellisError>;

    /// Whether `tx_id`'s writes are committed in this store.
    fn has_committed(&self, tx_id: TxId) -> Result<bool, TrellisError>;
}

/// A participant holding a leased connection for one transaction.
pub trait Enlisted {
    fn store(&self) -> StoreKind;

    /// Stage this store's writes without making them visible, waiting at
    /// most `budget` for the store's write lock.
    fn prepare(&mut self, record: &TransactionRecord, budget: Duration) -> Result<(), TrellisError>;

    fn commit(&mut self) -> Result<(), TrellisError>;

    /// Discard staged writes. A no-op when nothing is staged.
    fn rollback(&mut self) -> Result<(), TrellisError>;

    /// Roll back anything still staged and return the connection.
    fn release(self: Box<Self>) -> Result<(), TrellisError>;
}

// ===== GRAPH =====

pub struct GraphParticipant {
    pool: Arc<GraphPool>,
}

impl GraphParticipant {
    #[must_use]
    pub fn new(pool: Arc<GraphPool>) -> Self {
        Self { pool }
    }
}

impl Participant for GraphParticipant {
    fn store(&self) -> StoreKind {
        StoreKind::Graph
    }

    fn enlist(&self, tx_id: TxId) -> Result<Box<dyn Enlisted>, TrellisError> {
        Ok(Box::new(GraphEnlisted {
            tx_id,
            lease: self.pool.acquire(Some(tx_id))?,
            staged: None,
        }))
    }

    fn replay(&self, record: &TransactionRecord) -> Result<(), TrellisError> {
        let tx_id = record.tx_id;
        let mut lease = self.pool.acquire(Some(tx_id))?;
        let conn = lease.connection()?;
        if conn.has_applied(tx_id)? {
            tracing::debug!(%tx_id, "graph writes already applied");
        } else {
            conn.stage(tx_id, &record.graph_writes())?.commit()?;
            tracing::info!(%tx_id, "graph writes replayed");
        }
        lease.release(Some(tx_id))?;
        Ok(())
    }

    fn has_committed(&self, tx_id: TxId) -> Result<bool, TrellisError> {
        let mut lease = self.pool.acquire(None)?;
        let applied = lease.connection()?.has_applied(tx_id)?;
        lease.release(None)?;
        Ok(applied)
    }
}

struct GraphEnlisted {
    tx_id: TxId,
    lease: ConnectionLease<GraphConnector>,
    staged: Option<StagedGraphWrite>,
}

impl Enlisted for GraphEnlisted {
    fn store(&self) -> StoreKind {
        StoreKind::Graph
    }

    fn prepare(&mut self, record: &TransactionRecord, budget: Duration) -> Result<(), TrellisError> {
        let staged = self
            .lease
            .connection()?
            .stage_within(self.tx_id, &record.graph_writes(), Some(budget))?;
        self.staged = Some(staged);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TrellisError> {
        match self.staged.take() {
            Some(staged) => staged.commit(),
            None => Err(TrellisError::graph(format!(
                "transaction {} has nothing staged",
                self.tx_id
            ))),
        }
    }

    fn rollback(&mut self) -> Result<(), TrellisError> {
        match self.staged.take() {
            Some(staged) => staged.rollback(),
            None => Ok(()),
        }
    }

    fn release(mut self: Box<Self>) -> Result<(), TrellisError> {
        self.rollback()?;
        let Self { tx_id, lease, .. } = *self;
        lease.release(Some(tx_id))?;
        Ok(())
    }
}

// ===== RELATIONAL =====

pub struct RelationalParticipant {
    pool: Arc<RelationalPool>,
}

impl RelationalParticipant {
    #[must_use]
    pub fn new(pool: Arc<RelationalPool>) -> Self {
        Self { pool }
    }
}

impl Participant for RelationalParticipant {
    fn store(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn enlist(&self, tx_id: TxId) -> Result<Box<dyn Enlisted>, TrellisError> {
        Ok(Box::new(RelationalEnlisted {
            tx_id,
            lease: self.pool.acquire(Some(tx_id))?,
            prepared: false,
        }))
    }

    fn replay(&self, record: &TransactionRecord) -> Result<(), TrellisError> {
        let tx_id = record.tx_id;
        let mut lease = self.pool.acquire(Some(tx_id))?;
        let conn = lease.connection()?;
        if conn.has_committed(tx_id)? {
            tracing::debug!(%tx_id, "relational writes already committed");
        } else {
            conn.stage(tx_id, &record.relational_writes())?;
            if let Err(e) = conn.commit_staged() {
                conn.rollback_staged()?;
                return Err(e);
            }
            tracing::info!(%tx_id, "relational writes replayed");
        }
        lease.release(Some(tx_id))?;
        Ok(())
    }

    fn has_committed(&self, tx_id: TxId) -> Result<bool, TrellisError> {
        let mut lease = self.pool.acquire(None)?;
        let committed = lease.connection()?.has_committed(tx_id)?;
        lease.release(None)?;
        Ok(committed)
    }
}

struct RelationalEnlisted {
    tx_id: TxId,
    lease: ConnectionLease<RelationalConnector>,
    prepared: bool,
}

impl Enlisted for RelationalEnlisted {
    fn store(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn prepare(&mut self, record: &TransactionRecord, budget: Duration) -> Result<(), TrellisError> {
        self.lease
            .connection()?
            .stage_within(self.tx_id, &record.relational_writes(), Some(budget))?;
        self.prepared = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TrellisError> {
        if !self.prepared {
            return Err(TrellisError::relational(format!(
                "transaction {} has nothing staged",
                self.tx_id
            )));
        }
        self.prepared = false;
        let conn = self.lease.connection()?;
        let result = conn.commit_staged();
        if result.is_err() {
            // leave the connection outside any transaction for the next lease
            conn.rollback_staged()?;
        }
        result
    }

    fn rollback(&mut self) -> Result<(), TrellisError> {
        if self.prepared {
            self.prepared = false;
            self.lease.connection()?.rollback_staged()?;
            tracing::debug!(tx_id = %self.tx_id, "relational writes rolled back");
        }
        Ok(())
    }

    fn release(mut self: Box<Self>) -> Result<(), TrellisError> {
        self.rollback()?;
        let Self { tx_id, lease, .. } = *self;
        lease.release(Some(tx_id))?;
        Ok(())
    }
}
