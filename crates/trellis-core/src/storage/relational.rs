//! # SQLite Relational Store
//!
//! Holds everything about the graph that is not the graph: id mappings,
//! the uncertainty audit log, per-record provenance and the committed
//! transaction ledger.
//!
//! Every write is an upsert keyed by `tx_id`, `internal_id` or `record_id`,
//! so replaying a transaction never duplicates rows.

use super::native_id;
use crate::pool::ConnectionFactory;
use crate::transform::RowKind;
use crate::transform::table::encode_components;
use crate::uncertainty::UncertaintyRecord;
use crate::{InternalId, StoreKind, TrellisError, TxId, TypeLabel};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    tx_id       TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS id_mapping (
    internal_id     TEXT NOT NULL,
    store           TEXT NOT NULL,
    native_id       TEXT NOT NULL,
    canonical_name  TEXT NOT NULL,
    entity_type     TEXT NOT NULL,
    tx_id           TEXT NOT NULL,
    PRIMARY KEY (internal_id, store),
    UNIQUE (store, native_id)
);
CREATE TABLE IF NOT EXISTS uncertainty_log (
    record_id      TEXT PRIMARY KEY,
    internal_id    TEXT NOT NULL,
    value          REAL NOT NULL,
    method         TEXT NOT NULL,
    components     TEXT NOT NULL,
    justification  TEXT NOT NULL,
    tx_id          TEXT NOT NULL,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_uncertainty_log_internal_id
    ON uncertainty_log (internal_id);
CREATE TABLE IF NOT EXISTS provenance (
    internal_id  TEXT PRIMARY KEY,
    row_kind     TEXT NOT NULL,
    tx_id        TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
";

// =============================================================================
// WRITES
// =============================================================================

/// A persisted internal-id ⇄ native-id pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub internal_id: InternalId,
    pub store: StoreKind,
    pub native_id: String,
    pub canonical_name: String,
    pub entity_type: TypeLabel,
}

impl IdMapping {
    /// The mapping of `(entity_type, canonical_name)` in `store`.
    #[must_use]
    pub fn for_entity(store: StoreKind, entity_type: &TypeLabel, canonical_name: &str) -> Self {
        Self {
            internal_id: InternalId::for_entity(entity_type, canonical_name),
            store,
            native_id: native_id(store, entity_type, canonical_name),
            canonical_name: canonical_name.to_string(),
            entity_type: entity_type.clone(),
        }
    }
}

/// One upsert against the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelationalWrite {
    MapId(IdMapping),
    LogUncertainty {
        internal_id: InternalId,
        record: UncertaintyRecord,
    },
    Provenance {
        internal_id: InternalId,
        row_kind: RowKind,
    },
}

/// Row counts, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelationalCounts {
    pub transactions: u64,
    pub id_mappings: u64,
    pub uncertainty_records: u64,
    pub provenance_rows: u64,
}

/// One row of the uncertainty audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UncertaintyLogEntry {
    pub record_id: String,
    pub tx_id: String,
    pub value: f64,
    pub method: String,
    pub justification: String,
}

// =============================================================================
// STORE
// =============================================================================

/// Open a connection in WAL mode. The store still works without it, only
/// slower under concurrent readers, so pragma failures are logged.
fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, TrellisError> {
    let conn = Connection::open(path)?;
    match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
        Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
        Ok(mode) => tracing::warn!(path = %path.display(), %mode, "sqlite refused WAL journal mode"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not set sqlite journal mode"),
    }
    if let Err(e) = conn.pragma_update(None, "synchronous", "NORMAL") {
        tracing::warn!(path = %path.display(), error = %e, "could not set sqlite synchronous mode");
    }
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Location of the SQLite file, with its schema in place.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl RelationalStore {
    /// Open or create the database and apply the schema.
    ///
    /// `busy_timeout` bounds how long a connection waits on SQLite's write
    /// lock; the engine passes the transaction prepare timeout.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, TrellisError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { path, busy_timeout })
    }

    #[must_use]
    pub fn connector(&self) -> RelationalConnector {
        RelationalConnector {
            path: self.path.clone(),
            busy_timeout: self.busy_timeout,
        }
    }
}

/// Pool factory for SQLite connections.
pub struct RelationalConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

impl ConnectionFactory for RelationalConnector {
    type Connection = RelationalConnection;

    fn store(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn connect(&self) -> Result<RelationalConnection, TrellisError> {
        Ok(RelationalConnection {
            conn: open_connection(&self.path, self.busy_timeout)?,
            busy_timeout: self.busy_timeout,
        })
    }

    /// A connection left inside an open transaction is unhealthy too.
    fn is_healthy(&self, conn: &mut RelationalConnection) -> bool {
        conn.conn.is_autocommit()
            && conn
                .conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok()
    }
}

/// A pooled SQLite connection.
pub struct RelationalConnection {
    conn: Connection,
    busy_timeout: Duration,
}

impl RelationalConnection {
    /// `BEGIN IMMEDIATE`, apply every write and the ledger row, no `COMMIT`.
    ///
    /// On failure the open transaction is rolled back before returning.
    pub fn stage(&self, tx_id: TxId, writes: &[RelationalWrite]) -> Result<(), TrellisError> {
        self.stage_within(tx_id, writes, None)
    }

    /// [`stage`](Self::stage), waiting at most `budget` for the write lock
    /// when it is shorter than the connection's busy timeout.
    pub fn stage_within(
        &self,
        tx_id: TxId,
        writes: &[RelationalWrite],
        budget: Option<Duration>,
    ) -> Result<(), TrellisError> {
        let wait = budget.map_or(self.busy_timeout, |b| b.min(self.busy_timeout));
        if wait != self.busy_timeout {
            self.conn.busy_timeout(wait)?;
        }
        let begun = self.conn.execute_batch("BEGIN IMMEDIATE");
        if wait != self.busy_timeout {
            if let Err(e) = self.conn.busy_timeout(self.busy_timeout) {
                tracing::warn!(%tx_id, error = %e, "could not restore sqlite busy timeout");
            }
        }
        begun?;
        match self.apply_writes(tx_id, writes) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(%tx_id, error = %rollback, "rollback after failed staging failed");
                }
                Err(e)
            }
        }
    }

    fn apply_writes(&self, tx_id: TxId, writes: &[RelationalWrite]) -> Result<(), TrellisError> {
        let tx = tx_id.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        for write in writes {
            match write {
                RelationalWrite::MapId(mapping) => {
                    let owner: Option<String> = self
                        .conn
                        .query_row(
                            "SELECT internal_id FROM id_mapping WHERE store = ?1 AND native_id = ?2",
                            params![mapping.store.as_str(), mapping.native_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(owner) = owner {
                        let existing = InternalId::parse(&owner)?;
                        if existing != mapping.internal_id {
                            return Err(TrellisError::IdentityCollision {
                                store: mapping.store,
                                native_id: mapping.native_id.clone(),
                                existing,
                                requested: mapping.canonical_name.clone(),
                            });
                        }
                    }
                    self.conn
                        .prepare_cached(
                            "INSERT INTO id_mapping
                                (internal_id, store, native_id, canonical_name, entity_type, tx_id)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                             ON CONFLICT (internal_id, store) DO UPDATE SET
                                native_id = excluded.native_id,
                                canonical_name = excluded.canonical_name,
                                entity_type = excluded.entity_type",
                        )?
                        .execute(params![
                            mapping.internal_id.to_string(),
                            mapping.store.as_str(),
                            mapping.native_id,
                            mapping.canonical_name,
                            mapping.entity_type.as_str(),
                            tx,
                        ])?;
                }
                RelationalWrite::LogUncertainty {
                    internal_id,
                    record,
                } => {
                    self.conn
                        .prepare_cached(
                            "INSERT INTO uncertainty_log
                                (record_id, internal_id, value, method, components,
                                 justification, tx_id, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                             ON CONFLICT (record_id) DO NOTHING",
                        )?
                        .execute(params![
                            format!("{tx}/{internal_id}"),
                            internal_id.to_string(),
                            record.value(),
                            record.method().as_str(),
                            encode_components(record.components()),
                            record.justification(),
                            tx,
                            now,
                        ])?;
                }
                RelationalWrite::Provenance {
                    internal_id,
                    row_kind,
                } => {
                    self.conn
                        .prepare_cached(
                            "INSERT INTO provenance (internal_id, row_kind, tx_id, created_at)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT (internal_id) DO UPDATE SET
                                row_kind = excluded.row_kind,
                                tx_id = excluded.tx_id",
                        )?
                        .execute(params![internal_id.to_string(), row_kind.as_str(), tx, now])?;
                }
            }
        }
        self.conn
            .prepare_cached(
                "INSERT INTO transactions (tx_id, state, created_at) VALUES (?1, 'COMMITTED', ?2)
                 ON CONFLICT (tx_id) DO UPDATE SET state = excluded.state",
            )?
            .execute(params![tx, now])?;
        Ok(())
    }

    pub fn commit_staged(&self) -> Result<(), TrellisError> {
        if self.conn.is_autocommit() {
            return Err(TrellisError::relational("commit without a staged transaction"));
        }
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back a staged transaction. A no-op when nothing is staged.
    pub fn rollback_staged(&self) -> Result<(), TrellisError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn has_committed(&self, tx_id: TxId) -> Result<bool, TrellisError> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM transactions WHERE tx_id = ?1",
                params![tx_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.as_deref() == Some("COMMITTED"))
    }

    /// Every persisted mapping, ordered by internal id.
    pub fn load_mappings(&self) -> Result<Vec<IdMapping>, TrellisError> {
        let mut stmt = self.conn.prepare(
            "SELECT internal_id, store, native_id, canonical_name, entity_type
             FROM id_mapping ORDER BY internal_id, store",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut mappings = Vec::new();
        for row in rows {
            let (internal_id, store, native_id, canonical_name, entity_type) = row?;
            mappings.push(IdMapping {
                internal_id: InternalId::parse(&internal_id)?,
                store: StoreKind::parse(&store)?,
                native_id,
                canonical_name,
                entity_type: TypeLabel::parse(entity_type)?,
            });
        }
        Ok(mappings)
    }

    /// Audit trail of one record's uncertainty, oldest first.
    pub fn uncertainty_history(
        &self,
        internal_id: InternalId,
    ) -> Result<Vec<UncertaintyLogEntry>, TrellisError> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, tx_id, value, method, justification
             FROM uncertainty_log WHERE internal_id = ?1 ORDER BY created_at, record_id",
        )?;
        let rows = stmt.query_map(params![internal_id.to_string()], |row| {
            Ok(UncertaintyLogEntry {
                record_id: row.get(0)?,
                tx_id: row.get(1)?,
                value: row.get(2)?,
                method: row.get(3)?,
                justification: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(TrellisError::from)
    }

    pub fn counts(&self) -> Result<RelationalCounts, TrellisError> {
        let count = |table: &str| -> Result<u64, TrellisError> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(RelationalCounts {
            transactions: count("transactions")?,
            id_mappings: count("id_mapping")?,
            uncertainty_records: count("uncertainty_log")?,
            provenance_rows: count("provenance")?,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, RelationalConnection) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RelationalStore::open(dir.path().join("meta.sqlite"), BUSY)
            .expect("open");
        let conn = store.connector().connect().expect("connect");
        (dir, conn)
    }

    const BUSY: Duration = Duration::from_secs(5);

    fn writes() -> Vec<RelationalWrite> {
        let org = TypeLabel::parse("ORG").expect("label");
        let mapping = IdMapping::for_entity(StoreKind::Relational, &org, "Acme Corp");
        let internal_id = mapping.internal_id;
        vec![
            RelationalWrite::MapId(mapping),
            RelationalWrite::LogUncertainty {
                internal_id,
                record: UncertaintyRecord::leaf(0.1, "ner").expect("record"),
            },
            RelationalWrite::Provenance {
                internal_id,
                row_kind: RowKind::Entity,
            },
        ]
    }

    #[test]
    fn staged_rows_appear_only_after_commit() {
        let (dir, conn) = open();
        let tx_id = TxId::new_v4();
        conn.stage(tx_id, &writes()).expect("stage");

        let observer = RelationalStore::open(dir.path().join("meta.sqlite"), BUSY)
            .expect("open")
            .connector()
            .connect()
            .expect("observer");
        assert_eq!(observer.counts().expect("counts").id_mappings, 0);

        conn.commit_staged().expect("commit");
        let counts = observer.counts().expect("counts");
        assert_eq!(counts.id_mappings, 1);
        assert_eq!(counts.uncertainty_records, 1);
        assert_eq!(counts.provenance_rows, 1);
        assert!(observer.has_committed(tx_id).expect("ledger"));
    }

    #[test]
    fn connections_run_in_wal_mode() {
        let (_dir, conn) = open();
        let mode: String = conn
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("pragma");
        assert_eq!(mode.to_ascii_lowercase(), "wal");
    }

    #[test]
    fn staging_waits_no_longer_than_its_budget() {
        let (dir, conn) = open();
        conn.stage(TxId::new_v4(), &writes()).expect("stage");

        let other = RelationalStore::open(dir.path().join("meta.sqlite"), BUSY)
            .expect("open")
            .connector()
            .connect()
            .expect("second connection");
        let started = std::time::Instant::now();
        other
            .stage_within(TxId::new_v4(), &writes(), Some(Duration::from_millis(50)))
            .expect_err("write lock held");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(other.conn.is_autocommit());

        conn.commit_staged().expect("commit");
        other.stage(TxId::new_v4(), &writes()).expect("lock free again");
        other.commit_staged().expect("commit");
        assert_eq!(other.counts().expect("counts").transactions, 2);
    }

    #[test]
    fn rollback_leaves_nothing() {
        let (_dir, conn) = open();
        let tx_id = TxId::new_v4();
        conn.stage(tx_id, &writes()).expect("stage");
        conn.rollback_staged().expect("rollback");
        assert_eq!(conn.counts().expect("counts").transactions, 0);
        assert!(!conn.has_committed(tx_id).expect("ledger"));
        // nothing staged any more
        assert!(conn.commit_staged().is_err());
    }

    #[test]
    fn replaying_a_transaction_does_not_duplicate_rows() {
        let (_dir, conn) = open();
        let tx_id = TxId::new_v4();
        for _ in 0..3 {
            conn.stage(tx_id, &writes()).expect("stage");
            conn.commit_staged().expect("commit");
        }
        let counts = conn.counts().expect("counts");
        assert_eq!(counts.transactions, 1);
        assert_eq!(counts.uncertainty_records, 1);
        assert_eq!(counts.id_mappings, 1);
    }

    #[test]
    fn native_id_owned_by_another_entity_is_a_collision() {
        let (_dir, conn) = open();
        conn.stage(TxId::new_v4(), &writes()).expect("stage");
        conn.commit_staged().expect("commit");

        let org = TypeLabel::parse("ORG").expect("label");
        let mut clash = IdMapping::for_entity(StoreKind::Relational, &org, "Acme Inc");
        clash.native_id = native_id(StoreKind::Relational, &org, "Acme Corp");
        let err = conn
            .stage(TxId::new_v4(), &[RelationalWrite::MapId(clash)])
            .expect_err("collision");
        assert!(matches!(err, TrellisError::IdentityCollision { .. }));
        assert!(conn.conn.is_autocommit());
    }

    #[test]
    fn mappings_reload() {
        let (_dir, conn) = open();
        conn.stage(TxId::new_v4(), &writes()).expect("stage");
        conn.commit_staged().expect("commit");
        let mappings = conn.load_mappings().expect("mappings");
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].canonical_name, "Acme Corp");
        let history = conn
            .uncertainty_history(mappings[0].internal_id)
            .expect("history");
        assert_eq!(history.len(), 1);
        assert!((history[0].value - 0.1).abs() < 1e-12);
    }
}
