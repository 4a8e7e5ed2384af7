//! # Transaction Write-Ahead Log
//!
//! Append-only file of [`WalEntry`] frames:
//!
//! ```text
//! "TXWL" | version u8 | (len u32 LE | postcard payload)*
//! ```
//!
//! Every frame is followed by `sync_data`, so a state is durable before the
//! coordinator acts on it. A frame cut short by a crash is truncated on
//! open; a complete frame that does not decode is corruption and fails the
//! open.

use super::{TransactionRecord, TxState};
use crate::primitives::{MAX_WAL_FRAME_SIZE, WAL_MAGIC, WAL_VERSION};
use crate::{StoreKind, TrellisError, TxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = WAL_MAGIC.len() + 1;
const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    /// Full redo record, written before any participant is touched.
    Begin(TransactionRecord),
    Transition { tx_id: TxId, state: TxState },
    ParticipantCommitted { tx_id: TxId, store: StoreKind },
}

impl WalEntry {
    #[must_use]
    pub fn tx_id(&self) -> TxId {
        match self {
            Self::Begin(record) => record.tx_id,
            Self::Transition { tx_id, .. } | Self::ParticipantCommitted { tx_id, .. } => *tx_id,
        }
    }
}

pub struct Wal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

fn header() -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..WAL_MAGIC.len()].copy_from_slice(WAL_MAGIC);
    header[WAL_MAGIC.len()] = WAL_VERSION;
    header
}

fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>, TrellisError> {
    let payload = postcard::to_allocvec(entry)?;
    if payload.len() > MAX_WAL_FRAME_SIZE {
        return Err(TrellisError::Serialization(format!(
            "log frame of {} bytes exceeds limit of {MAX_WAL_FRAME_SIZE}",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| TrellisError::Serialization("log frame too large".to_string()))?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode frames after the header. Returns the entries and the offset where
/// the valid prefix ends.
fn decode_frames(bytes: &[u8]) -> Result<(Vec<WalEntry>, usize), TrellisError> {
    let mut entries = Vec::new();
    let mut offset = HEADER_LEN;
    while offset < bytes.len() {
        let Some(prefix) = bytes.get(offset..offset + LEN_PREFIX) else {
            break;
        };
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(prefix);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_WAL_FRAME_SIZE {
            return Err(TrellisError::Serialization(format!(
                "corrupt log frame at offset {offset}: length {len}"
            )));
        }
        let start = offset + LEN_PREFIX;
        let Some(payload) = bytes.get(start..start + len) else {
            break;
        };
        let entry: WalEntry = postcard::from_bytes(payload).map_err(|e| {
            TrellisError::Serialization(format!("corrupt log frame at offset {offset}: {e}"))
        })?;
        entries.push(entry);
        offset = start + len;
    }
    Ok((entries, offset))
}

impl Wal {
    /// Open or create the log and read back every complete entry.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<WalEntry>), TrellisError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.is_empty() {
            file.write_all(&header())?;
            file.sync_all()?;
            let wal = Self {
                path,
                file,
                len: HEADER_LEN as u64,
            };
            return Ok((wal, Vec::new()));
        }

        if bytes.len() < HEADER_LEN || bytes[..HEADER_LEN] != header() {
            return Err(TrellisError::Serialization(format!(
                "{} is not a version {WAL_VERSION} transaction log",
                path.display()
            )));
        }

        let (entries, valid) = decode_frames(&bytes)?;
        if valid < bytes.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - valid,
                "truncating torn transaction log tail"
            );
            file.set_len(valid as u64)?;
            file.sync_all()?;
        }
        tracing::debug!(path = %path.display(), entries = entries.len(), "transaction log opened");
        Ok((
            Self {
                path,
                file,
                len: valid as u64,
            },
            entries,
        ))
    }

    /// A handle on an existing log that refuses every append.
    #[cfg(test)]
    pub(crate) fn read_only(path: impl AsRef<Path>) -> Result<Self, TrellisError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self { path, file, len })
    }

    /// Append one entry and flush it to disk.
    pub fn append(&mut self, entry: &WalEntry) -> Result<(), TrellisError> {
        let frame = encode_frame(entry)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.len += frame.len() as u64;
        Ok(())
    }

    /// Atomically replace the log with `entries`.
    pub fn rewrite(&mut self, entries: &[WalEntry]) -> Result<(), TrellisError> {
        let tmp = self.path.with_extension("wal.tmp");
        let mut out = File::create(&tmp)?;
        let mut len = HEADER_LEN as u64;
        out.write_all(&header())?;
        for entry in entries {
            let frame = encode_frame(entry)?;
            out.write_all(&frame)?;
            len += frame.len() as u64;
        }
        out.sync_all()?;
        drop(out);
        std::fs::rename(&tmp, &self.path)?;

        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.len = len;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }
}

/// Fold log entries into the latest record of every transaction.
#[must_use]
pub fn fold(entries: Vec<WalEntry>) -> BTreeMap<TxId, TransactionRecord> {
    let mut records: BTreeMap<TxId, TransactionRecord> = BTreeMap::new();
    for entry in entries {
        match entry {
            WalEntry::Begin(record) => {
                records.insert(record.tx_id, record);
            }
            WalEntry::Transition { tx_id, state } => match records.get_mut(&tx_id) {
                Some(record) => record.state = state,
                None => tracing::warn!(%tx_id, "log transition for unknown transaction"),
            },
            WalEntry::ParticipantCommitted { tx_id, store } => match records.get_mut(&tx_id) {
                Some(record) => {
                    record.committed.insert(store);
                }
                None => tracing::warn!(%tx_id, "log commit marker for unknown transaction"),
            },
        }
    }
    records
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RelationalWrite;
    use crate::transform::RowKind;
    use crate::txn::Operation;
    use crate::{InternalId, TypeLabel};

    fn record() -> TransactionRecord {
        let label = TypeLabel::parse("ORG").expect("label");
        TransactionRecord::new(
            TxId::new_v4(),
            vec![Operation::Relational(RelationalWrite::Provenance {
                internal_id: InternalId::for_entity(&label, "Acme"),
                row_kind: RowKind::Entity,
            })],
        )
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tx.wal");
        let rec = record();
        {
            let (mut wal, entries) = Wal::open(&path).expect("open");
            assert!(entries.is_empty());
            wal.append(&WalEntry::Begin(rec.clone())).expect("append");
            wal.append(&WalEntry::Transition {
                tx_id: rec.tx_id,
                state: TxState::Prepared,
            })
            .expect("append");
        }
        let (_, entries) = Wal::open(&path).expect("reopen");
        assert_eq!(entries.len(), 2);
        let folded = fold(entries);
        assert_eq!(folded[&rec.tx_id].state, TxState::Prepared);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tx.wal");
        let rec = record();
        let clean_len = {
            let (mut wal, _) = Wal::open(&path).expect("open");
            wal.append(&WalEntry::Begin(rec.clone())).expect("append");
            wal.len_bytes()
        };
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("file");
            // length prefix promising 200 bytes, followed by only 3
            file.write_all(&200u32.to_le_bytes()).expect("write");
            file.write_all(&[1, 2, 3]).expect("write");
        }
        let (mut wal, entries) = Wal::open(&path).expect("reopen");
        assert_eq!(entries.len(), 1);
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), clean_len);

        wal.append(&WalEntry::Transition {
            tx_id: rec.tx_id,
            state: TxState::Aborting,
        })
        .expect("append after truncation");
        drop(wal);
        let (_, entries) = Wal::open(&path).expect("reopen");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tx.wal");
        std::fs::write(&path, b"not a log at all").expect("write");
        assert!(Wal::open(&path).is_err());
    }

    #[test]
    fn rewrite_keeps_only_given_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tx.wal");
        let (mut wal, _) = Wal::open(&path).expect("open");
        let kept = record();
        for _ in 0..5 {
            wal.append(&WalEntry::Begin(record())).expect("append");
        }
        let before = wal.len_bytes();
        wal.rewrite(&[WalEntry::Begin(kept.clone())]).expect("rewrite");
        assert!(wal.len_bytes() < before);
        wal.append(&WalEntry::Transition {
            tx_id: kept.tx_id,
            state: TxState::Aborting,
        })
        .expect("append");
        drop(wal);

        let (_, entries) = Wal::open(&path).expect("reopen");
        let folded = fold(entries);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[&kept.tx_id].state, TxState::Aborting);
    }
}
