//! Durable log storage for a config replica member
//!
//! Stores:
//! - Log entries (index -> term + mutation)
//! - Hard state (term, vote)
//! - Catalog checkpoint as of the last applied commit
//!
//! Every record is framed as `[CRC32 (4 bytes, BE)][bincode payload]`; a
//! checksum mismatch on load surfaces as [`Error::Corrupted`].

use crate::catalog::CatalogState;
use crate::common::raft::{HardState, LogEntry};
use crate::common::{Error, Result};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, Options, WriteBatch, WriteOptions, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const CF_LOG: &str = "log";
const CF_STATE: &str = "state";
const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_CHECKPOINT: &[u8] = b"checkpoint";

/// Catalog state as of `applied_index`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub applied_index: u64,
    pub catalog: CatalogState,
}

/// Everything a member needs to replay on restart
#[derive(Debug, Clone, Default)]
pub struct DurableState {
    pub hard_state: HardState,
    pub entries: Vec<LogEntry>,
    pub checkpoint: Option<Checkpoint>,
}

/// Trait for durable log backends
pub trait LogStorage: Send + Sync {
    fn load(&self) -> Result<DurableState>;
    fn append(&self, entries: &[LogEntry]) -> Result<()>;
    /// Remove every entry with `index >= from`
    fn truncate_from(&self, from: u64) -> Result<()>;
    fn save_hard_state(&self, hard_state: &HardState) -> Result<()>;
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    /// Drop the log and checkpoint (restart without preserving data). The
    /// hard state is replaced by `HardState::wiped()`, so the member cannot
    /// vote away entries it acknowledged before the wipe.
    fn clear(&self) -> Result<()>;
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_record<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    if bytes.len() < 4 {
        return Err(Error::Corrupted(format!("{}: truncated record", what)));
    }
    let (crc, payload) = bytes.split_at(4);
    let expected = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(Error::Corrupted(format!(
            "{}: checksum mismatch (expected {:08x}, got {:08x})",
            what, expected, actual
        )));
    }
    bincode::deserialize(payload)
        .map_err(|e| Error::Corrupted(format!("{}: {}", what, e)))
}

fn check_contiguous(entries: &[LogEntry]) -> Result<()> {
    for (pos, entry) in entries.iter().enumerate() {
        if entry.index != pos as u64 + 1 {
            return Err(Error::Corrupted(format!(
                "log gap: expected index {}, found {}",
                pos + 1,
                entry.index
            )));
        }
    }
    Ok(())
}

#[derive(Default)]
struct MemInner {
    hard_state: Option<Vec<u8>>,
    entries: BTreeMap<u64, Vec<u8>>,
    checkpoint: Option<Vec<u8>>,
}

/// In-memory storage; survives member restarts within one process
#[derive(Default)]
pub struct MemLogStorage {
    inner: Mutex<MemInner>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_checkpoint(&self) {
        if let Some(bytes) = self.inner.lock().checkpoint.as_mut() {
            if let Some(last) = bytes.last_mut() {
                *last ^= 0xff;
            }
        }
    }
}

impl LogStorage for MemLogStorage {
    fn load(&self) -> Result<DurableState> {
        let inner = self.inner.lock();
        let hard_state = match &inner.hard_state {
            Some(bytes) => decode_record("hard state", bytes)?,
            None => HardState::default(),
        };
        let entries = inner
            .entries
            .values()
            .map(|bytes| decode_record::<LogEntry>("log entry", bytes))
            .collect::<Result<Vec<_>>>()?;
        check_contiguous(&entries)?;
        let checkpoint = inner
            .checkpoint
            .as_deref()
            .map(|bytes| decode_record("checkpoint", bytes))
            .transpose()?;
        Ok(DurableState {
            hard_state,
            entries,
            checkpoint,
        })
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let encoded = entries
            .iter()
            .map(|e| Ok((e.index, encode_record(e)?)))
            .collect::<Result<Vec<_>>>()?;
        let mut inner = self.inner.lock();
        inner.entries.extend(encoded);
        Ok(())
    }

    fn truncate_from(&self, from: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let _ = inner.entries.split_off(&from);
        Ok(())
    }

    fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        let bytes = encode_record(hard_state)?;
        self.inner.lock().hard_state = Some(bytes);
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = encode_record(checkpoint)?;
        self.inner.lock().checkpoint = Some(bytes);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let hard_state = encode_record(&HardState::wiped())?;
        *self.inner.lock() = MemInner {
            hard_state: Some(hard_state),
            ..MemInner::default()
        };
        Ok(())
    }
}

/// RocksDB-backed storage
pub struct RocksLogStorage {
    db: DB,
}

impl RocksLogStorage {
    /// Open or create the member's log
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_LOG, CF_STATE])?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    fn sync_opts() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

impl LogStorage for RocksLogStorage {
    fn load(&self) -> Result<DurableState> {
        let state_cf = self.cf(CF_STATE)?;
        let hard_state = match self.db.get_cf(state_cf, KEY_HARD_STATE)? {
            Some(bytes) => decode_record("hard state", &bytes)?,
            None => HardState::default(),
        };
        let checkpoint = self
            .db
            .get_cf(state_cf, KEY_CHECKPOINT)?
            .map(|bytes| decode_record::<Checkpoint>("checkpoint", &bytes))
            .transpose()?;

        let log_cf = self.cf(CF_LOG)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(log_cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            entries.push(decode_record::<LogEntry>("log entry", &value)?);
        }
        check_contiguous(&entries)?;

        Ok(DurableState {
            hard_state,
            entries,
            checkpoint,
        })
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let cf = self.cf(CF_LOG)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(cf, entry.index.to_be_bytes(), encode_record(entry)?);
        }
        self.db.write_opt(batch, &Self::sync_opts())?;
        Ok(())
    }

    fn truncate_from(&self, from: u64) -> Result<()> {
        let cf = self.cf(CF_LOG)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(cf, from.to_be_bytes(), u64::MAX.to_be_bytes());
        batch.delete_cf(cf, u64::MAX.to_be_bytes());
        self.db.write_opt(batch, &Self::sync_opts())?;
        Ok(())
    }

    fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        let cf = self.cf(CF_STATE)?;
        self.db
            .put_cf_opt(cf, KEY_HARD_STATE, encode_record(hard_state)?, &Self::sync_opts())?;
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let cf = self.cf(CF_STATE)?;
        self.db
            .put_cf_opt(cf, KEY_CHECKPOINT, encode_record(checkpoint)?, &Self::sync_opts())?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let log_cf = self.cf(CF_LOG)?;
        let state_cf = self.cf(CF_STATE)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(log_cf, 0u64.to_be_bytes(), u64::MAX.to_be_bytes());
        batch.delete_cf(log_cf, u64::MAX.to_be_bytes());
        batch.put_cf(state_cf, KEY_HARD_STATE, encode_record(&HardState::wiped())?);
        batch.delete_cf(state_cf, KEY_CHECKPOINT);
        self.db.write_opt(batch, &Self::sync_opts())?;
        Ok(())
    }
}
