//! Durable delivery ledger backed by a write-ahead log.
//!
//! The full record set lives in a [`DeliveryIndex`]; every mutation is
//! appended to the [`WriteAheadLog`] as a record snapshot before it is
//! installed in the index. Opening the ledger replays the log, so the index
//! after a restart equals the index before the crash minus any torn tail.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use relay_types::{DeliveryRecord, DeliveryState, EventId, RelayEvent, StateChange};

use crate::error::{StoreError, StoreResult};
use crate::index::DeliveryIndex;
use crate::retention::RetentionPolicy;
use crate::traits::{DeliveryLedger, PutOutcome};
use crate::wal::{WalConfig, WalEntry, WriteAheadLog};

/// A [`DeliveryLedger`] that survives process restarts.
pub struct WalDeliveryLedger {
    wal: WriteAheadLog,
    index: Mutex<DeliveryIndex>,
}

impl WalDeliveryLedger {
    /// Open (or create) the ledger at `path` and rebuild the index from the log.
    pub fn open(path: &Path, config: WalConfig) -> StoreResult<Self> {
        let wal = WriteAheadLog::open(path, config)?;
        let mut index = DeliveryIndex::new();
        let entries = wal.recover()?;
        let replayed = entries.len();
        for entry in entries {
            match entry {
                WalEntry::Put(record) => index.commit(record),
                WalEntry::Remove(id) => {
                    index.remove(&id);
                }
            }
        }
        info!(
            path = %path.display(),
            replayed,
            records = index.len(),
            "delivery ledger opened"
        );
        Ok(Self {
            wal,
            index: Mutex::new(index),
        })
    }

    /// Rewrite the log so it holds exactly one entry per live record.
    pub fn compact(&self) -> StoreResult<()> {
        let index = self.lock()?;
        let entries: Vec<WalEntry> = index.snapshot().into_iter().map(WalEntry::Put).collect();
        self.wal.rewrite(&entries).map_err(storage_fault)?;
        info!(records = entries.len(), bytes = self.wal.offset(), "delivery ledger compacted");
        Ok(())
    }

    /// Size of the log in bytes.
    pub fn log_size(&self) -> u64 {
        self.wal.offset()
    }

    pub fn path(&self) -> &Path {
        self.wal.path()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, DeliveryIndex>> {
        self.index
            .lock()
            .map_err(|e| StoreError::StorageUnavailable(format!("index lock poisoned: {e}")))
    }

    fn persist(&self, entry: &WalEntry) -> StoreResult<()> {
        self.wal.append(entry).map(|_| ()).map_err(storage_fault)
    }
}

/// Any failure to write the log means the ledger can no longer promise
/// durability.
fn storage_fault(err: StoreError) -> StoreError {
    match err {
        StoreError::Io(e) => StoreError::StorageUnavailable(e.to_string()),
        other => other,
    }
}

impl DeliveryLedger for WalDeliveryLedger {
    fn put_if_absent(&self, event: RelayEvent) -> StoreResult<PutOutcome> {
        let mut index = self.lock()?;
        match index.prepare_insert(event) {
            Ok(record) => {
                self.persist(&WalEntry::Put(record.clone()))?;
                index.commit(record.clone());
                debug!(id = %record.id(), seq = record.seq, "record inserted");
                Ok(PutOutcome::Inserted(record))
            }
            Err(existing) => Ok(PutOutcome::Duplicate(existing)),
        }
    }

    fn get(&self, id: &EventId) -> StoreResult<Option<DeliveryRecord>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn transition(
        &self,
        id: &EventId,
        expected: DeliveryState,
        change: StateChange,
        now: DateTime<Utc>,
    ) -> StoreResult<DeliveryRecord> {
        let mut index = self.lock()?;
        let next = index.prepare_transition(id, expected, &change, now)?;
        self.persist(&WalEntry::Put(next.clone()))?;
        index.commit(next.clone());
        debug!(id = %id, from = %expected, to = %next.state, "record transitioned");
        Ok(next)
    }

    fn scan(
        &self,
        predicate: &dyn Fn(&DeliveryRecord) -> bool,
    ) -> StoreResult<Vec<DeliveryRecord>> {
        Ok(self.lock()?.scan(predicate))
    }

    fn purge(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> StoreResult<Vec<EventId>> {
        let mut index = self.lock()?;
        let expired = index.expired(policy, now);
        for id in &expired {
            self.persist(&WalEntry::Remove(*id))?;
            index.remove(id);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "retention purge");
        }
        Ok(expired)
    }
}
