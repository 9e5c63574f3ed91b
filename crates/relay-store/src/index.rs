//! In-memory index shared by every [`crate::DeliveryLedger`] backend.
//!
//! Mutations are split into a `prepare_*` step that validates and computes
//! the new record without touching the index, and a `commit` step that
//! installs it. Durable backends persist between the two.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use relay_types::{DeliveryRecord, DeliveryState, EventId, RelayEvent, StateChange};

use crate::error::{StoreError, StoreResult};
use crate::retention::RetentionPolicy;

/// Records keyed by event id, plus the next ingestion sequence number.
#[derive(Debug)]
pub struct DeliveryIndex {
    records: HashMap<EventId, DeliveryRecord>,
    next_seq: u64,
}

impl DeliveryIndex {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            next_seq: 1,
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &EventId) -> Option<&DeliveryRecord> {
        self.records.get(id)
    }

    /// A new `Pending` record for `event`, or `Err(existing)` if the id is
    /// already present.
    pub fn prepare_insert(&self, event: RelayEvent) -> Result<DeliveryRecord, DeliveryRecord> {
        match self.records.get(&event.id()) {
            Some(existing) => Err(existing.clone()),
            None => Ok(DeliveryRecord::pending(event, self.next_seq)),
        }
    }

    /// Validate `change` against the current record and compute the result.
    pub fn prepare_transition(
        &self,
        id: &EventId,
        expected: DeliveryState,
        change: &StateChange,
        now: DateTime<Utc>,
    ) -> StoreResult<DeliveryRecord> {
        let current = self.records.get(id).ok_or(StoreError::NotFound(*id))?;
        if current.state != expected {
            return Err(StoreError::StateConflict {
                id: *id,
                expected,
                actual: current.state,
            });
        }
        Ok(current.apply(change, now)?)
    }

    /// Install a record, replacing any previous version.
    pub fn commit(&mut self, record: DeliveryRecord) {
        self.next_seq = self.next_seq.max(record.seq + 1);
        self.records.insert(record.id(), record);
    }

    /// Ids of records `policy` has expired at `now`.
    pub fn expired(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<EventId> {
        let mut ids: Vec<(u64, EventId)> = self
            .records
            .values()
            .filter(|r| policy.is_expired(r, now))
            .map(|r| (r.seq, r.id()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn remove(&mut self, id: &EventId) -> Option<DeliveryRecord> {
        self.records.remove(id)
    }

    /// Records matching `predicate`, sorted by ingestion sequence.
    pub fn scan(&self, predicate: &dyn Fn(&DeliveryRecord) -> bool) -> Vec<DeliveryRecord> {
        let mut out: Vec<DeliveryRecord> = self
            .records
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.seq);
        out
    }

    /// Every record, sorted by ingestion sequence.
    pub fn snapshot(&self) -> Vec<DeliveryRecord> {
        self.scan(&|_| true)
    }
}

impl Default for DeliveryIndex {
    fn default() -> Self {
        Self::new()
    }
}
