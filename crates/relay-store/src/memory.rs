//! In-memory delivery ledger for testing and embedding.
//!
//! [`InMemoryDeliveryLedger`] keeps all records in a [`DeliveryIndex`]
//! behind a `RwLock`. Data is lost when the ledger is dropped, so it gives
//! no restart guarantees; use [`crate::WalDeliveryLedger`] for that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use relay_types::{DeliveryRecord, DeliveryState, EventId, RelayEvent, StateChange};

use crate::error::{StoreError, StoreResult};
use crate::index::DeliveryIndex;
use crate::retention::RetentionPolicy;
use crate::traits::{DeliveryLedger, PutOutcome};

/// An in-memory implementation of [`DeliveryLedger`].
#[derive(Debug, Default)]
pub struct InMemoryDeliveryLedger {
    index: RwLock<DeliveryIndex>,
    unavailable: AtomicBool,
}

impl InMemoryDeliveryLedger {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(DeliveryIndex::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail with `StorageUnavailable` until
    /// switched back. Used to exercise storage-fault handling.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::StorageUnavailable(
                "in-memory ledger switched off".into(),
            ));
        }
        Ok(())
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, DeliveryIndex>> {
        self.check_available()?;
        self.index
            .read()
            .map_err(|e| StoreError::StorageUnavailable(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, DeliveryIndex>> {
        self.check_available()?;
        self.index
            .write()
            .map_err(|e| StoreError::StorageUnavailable(format!("lock poisoned: {e}")))
    }
}

impl DeliveryLedger for InMemoryDeliveryLedger {
    fn put_if_absent(&self, event: RelayEvent) -> StoreResult<PutOutcome> {
        let mut index = self.write()?;
        match index.prepare_insert(event) {
            Ok(record) => {
                index.commit(record.clone());
                debug!(id = %record.id(), seq = record.seq, "record inserted");
                Ok(PutOutcome::Inserted(record))
            }
            Err(existing) => Ok(PutOutcome::Duplicate(existing)),
        }
    }

    fn get(&self, id: &EventId) -> StoreResult<Option<DeliveryRecord>> {
        Ok(self.read()?.get(id).cloned())
    }

    fn transition(
        &self,
        id: &EventId,
        expected: DeliveryState,
        change: StateChange,
        now: DateTime<Utc>,
    ) -> StoreResult<DeliveryRecord> {
        let mut index = self.write()?;
        let next = index.prepare_transition(id, expected, &change, now)?;
        index.commit(next.clone());
        debug!(id = %id, from = %expected, to = %next.state, "record transitioned");
        Ok(next)
    }

    fn scan(
        &self,
        predicate: &dyn Fn(&DeliveryRecord) -> bool,
    ) -> StoreResult<Vec<DeliveryRecord>> {
        Ok(self.read()?.scan(predicate))
    }

    fn purge(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> StoreResult<Vec<EventId>> {
        let mut index = self.write()?;
        let expired = index.expired(policy, now);
        for id in &expired {
            index.remove(id);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use relay_types::{
        DeliveryFailure, EventType, FailureKind, SourceIdentity, TargetTxRef,
    };
    use std::sync::Arc;
    use std::thread;

    fn event(tx: &str) -> RelayEvent {
        RelayEvent::new(
            SourceIdentity::new(tx, "CarCreated", 0),
            "CAR10",
            EventType::Created,
            br#"{"make":"Toyota"}"#.to_vec(),
            Utc::now(),
        )
    }

    fn claim() -> StateChange {
        StateChange::Claim { max_attempts: 5 }
    }

    #[test]
    fn put_if_absent_dedups() {
        let ledger = InMemoryDeliveryLedger::new();
        assert!(ledger.put_if_absent(event("tx-1")).unwrap().is_inserted());
        let second = ledger.put_if_absent(event("tx-1")).unwrap();
        assert!(!second.is_inserted());
        assert_eq!(ledger.counts().unwrap().total(), 1);
    }

    #[test]
    fn concurrent_put_yields_one_insert() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || ledger.put_if_absent(event("same")).unwrap().is_inserted())
            })
            .collect();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|i| *i)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(ledger.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_claims_only_one_wins() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let id = ledger.put_if_absent(event("tx-1")).unwrap().record().id();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    ledger
                        .transition(&id, DeliveryState::Pending, claim(), Utc::now())
                        .is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|w| *w)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(ledger.get(&id).unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn transition_unknown_id_is_not_found() {
        let ledger = InMemoryDeliveryLedger::new();
        let id = event("ghost").id();
        let err = ledger
            .transition(&id, DeliveryState::Pending, claim(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn due_for_retry_respects_time_and_ceiling() {
        let ledger = InMemoryDeliveryLedger::new();
        let now = Utc::now();
        let id = ledger.put_if_absent(event("tx-1")).unwrap().record().id();
        ledger
            .transition(&id, DeliveryState::Pending, claim(), now)
            .unwrap();
        ledger
            .transition(
                &id,
                DeliveryState::InFlight,
                StateChange::Fail {
                    failure: DeliveryFailure::new(FailureKind::TargetTransient, "down"),
                    next_retry_at: Some(now + Duration::seconds(5)),
                },
                now,
            )
            .unwrap();

        assert!(ledger.list_due_for_retry(now, 5).unwrap().is_empty());
        assert_eq!(ledger.list_due_for_retry(now + Duration::seconds(5), 5).unwrap().len(), 1);
        assert!(ledger.list_due_for_retry(now + Duration::seconds(5), 1).unwrap().is_empty());
        assert_eq!(ledger.list_exhausted(1).unwrap().len(), 1);
    }

    #[test]
    fn purge_only_removes_expired_terminal_records() {
        let ledger = InMemoryDeliveryLedger::new();
        let now = Utc::now();
        let delivered = ledger.put_if_absent(event("d")).unwrap().record().id();
        ledger.put_if_absent(event("p")).unwrap();
        ledger
            .transition(&delivered, DeliveryState::Pending, claim(), now)
            .unwrap();
        ledger
            .transition(
                &delivered,
                DeliveryState::InFlight,
                StateChange::Deliver { tx_ref: TargetTxRef("t1".into()) },
                now,
            )
            .unwrap();

        let policy = RetentionPolicy {
            delivered_ttl_secs: Some(60),
            abandoned_ttl_secs: None,
        };
        assert!(ledger.purge(&policy, now).unwrap().is_empty());
        let removed = ledger.purge(&policy, now + Duration::seconds(61)).unwrap();
        assert_eq!(removed, vec![delivered]);
        assert_eq!(ledger.counts().unwrap().pending, 1);
        assert_eq!(ledger.counts().unwrap().delivered, 0);
    }

    #[test]
    fn unavailable_storage_fails_every_operation() {
        let ledger = InMemoryDeliveryLedger::new();
        ledger.set_unavailable(true);
        let err = ledger.put_if_absent(event("tx")).unwrap_err();
        assert!(err.is_storage_fault());
        assert!(ledger.counts().unwrap_err().is_storage_fault());
        ledger.set_unavailable(false);
        assert!(ledger.put_if_absent(event("tx")).unwrap().is_inserted());
    }
}
