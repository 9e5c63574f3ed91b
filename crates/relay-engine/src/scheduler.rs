use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use relay_store::{DeliveryLedger, StoreError};
use relay_types::{DeliveryFailure, DeliveryRecord, DeliveryState, EventId, StateChange};

use crate::backoff::BackoffPolicy;
use crate::error::RelayResult;

/// Result of one scheduler pass.
#[derive(Clone, Debug, Default)]
pub struct ScanReport {
    /// Records moved to permanently failed because their attempts ran out.
    pub exhausted: Vec<EventId>,
    /// Retryable records whose retry time has come, in ingestion order.
    pub due: Vec<DeliveryRecord>,
}

/// Owns retry timing for failed records.
///
/// Every operation takes `now`, so retry behaviour can be driven without
/// real time passing.
pub struct RetryScheduler {
    ledger: Arc<dyn DeliveryLedger>,
    backoff: BackoffPolicy,
    max_attempts: u32,
}

impl RetryScheduler {
    pub fn new(ledger: Arc<dyn DeliveryLedger>, backoff: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            ledger,
            backoff,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Earliest time a record that has made `attempts` attempts may retry.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.delay(attempts);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// The `Fail` change to record for a failed attempt. Retryable kinds get
    /// a retry time even when attempts are spent; [`exhaust_if_spent`]
    /// closes those out.
    ///
    /// [`exhaust_if_spent`]: Self::exhaust_if_spent
    pub fn failure_change(
        &self,
        failure: DeliveryFailure,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> StateChange {
        let next_retry_at = failure
            .kind
            .is_retryable()
            .then(|| self.next_retry_at(attempts, now));
        StateChange::Fail {
            failure,
            next_retry_at,
        }
    }

    /// Mark `record` permanently failed if it is retryable but has no
    /// attempts left. Returns the updated record, or `None` if nothing
    /// changed or another writer got there first.
    pub fn exhaust_if_spent(
        &self,
        record: &DeliveryRecord,
        now: DateTime<Utc>,
    ) -> RelayResult<Option<DeliveryRecord>> {
        if !record.is_retryable() || record.attempts < self.max_attempts {
            return Ok(None);
        }
        let change = StateChange::Exhaust {
            reason: format!(
                "{} of {} attempts used",
                record.attempts, self.max_attempts
            ),
        };
        match self
            .ledger
            .transition(&record.id(), DeliveryState::Failed, change, now)
        {
            Ok(updated) => {
                error!(
                    id = %record.id(),
                    key = record.event.source_record_key(),
                    attempts = record.attempts,
                    "retries exhausted"
                );
                Ok(Some(updated))
            }
            Err(StoreError::StateConflict { .. }) | Err(StoreError::IllegalTransition(_)) => {
                debug!(id = %record.id(), "exhaust skipped, record moved on");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark every retryable record with no attempts left as exhausted.
    pub fn exhaust_spent(&self, now: DateTime<Utc>) -> RelayResult<Vec<EventId>> {
        let mut exhausted = Vec::new();
        for record in self.ledger.list_exhausted(self.max_attempts)? {
            if self.exhaust_if_spent(&record, now)?.is_some() {
                exhausted.push(record.id());
            }
        }
        Ok(exhausted)
    }

    /// Exhaust spent records, then list retryable records due at `now`.
    pub fn scan_once(&self, now: DateTime<Utc>) -> RelayResult<ScanReport> {
        let exhausted = self.exhaust_spent(now)?;
        let due = self.ledger.list_due_for_retry(now, self.max_attempts)?;
        Ok(ScanReport { exhausted, due })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::InMemoryDeliveryLedger;
    use relay_types::{EventType, FailureKind, RelayEvent, SourceIdentity, TargetTxRef};
    use std::time::Duration;

    fn scheduler(ledger: &Arc<InMemoryDeliveryLedger>, max_attempts: u32) -> RetryScheduler {
        RetryScheduler::new(
            ledger.clone(),
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 0.0),
            max_attempts,
        )
    }

    fn ingest(ledger: &InMemoryDeliveryLedger, tx: &str) -> EventId {
        let event = RelayEvent::new(
            SourceIdentity::new(tx, "CarCreated", 0),
            "CAR10",
            EventType::Created,
            br#"{"make":"Toyota"}"#.to_vec(),
            Utc::now(),
        );
        ledger.put_if_absent(event).unwrap().record().id()
    }

    fn fail_attempt(
        ledger: &InMemoryDeliveryLedger,
        sched: &RetryScheduler,
        id: &EventId,
        from: DeliveryState,
        now: DateTime<Utc>,
    ) -> DeliveryRecord {
        let claimed = ledger
            .transition(id, from, StateChange::Claim { max_attempts: sched.max_attempts() }, now)
            .unwrap();
        let failure = DeliveryFailure::new(FailureKind::TargetTransient, "offline");
        let change = sched.failure_change(failure, claimed.attempts, now);
        ledger.transition(id, DeliveryState::InFlight, change, now).unwrap()
    }

    #[test]
    fn transient_failure_gets_backoff_from_attempts() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let sched = scheduler(&ledger, 5);
        let now = Utc::now();
        let id = ingest(&ledger, "tx-1");

        let failed = fail_attempt(&ledger, &sched, &id, DeliveryState::Pending, now);
        assert_eq!(failed.attempts, 1);
        assert_eq!(
            failed.next_retry_at,
            Some(now + chrono::Duration::milliseconds(200))
        );
    }

    #[test]
    fn permanent_failure_has_no_retry_time() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let sched = scheduler(&ledger, 5);
        let failure = DeliveryFailure::new(FailureKind::TargetPermanent, "rejected");
        match sched.failure_change(failure, 1, Utc::now()) {
            StateChange::Fail { next_retry_at, .. } => assert!(next_retry_at.is_none()),
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn scan_returns_due_records_only() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let sched = scheduler(&ledger, 5);
        let now = Utc::now();
        let id = ingest(&ledger, "tx-1");
        fail_attempt(&ledger, &sched, &id, DeliveryState::Pending, now);

        assert!(sched.scan_once(now).unwrap().due.is_empty());

        let later = now + chrono::Duration::seconds(1);
        let report = sched.scan_once(later).unwrap();
        assert_eq!(report.due.len(), 1);
        assert_eq!(report.due[0].id(), id);
        assert!(report.exhausted.is_empty());
    }

    #[test]
    fn spent_records_are_exhausted() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let sched = scheduler(&ledger, 2);
        let mut now = Utc::now();
        let id = ingest(&ledger, "tx-1");

        fail_attempt(&ledger, &sched, &id, DeliveryState::Pending, now);
        now += chrono::Duration::seconds(10);
        let failed = fail_attempt(&ledger, &sched, &id, DeliveryState::Failed, now);
        assert_eq!(failed.attempts, 2);
        assert!(failed.is_retryable());

        let report = sched.scan_once(now + chrono::Duration::seconds(10)).unwrap();
        assert_eq!(report.exhausted, vec![id]);
        assert!(report.due.is_empty());

        let record = ledger.get(&id).unwrap().unwrap();
        assert!(record.is_permanently_failed());
        let error = record.last_error.unwrap();
        assert_eq!(error.kind, FailureKind::RetriesExhausted);
        assert!(error.message.contains("offline"));
    }

    #[test]
    fn exhaust_ignores_delivered_records() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let sched = scheduler(&ledger, 1);
        let now = Utc::now();
        let id = ingest(&ledger, "tx-1");
        ledger
            .transition(&id, DeliveryState::Pending, StateChange::Claim { max_attempts: 1 }, now)
            .unwrap();
        let delivered = ledger
            .transition(
                &id,
                DeliveryState::InFlight,
                StateChange::Deliver { tx_ref: TargetTxRef("tx-9".into()) },
                now,
            )
            .unwrap();
        assert!(sched.exhaust_if_spent(&delivered, now).unwrap().is_none());
    }
}
