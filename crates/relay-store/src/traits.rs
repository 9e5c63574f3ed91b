use chrono::{DateTime, Utc};

use relay_types::{
    DeliveryRecord, DeliveryState, EventId, RelayEvent, StateChange, StatusCounts,
};

use crate::error::StoreResult;
use crate::retention::RetentionPolicy;

/// Outcome of [`DeliveryLedger::put_if_absent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new `Pending` record was created.
    Inserted(DeliveryRecord),
    /// A record with the same id already exists; nothing was written.
    Duplicate(DeliveryRecord),
}

impl PutOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }

    pub fn record(&self) -> &DeliveryRecord {
        match self {
            Self::Inserted(r) | Self::Duplicate(r) => r,
        }
    }
}

/// Durable map from event id to delivery record.
///
/// All implementations must satisfy these invariants:
/// - `put_if_absent` is atomic: concurrent inserts of one id yield exactly
///   one `Inserted`.
/// - `transition` is compare-and-set on `(id, expected)` and applies only
///   the edges [`StateChange`] allows.
/// - A successful call is durable before it returns.
/// - Storage faults surface as [`crate::StoreError::StorageUnavailable`] or
///   [`crate::StoreError::Io`], never as silent success.
pub trait DeliveryLedger: Send + Sync {
    /// Record `event` as `Pending` unless a record with its id exists.
    fn put_if_absent(&self, event: RelayEvent) -> StoreResult<PutOutcome>;

    /// Read a record by id. Returns `Ok(None)` if it does not exist.
    fn get(&self, id: &EventId) -> StoreResult<Option<DeliveryRecord>>;

    /// Move a record from `expected` to the state `change` leads to.
    ///
    /// Fails with `StateConflict` if the current state is not `expected`,
    /// and with `IllegalTransition` if the edge is not allowed.
    fn transition(
        &self,
        id: &EventId,
        expected: DeliveryState,
        change: StateChange,
        now: DateTime<Utc>,
    ) -> StoreResult<DeliveryRecord>;

    /// All records matching `predicate`, in ingestion order.
    fn scan(&self, predicate: &dyn Fn(&DeliveryRecord) -> bool)
        -> StoreResult<Vec<DeliveryRecord>>;

    /// Remove terminal records the policy has expired. Returns the removed ids.
    fn purge(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> StoreResult<Vec<EventId>>;

    /// Records waiting for their first attempt.
    fn list_pending(&self) -> StoreResult<Vec<DeliveryRecord>> {
        self.scan(&|r| r.state == DeliveryState::Pending)
    }

    /// Records whose last attempt has no known outcome.
    fn list_in_flight(&self) -> StoreResult<Vec<DeliveryRecord>> {
        self.scan(&|r| r.state == DeliveryState::InFlight)
    }

    /// Failed records under the attempt ceiling whose retry time has come.
    fn list_due_for_retry(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> StoreResult<Vec<DeliveryRecord>> {
        self.scan(&|r| r.is_due(now, max_attempts))
    }

    /// Retryable records that have already used every attempt.
    fn list_exhausted(&self, max_attempts: u32) -> StoreResult<Vec<DeliveryRecord>> {
        self.scan(&|r| r.is_retryable() && r.attempts >= max_attempts)
    }

    /// Failed records with no retry scheduled.
    fn list_failed_permanent(&self) -> StoreResult<Vec<DeliveryRecord>> {
        self.scan(&|r| r.is_permanently_failed())
    }

    /// Number of records per state.
    fn counts(&self) -> StoreResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for record in self.scan(&|_| true)? {
            counts.record(&record);
        }
        Ok(counts)
    }
}
