use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use relay_store::{DeliveryLedger, StoreError};
use relay_types::{DeliveryFailure, DeliveryRecord, DeliveryState, EventId, StateChange, StatusCounts};

use crate::error::{RelayError, RelayResult};

/// Lifecycle of a [`RelayCoordinator`](crate::RelayCoordinator).
///
/// ```text
/// Created -> Running -> Draining -> Stopped
///               \-------------------> Halted (storage fault)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Created,
    Running,
    Draining,
    Stopped,
    Halted,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// A permanently failed record awaiting operator action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Hex event id.
    pub id: String,
    pub key: String,
    pub event_name: String,
    pub attempts: u32,
    pub error: Option<DeliveryFailure>,
    pub updated_at: DateTime<Utc>,
}

impl From<&DeliveryRecord> for FailureSummary {
    fn from(record: &DeliveryRecord) -> Self {
        Self {
            id: record.id().to_hex(),
            key: record.event.source_record_key().to_string(),
            event_name: record.event.identity().event_name.clone(),
            attempts: record.attempts,
            error: record.last_error.clone(),
            updated_at: record.updated_at,
        }
    }
}

/// Point-in-time view of a relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub lifecycle: Lifecycle,
    pub paused: bool,
    pub counts: StatusCounts,
    /// Jobs a worker has picked up and not yet finished.
    pub in_flight_workers: usize,
    pub failures: Vec<FailureSummary>,
    pub halt_reason: Option<String>,
}

/// What the startup recovery pass found.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Pending records that will be dispatched.
    pub pending: usize,
    /// In-flight records turned into unknown-outcome failures.
    pub recovered_in_flight: Vec<EventId>,
    /// Records with no attempts left whose write was found on the target.
    pub confirmed: Vec<EventId>,
    /// Records found with no attempts left and marked exhausted.
    pub exhausted: Vec<EventId>,
}

/// Result of draining or shutting down.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Every in-flight submission resolved before the deadline.
    pub drained: bool,
    /// Jobs still running at the deadline and cancelled; recovered on next start.
    pub cancelled: usize,
    pub counts: StatusCounts,
}

/// Permanently failed records, oldest first.
pub fn failure_summaries(ledger: &dyn DeliveryLedger) -> RelayResult<Vec<FailureSummary>> {
    Ok(ledger
        .list_failed_permanent()?
        .iter()
        .map(FailureSummary::from)
        .collect())
}

/// Operator action: move a permanently failed record to `Abandoned`.
pub fn abandon_record(
    ledger: &dyn DeliveryLedger,
    id: &EventId,
    now: DateTime<Utc>,
) -> RelayResult<DeliveryRecord> {
    match ledger.transition(id, DeliveryState::Failed, StateChange::Abandon, now) {
        Ok(record) => {
            info!(id = %id, key = record.event.source_record_key(), "record abandoned");
            Ok(record)
        }
        Err(StoreError::StateConflict { actual, .. }) => {
            Err(RelayError::not_abandonable(*id, actual, false))
        }
        Err(StoreError::IllegalTransition(_)) => {
            Err(RelayError::not_abandonable(*id, DeliveryState::Failed, true))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::InMemoryDeliveryLedger;
    use relay_types::{EventType, FailureKind, RelayEvent, SourceIdentity};

    fn ingest(ledger: &InMemoryDeliveryLedger, tx: &str) -> EventId {
        let event = RelayEvent::new(
            SourceIdentity::new(tx, "CarCreated", 0),
            "CAR10",
            EventType::Created,
            b"{}".to_vec(),
            Utc::now(),
        );
        ledger.put_if_absent(event).unwrap().record().id()
    }

    fn fail(ledger: &InMemoryDeliveryLedger, id: &EventId, kind: FailureKind, retry: bool) {
        let now = Utc::now();
        ledger
            .transition(id, DeliveryState::Pending, StateChange::Claim { max_attempts: 3 }, now)
            .unwrap();
        ledger
            .transition(
                id,
                DeliveryState::InFlight,
                StateChange::Fail {
                    failure: DeliveryFailure::new(kind, "boom"),
                    next_retry_at: retry.then_some(now),
                },
                now,
            )
            .unwrap();
    }

    #[test]
    fn abandon_permanent_failure() {
        let ledger = InMemoryDeliveryLedger::new();
        let id = ingest(&ledger, "tx-1");
        fail(&ledger, &id, FailureKind::TargetPermanent, false);

        assert_eq!(failure_summaries(&ledger).unwrap().len(), 1);
        let record = abandon_record(&ledger, &id, Utc::now()).unwrap();
        assert_eq!(record.state, DeliveryState::Abandoned);
        assert!(failure_summaries(&ledger).unwrap().is_empty());
        assert_eq!(ledger.counts().unwrap().abandoned, 1);
    }

    #[test]
    fn abandon_refuses_pending_and_retryable() {
        let ledger = InMemoryDeliveryLedger::new();
        let pending = ingest(&ledger, "tx-1");
        assert!(matches!(
            abandon_record(&ledger, &pending, Utc::now()),
            Err(RelayError::NotAbandonable { .. })
        ));

        let retrying = ingest(&ledger, "tx-2");
        fail(&ledger, &retrying, FailureKind::TargetTransient, true);
        let err = abandon_record(&ledger, &retrying, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("retry scheduled"));
    }

    #[test]
    fn abandon_unknown_id() {
        let ledger = InMemoryDeliveryLedger::new();
        let id = EventId::derive(&SourceIdentity::new("nope", "CarCreated", 0));
        assert!(matches!(
            abandon_record(&ledger, &id, Utc::now()),
            Err(RelayError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn summary_carries_error_and_key() {
        let ledger = InMemoryDeliveryLedger::new();
        let id = ingest(&ledger, "tx-1");
        fail(&ledger, &id, FailureKind::TargetPermanent, false);

        let summary = &failure_summaries(&ledger).unwrap()[0];
        assert_eq!(summary.id, id.to_hex());
        assert_eq!(summary.key, "CAR10");
        assert_eq!(summary.event_name, "CarCreated");
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.error.as_ref().unwrap().kind, FailureKind::TargetPermanent);
    }
}
