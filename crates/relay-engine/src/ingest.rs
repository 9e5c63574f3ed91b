use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use relay_source::{EventSource, RawNotification};
use relay_store::{DeliveryLedger, PutOutcome};
use relay_types::{DeliveryRecord, EventId, RelayEvent};

use crate::error::RelayResult;

/// What happened to one notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Recorded as a new `Pending` delivery.
    Accepted(DeliveryRecord),
    /// Already recorded under this id; discarded.
    Duplicate(EventId),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Normalize a raw notification into a [`RelayEvent`] observed at `now`.
pub fn normalize(notification: &RawNotification, now: DateTime<Utc>) -> RelayEvent {
    RelayEvent::new(
        notification.identity(),
        notification.record_key.clone(),
        notification.event_type(),
        notification.payload.clone(),
        now,
    )
}

/// Single consumer of the source feed.
///
/// A notification is acknowledged only after its record is durable, so a
/// crash between receipt and recording leaves it to be redelivered.
pub struct Ingestor {
    ledger: Arc<dyn DeliveryLedger>,
    source: Arc<dyn EventSource>,
}

impl Ingestor {
    pub fn new(ledger: Arc<dyn DeliveryLedger>, source: Arc<dyn EventSource>) -> Self {
        Self { ledger, source }
    }

    pub async fn ingest(
        &self,
        notification: &RawNotification,
        now: DateTime<Utc>,
    ) -> RelayResult<IngestOutcome> {
        let event = normalize(notification, now);
        let outcome = match self.ledger.put_if_absent(event)? {
            PutOutcome::Inserted(record) => {
                debug!(
                    id = %record.id(),
                    key = record.event.source_record_key(),
                    seq = record.seq,
                    "event accepted"
                );
                IngestOutcome::Accepted(record)
            }
            PutOutcome::Duplicate(record) => {
                debug!(id = %record.id(), "duplicate notification discarded");
                IngestOutcome::Duplicate(record.id())
            }
        };

        // Duplicates are acknowledged too: the record is already durable.
        if let Err(e) = self.source.acknowledge(notification).await {
            warn!(
                tx_id = %notification.tx_id,
                event = %notification.event_name,
                error = %e,
                "acknowledgement failed, source may redeliver"
            );
        }
        Ok(outcome)
    }
}
