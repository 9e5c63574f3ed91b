use serde::{Deserialize, Serialize};

use relay_types::{EventType, SourceIdentity};

/// A notification exactly as the source ledger emitted it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNotification {
    /// Source transaction that emitted the event.
    pub tx_id: String,
    /// Contract event name, e.g. `CarCreated`.
    pub event_name: String,
    /// Position of the event within its transaction.
    pub sequence: u64,
    /// Key of the affected record in source state, e.g. `CAR10`.
    pub record_key: String,
    /// Event payload bytes.
    pub payload: Vec<u8>,
}

impl RawNotification {
    pub fn new(
        tx_id: impl Into<String>,
        event_name: impl Into<String>,
        sequence: u64,
        record_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            tx_id: tx_id.into(),
            event_name: event_name.into(),
            sequence,
            record_key: record_key.into(),
            payload: payload.into(),
        }
    }

    /// The fields the dedup id is derived from.
    pub fn identity(&self) -> SourceIdentity {
        SourceIdentity::new(self.tx_id.clone(), self.event_name.clone(), self.sequence)
    }

    pub fn event_type(&self) -> EventType {
        EventType::from_event_name(&self.event_name)
    }
}

/// Selects which notifications a subscription receives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// If set, only notifications classifying as one of these types.
    pub event_types: Option<Vec<EventType>>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn event_types(types: Vec<EventType>) -> Self {
        Self {
            event_types: Some(types),
        }
    }

    pub fn matches(&self, notification: &RawNotification) -> bool {
        match &self.event_types {
            Some(types) => types.contains(&notification.event_type()),
            None => true,
        }
    }
}
