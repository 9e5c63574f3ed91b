use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{EventId, SourceIdentity};

/// Classification of relayed events.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A record was created on the source ledger.
    Created,
    /// An existing record changed.
    Updated,
    /// A record was deleted.
    Deleted,
    /// Ownership of a record moved to another party.
    Transferred,
    /// Any event name the relay does not classify.
    Other(String),
}

impl EventType {
    /// Classify a source contract event name.
    ///
    /// Contract events are usually named `<Entity><Verb>` (`CarCreated`,
    /// `CarOwnerChanged`), so classification goes by suffix.
    pub fn from_event_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with("created") || lower.ends_with("create") {
            Self::Created
        } else if lower.ends_with("updated")
            || lower.ends_with("update")
            || lower.ends_with("changed")
        {
            Self::Updated
        } else if lower.ends_with("deleted") || lower.ends_with("delete") {
            Self::Deleted
        } else if lower.ends_with("transferred") || lower.ends_with("transfer") {
            Self::Transferred
        } else {
            Self::Other(name.to_string())
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Updated => write!(f, "Updated"),
            Self::Deleted => write!(f, "Deleted"),
            Self::Transferred => write!(f, "Transferred"),
            Self::Other(name) => write!(f, "Other({name})"),
        }
    }
}

/// Normalized form of a source-ledger notification.
///
/// Immutable once created: the id is computed from `identity` at
/// construction and every field is read-only afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    id: EventId,
    identity: SourceIdentity,
    source_record_key: String,
    event_type: EventType,
    payload: Vec<u8>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    observed_at: DateTime<Utc>,
}

impl RelayEvent {
    pub fn new(
        identity: SourceIdentity,
        source_record_key: impl Into<String>,
        event_type: EventType,
        payload: Vec<u8>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::derive(&identity),
            identity,
            source_record_key: source_record_key.into(),
            event_type,
            payload,
            observed_at,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    pub fn source_record_key(&self) -> &str {
        &self.source_record_key
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Payload bytes exactly as captured at emission time.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}
