use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use relay_types::{DeliveryRecord, DeliveryState};

/// Which terminal records may be removed from the delivery ledger, and when.
///
/// Only `Delivered` and `Abandoned` records are ever eligible. A TTL of
/// `None` keeps records of that state forever.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep delivered records this many seconds after delivery.
    pub delivered_ttl_secs: Option<u64>,
    /// Keep abandoned records this many seconds after abandonment.
    pub abandoned_ttl_secs: Option<u64>,
}

impl RetentionPolicy {
    /// Keep everything.
    pub fn keep_all() -> Self {
        Self::default()
    }

    /// Returns `true` if no state has a TTL.
    pub fn is_keep_all(&self) -> bool {
        self.delivered_ttl_secs.is_none() && self.abandoned_ttl_secs.is_none()
    }

    /// Returns `true` if `record` may be purged at `now`.
    pub fn is_expired(&self, record: &DeliveryRecord, now: DateTime<Utc>) -> bool {
        let ttl = match record.state {
            DeliveryState::Delivered => self.delivered_ttl_secs,
            DeliveryState::Abandoned => self.abandoned_ttl_secs,
            _ => None,
        };
        match ttl {
            Some(secs) => {
                let secs = i64::try_from(secs).unwrap_or(i64::MAX);
                let age = now.signed_duration_since(record.updated_at);
                age >= Duration::try_seconds(secs).unwrap_or(Duration::MAX)
            }
            None => false,
        }
    }
}
