use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SourceResult;
use crate::notification::{RawNotification, SubscriptionFilter};

/// A lazy, potentially infinite sequence of notifications.
///
/// The stream ends (`recv` returns `None`) when the source disconnects; the
/// consumer re-subscribes to resume.
pub type NotificationStream = mpsc::UnboundedReceiver<RawNotification>;

/// Subscription feed of a source ledger.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a new subscription. Notifications not yet acknowledged may be
    /// delivered again on every new subscription.
    async fn subscribe(&self, filter: &SubscriptionFilter) -> SourceResult<NotificationStream>;

    /// Tell the source the notification is durably recorded and need not be
    /// redelivered.
    async fn acknowledge(&self, notification: &RawNotification) -> SourceResult<()>;
}
