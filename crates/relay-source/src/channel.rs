use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{SourceError, SourceResult};
use crate::notification::{RawNotification, SubscriptionFilter};
use crate::traits::{EventSource, NotificationStream};

type NotificationKey = (String, String, u64);

fn key_of(notification: &RawNotification) -> NotificationKey {
    (
        notification.tx_id.clone(),
        notification.event_name.clone(),
        notification.sequence,
    )
}

struct Subscriber {
    filter: SubscriptionFilter,
    sender: mpsc::UnboundedSender<RawNotification>,
}

#[derive(Default)]
struct FeedState {
    subscribers: Vec<Subscriber>,
    /// Published but not yet acknowledged, by first-publish order.
    unacked: BTreeMap<u64, RawNotification>,
    /// Publish order of each pending notification.
    pending: HashMap<NotificationKey, u64>,
    next_order: u64,
    acked: u64,
    filtered: u64,
    shut_down: bool,
}

impl FeedState {
    fn wanted(&self, notification: &RawNotification) -> bool {
        self.subscribers
            .iter()
            .any(|sub| sub.filter.matches(notification))
    }

    fn track(&mut self, key: NotificationKey, notification: RawNotification) {
        let order = self.next_order;
        self.next_order += 1;
        self.pending.insert(key, order);
        self.unacked.insert(order, notification);
    }

    /// Drop pending notifications no live subscription will ever receive.
    fn prune_unwanted(&mut self) -> usize {
        let unwanted: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, n)| !self.wanted(n))
            .map(|(order, _)| *order)
            .collect();
        for order in &unwanted {
            if let Some(n) = self.unacked.remove(order) {
                self.pending.remove(&key_of(&n));
            }
        }
        self.filtered += unwanted.len() as u64;
        unwanted.len()
    }

    fn route(&mut self, notification: &RawNotification) {
        self.subscribers.retain(|sub| {
            if sub.filter.matches(notification) {
                sub.sender.send(notification.clone()).is_ok()
            } else {
                !sub.sender.is_closed()
            }
        });
    }
}

/// In-process notification feed.
///
/// Behaves like a ledger event hub: every published notification fans out
/// to matching subscribers and stays pending until acknowledged. A new
/// subscription replays everything still pending, and
/// [`redeliver_unacked`](Self::redeliver_unacked) replays it on the live
/// subscriptions, so consumers observe at-least-once delivery.
///
/// Only notifications some subscription wants are kept pending. One that no
/// live filter matches is counted as filtered and dropped; with no
/// subscriptions at all it is held until the next one opens.
#[derive(Default)]
pub struct ChannelEventSource {
    state: Mutex<FeedState>,
}

impl ChannelEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SourceResult<std::sync::MutexGuard<'_, FeedState>> {
        self.state
            .lock()
            .map_err(|_| SourceError::Disconnected("feed lock poisoned".into()))
    }

    /// Publish a notification to every matching subscriber.
    ///
    /// Publishing a notification that is already pending routes it again
    /// without tracking a second copy.
    pub fn publish(&self, notification: RawNotification) -> SourceResult<()> {
        let mut state = self.lock()?;
        if state.shut_down {
            return Err(SourceError::Shutdown);
        }

        if !state.subscribers.is_empty() && !state.wanted(&notification) {
            state.filtered += 1;
            debug!(
                tx_id = %notification.tx_id,
                event = %notification.event_name,
                "notification matches no subscription, dropped"
            );
            return Ok(());
        }

        let key = key_of(&notification);
        if !state.pending.contains_key(&key) {
            state.track(key, notification.clone());
        }

        state.route(&notification);
        debug!(
            tx_id = %notification.tx_id,
            event = %notification.event_name,
            sequence = notification.sequence,
            "notification published"
        );
        Ok(())
    }

    /// Route every pending notification again, in first-publish order.
    pub fn redeliver_unacked(&self) -> SourceResult<usize> {
        let mut state = self.lock()?;
        let pending: Vec<RawNotification> = state.unacked.values().cloned().collect();
        for notification in &pending {
            state.route(notification);
        }
        Ok(pending.len())
    }

    /// Drop every subscription; open streams end. The feed stays usable.
    pub fn disconnect(&self) -> SourceResult<()> {
        let mut state = self.lock()?;
        state.subscribers.clear();
        Ok(())
    }

    /// Close the feed for good.
    pub fn shutdown(&self) -> SourceResult<()> {
        let mut state = self.lock()?;
        state.subscribers.clear();
        state.shut_down = true;
        Ok(())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().map(|s| s.unacked.len()).unwrap_or(0)
    }

    /// Notifications dropped because no subscription matched them.
    pub fn filtered_count(&self) -> u64 {
        self.lock().map(|s| s.filtered).unwrap_or(0)
    }

    pub fn acked_count(&self) -> u64 {
        self.lock().map(|s| s.acked).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().map(|s| s.subscribers.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn subscribe(&self, filter: &SubscriptionFilter) -> SourceResult<NotificationStream> {
        let mut state = self.lock()?;
        if state.shut_down {
            return Err(SourceError::Shutdown);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut replayed = 0usize;
        for notification in state.unacked.values() {
            if filter.matches(notification) && tx.send(notification.clone()).is_ok() {
                replayed += 1;
            }
        }
        state.subscribers.retain(|sub| !sub.sender.is_closed());
        state.subscribers.push(Subscriber {
            filter: filter.clone(),
            sender: tx,
        });
        let dropped = state.prune_unwanted();

        debug!(replayed, dropped, "subscription opened");
        Ok(rx)
    }

    async fn acknowledge(&self, notification: &RawNotification) -> SourceResult<()> {
        let mut state = self.lock()?;
        // Acknowledging twice is harmless.
        if let Some(order) = state.pending.remove(&key_of(notification)) {
            state.unacked.remove(&order);
            state.acked += 1;
        }
        Ok(())
    }
}
