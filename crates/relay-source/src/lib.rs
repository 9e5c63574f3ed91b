//! Source-ledger boundary for the ledger relay.
//!
//! A source ledger pushes notifications through callbacks; the relay sees
//! them as a pull-based, restartable stream obtained from
//! [`EventSource::subscribe`]. The feed is at-least-once: it may redeliver a
//! notification and may deliver out of commit order until the relay
//! acknowledges it.

pub mod channel;
pub mod error;
pub mod notification;
pub mod traits;

pub use channel::ChannelEventSource;
pub use error::{SourceError, SourceResult};
pub use notification::{RawNotification, SubscriptionFilter};
pub use traits::{EventSource, NotificationStream};
