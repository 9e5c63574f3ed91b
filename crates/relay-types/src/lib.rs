//! Foundation types for the ledger relay.
//!
//! Every other relay crate depends on `relay-types`. The types here describe
//! what the relay moves between ledgers and how far each move has progressed.
//!
//! # Key Types
//!
//! - [`EventId`]: Dedup key derived from source-ledger event identity (BLAKE3)
//! - [`SourceIdentity`]: Transaction id, event name, and sequence of a source event
//! - [`RelayEvent`]: Immutable, normalized form of a source notification
//! - [`DeliveryRecord`]: Per-event delivery state owned by the delivery ledger
//! - [`StateChange`]: The only ways a delivery record may move forward

pub mod delivery;
pub mod error;
pub mod event;
pub mod identity;

pub use delivery::{
    DeliveryFailure, DeliveryRecord, DeliveryState, FailureKind, StateChange, StatusCounts,
    TargetTxRef,
};
pub use error::TypeError;
pub use event::{EventType, RelayEvent};
pub use identity::{EventId, SourceIdentity};
