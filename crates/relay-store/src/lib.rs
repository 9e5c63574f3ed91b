//! Delivery ledger for the ledger relay.
//!
//! The delivery ledger is the durable map from [`EventId`] to
//! [`DeliveryRecord`]. It is the source of truth for deduplication and for
//! resuming work after a restart, and its [`DeliveryLedger::transition`]
//! operation is the single synchronization point between relay workers.
//!
//! # Backends
//!
//! All backends implement the [`DeliveryLedger`] trait:
//!
//! - [`InMemoryDeliveryLedger`] -- `HashMap`-based ledger for tests and embedding
//! - [`WalDeliveryLedger`] -- in-memory index backed by a CRC-framed write-ahead log
//!
//! # Design Rules
//!
//! 1. A record exists at most once per id; `put_if_absent` never overwrites.
//! 2. Transitions are compare-and-set on `(id, expected_state)`.
//! 3. A mutation is visible only after it is durable (WAL backend).
//! 4. Records leave the ledger only through an explicit [`RetentionPolicy`].
//!
//! [`EventId`]: relay_types::EventId
//! [`DeliveryRecord`]: relay_types::DeliveryRecord

pub mod durable;
pub mod error;
pub mod index;
pub mod memory;
pub mod retention;
pub mod traits;
pub mod wal;

pub use durable::WalDeliveryLedger;
pub use error::{StoreError, StoreResult};
pub use index::DeliveryIndex;
pub use memory::InMemoryDeliveryLedger;
pub use retention::RetentionPolicy;
pub use traits::{DeliveryLedger, PutOutcome};
pub use wal::{SyncMode, WalConfig, WalEntry, WriteAheadLog};
