use serde::{Deserialize, Serialize};

use relay_types::{EventId, TargetTxRef};

/// Arguments of one target-ledger transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionArgs {
    /// Target function to invoke, e.g. `createCar`.
    pub function: String,
    /// Upsert key on the target; the source record key.
    pub key: String,
    /// Positional arguments after the key.
    pub args: Vec<String>,
    /// Relay event the write originates from, stored alongside the record
    /// so a later query can tell whether this event was applied.
    pub event_id: EventId,
}

/// What the target currently holds for a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReceipt {
    pub key: String,
    pub tx_ref: TargetTxRef,
    pub event_id: EventId,
}
