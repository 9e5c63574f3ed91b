use std::io;

use relay_types::{DeliveryState, EventId, TypeError};

/// Errors from delivery ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record is not in the state the caller expected; another writer
    /// got there first.
    #[error("state conflict on {id}: expected {expected}, found {actual}")]
    StateConflict {
        id: EventId,
        expected: DeliveryState,
        actual: DeliveryState,
    },

    /// No record exists for the id.
    #[error("delivery record not found: {0}")]
    NotFound(EventId),

    /// The requested change is not a legal edge from the current state.
    #[error(transparent)]
    IllegalTransition(#[from] TypeError),

    /// The backing storage cannot be read or written.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// I/O error from the underlying storage backend.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Storage faults are fatal to the relay; everything else is a per-record
    /// outcome.
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Io(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StateConflict { .. })
    }
}

/// Result alias for delivery ledger operations.
pub type StoreResult<T> = Result<T, StoreError>;
