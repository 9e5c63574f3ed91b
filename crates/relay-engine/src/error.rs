use thiserror::Error;

use relay_source::SourceError;
use relay_store::StoreError;
use relay_types::{DeliveryState, EventId};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("relay already started")]
    AlreadyStarted,

    #[error("relay is not running")]
    NotRunning,

    /// A storage fault stopped the relay; restart the process to resume.
    #[error("relay halted: {0}")]
    Halted(String),

    #[error("record {id} is {state} and cannot be abandoned")]
    NotAbandonable { id: EventId, state: String },
}

impl RelayError {
    pub fn not_abandonable(id: EventId, state: DeliveryState, retryable: bool) -> Self {
        let state = if retryable {
            format!("{state} (retry scheduled)")
        } else {
            state.to_string()
        };
        Self::NotAbandonable { id, state }
    }

    /// Whether this error should stop the relay.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(e) => e.is_storage_fault(),
            Self::Halted(_) => true,
            _ => false,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
