use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source disconnected: {0}")]
    Disconnected(String),

    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    #[error("acknowledgement failed for {tx_id}/{event_name}#{sequence}: {reason}")]
    AckFailed {
        tx_id: String,
        event_name: String,
        sequence: u64,
        reason: String,
    },

    #[error("source is shut down")]
    Shutdown,
}

pub type SourceResult<T> = Result<T, SourceError>;
