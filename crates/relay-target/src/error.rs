use thiserror::Error;

use relay_types::{DeliveryFailure, EventType, FailureKind};

/// Whether a failed write is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum TargetError {
    /// The target could not be reached or refused service.
    #[error("target unavailable: {0}")]
    Unavailable(String),

    /// No answer within the deadline. The write may or may not have committed.
    #[error("target timed out: {0}")]
    Timeout(String),

    /// Rejected by the target's business logic.
    #[error("rejected by target for key {key}: {reason}")]
    Rejected { key: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl TargetError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected { .. } => ErrorClass::Permanent,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Transport(_) => ErrorClass::Transient,
        }
    }

    /// The write may have been applied even though the call failed.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn failure_kind(&self) -> FailureKind {
        if self.is_ambiguous() {
            FailureKind::OutcomeUnknown
        } else {
            match self.class() {
                ErrorClass::Transient => FailureKind::TargetTransient,
                ErrorClass::Permanent => FailureKind::TargetPermanent,
            }
        }
    }

    pub fn to_failure(&self) -> DeliveryFailure {
        DeliveryFailure::new(self.failure_kind(), self.to_string())
    }
}

pub type TargetResult<T> = Result<T, TargetError>;

/// Payload could not be decoded into target arguments. Always terminal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{field}` must be a string or number")]
    InvalidField { field: String },

    #[error("no target function mapped for event type {0}")]
    Unmapped(EventType),
}

impl TranslateError {
    pub fn to_failure(&self) -> DeliveryFailure {
        DeliveryFailure::new(FailureKind::MalformedPayload, self.to_string())
    }
}

pub type TranslateResult<T> = Result<T, TranslateError>;
