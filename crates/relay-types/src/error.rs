use thiserror::Error;

use crate::delivery::DeliveryState;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("illegal transition {from} -> {change}")]
    IllegalTransition { from: DeliveryState, change: String },
}
