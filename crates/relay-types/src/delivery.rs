use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::event::RelayEvent;
use crate::identity::EventId;

/// Delivery progress of a single relay event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Recorded, not yet attempted.
    Pending,
    /// Claimed by a worker; the outcome of the attempt is not yet known.
    InFlight,
    /// The target ledger accepted the write.
    Delivered,
    /// The last attempt failed. Retryable while `next_retry_at` is set.
    Failed,
    /// An operator gave up on a permanently failed record.
    Abandoned,
}

impl DeliveryState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Abandoned)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::InFlight => "InFlight",
            Self::Delivered => "Delivered",
            Self::Failed => "Failed",
            Self::Abandoned => "Abandoned",
        };
        write!(f, "{s}")
    }
}

/// Why a delivery attempt did not succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The payload could not be decoded. Never retried.
    MalformedPayload,
    /// The target was unreachable or unavailable; the write did not land.
    TargetTransient,
    /// The target rejected the write. Never retried.
    TargetPermanent,
    /// The write may or may not have landed (timeout, cancellation, restart).
    OutcomeUnknown,
    /// Retries ran out.
    RetriesExhausted,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TargetTransient | Self::OutcomeUnknown)
    }

    /// The previous write may already be applied on the target.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::OutcomeUnknown)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MalformedPayload => "MalformedPayload",
            Self::TargetTransient => "TargetTransient",
            Self::TargetPermanent => "TargetPermanent",
            Self::OutcomeUnknown => "OutcomeUnknown",
            Self::RetriesExhausted => "RetriesExhausted",
        };
        write!(f, "{s}")
    }
}

/// A classified failure with a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl DeliveryFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Reference to the transaction the target ledger committed for a delivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetTxRef(pub String);

impl TargetTxRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetTxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A requested move of a [`DeliveryRecord`] to its next state.
///
/// Allowed edges:
///
/// ```text
/// Pending  --Claim-->   InFlight   (attempts += 1)
/// Failed   --Claim-->   InFlight   (retryable and attempts < max_attempts)
/// InFlight --Deliver--> Delivered
/// InFlight --Fail-->    Failed
/// Pending  --Fail-->    Failed     (MalformedPayload only)
/// Failed   --Confirm--> Delivered  (retryable, last outcome unknown)
/// Failed   --Exhaust--> Failed     (retryable -> permanent)
/// Failed   --Abandon--> Abandoned  (permanent only)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateChange {
    Claim {
        max_attempts: u32,
    },
    Deliver {
        tx_ref: TargetTxRef,
    },
    Fail {
        failure: DeliveryFailure,
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// An earlier write whose outcome was unknown turned out to be applied.
    /// Spends no attempt.
    Confirm {
        tx_ref: TargetTxRef,
    },
    Exhaust {
        reason: String,
    },
    Abandon,
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claim { .. } => write!(f, "Claim"),
            Self::Deliver { .. } => write!(f, "Deliver"),
            Self::Fail { failure, .. } => write!(f, "Fail({})", failure.kind),
            Self::Confirm { .. } => write!(f, "Confirm"),
            Self::Exhaust { .. } => write!(f, "Exhaust"),
            Self::Abandon => write!(f, "Abandon"),
        }
    }
}

/// Delivery bookkeeping for one relay event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub event: RelayEvent,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_error: Option<DeliveryFailure>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub target_tx_ref: Option<TargetTxRef>,
    /// Ingestion order assigned by the delivery ledger.
    pub seq: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// A fresh `Pending` record for a newly ingested event.
    pub fn pending(event: RelayEvent, seq: u64) -> Self {
        let updated_at = event.observed_at();
        Self {
            event,
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            target_tx_ref: None,
            seq,
            updated_at,
        }
    }

    pub fn id(&self) -> EventId {
        self.event.id()
    }

    /// `Failed` with a scheduled retry.
    pub fn is_retryable(&self) -> bool {
        self.state == DeliveryState::Failed && self.next_retry_at.is_some()
    }

    /// `Failed` with no retry scheduled; waiting for an operator.
    pub fn is_permanently_failed(&self) -> bool {
        self.state == DeliveryState::Failed && self.next_retry_at.is_none()
    }

    /// Retryable, under the attempt ceiling, and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.attempts < max_attempts
            && self.state == DeliveryState::Failed
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Compute the record that results from applying `change` at `now`.
    ///
    /// Returns [`TypeError::IllegalTransition`] for any edge not listed on
    /// [`StateChange`]. The record itself is left untouched.
    pub fn apply(&self, change: &StateChange, now: DateTime<Utc>) -> Result<Self, TypeError> {
        let illegal = || TypeError::IllegalTransition {
            from: self.state,
            change: change.to_string(),
        };

        let mut next = self.clone();
        next.updated_at = now;

        match (self.state, change) {
            (DeliveryState::Pending, StateChange::Claim { max_attempts }) => {
                if self.attempts >= *max_attempts {
                    return Err(illegal());
                }
                next.state = DeliveryState::InFlight;
                next.attempts += 1;
            }
            (DeliveryState::Failed, StateChange::Claim { max_attempts }) => {
                if !self.is_retryable() || self.attempts >= *max_attempts {
                    return Err(illegal());
                }
                next.state = DeliveryState::InFlight;
                next.attempts += 1;
                next.next_retry_at = None;
            }
            (DeliveryState::InFlight, StateChange::Deliver { tx_ref }) => {
                next.state = DeliveryState::Delivered;
                next.target_tx_ref = Some(tx_ref.clone());
                next.last_error = None;
                next.next_retry_at = None;
            }
            (DeliveryState::InFlight, StateChange::Fail { failure, next_retry_at }) => {
                if next_retry_at.is_some() && !failure.kind.is_retryable() {
                    return Err(illegal());
                }
                next.state = DeliveryState::Failed;
                next.last_error = Some(failure.clone());
                next.next_retry_at = *next_retry_at;
            }
            (DeliveryState::Pending, StateChange::Fail { failure, next_retry_at }) => {
                if failure.kind != FailureKind::MalformedPayload || next_retry_at.is_some() {
                    return Err(illegal());
                }
                next.state = DeliveryState::Failed;
                next.last_error = Some(failure.clone());
                next.next_retry_at = None;
            }
            (DeliveryState::Failed, StateChange::Confirm { tx_ref }) => {
                let ambiguous = self
                    .last_error
                    .as_ref()
                    .is_some_and(|e| e.kind.is_ambiguous());
                if !self.is_retryable() || !ambiguous {
                    return Err(illegal());
                }
                next.state = DeliveryState::Delivered;
                next.target_tx_ref = Some(tx_ref.clone());
                next.last_error = None;
                next.next_retry_at = None;
            }
            (DeliveryState::Failed, StateChange::Exhaust { reason }) => {
                if !self.is_retryable() {
                    return Err(illegal());
                }
                let last = self
                    .last_error
                    .as_ref()
                    .map(|e| format!("; last error: {e}"))
                    .unwrap_or_default();
                next.last_error = Some(DeliveryFailure::new(
                    FailureKind::RetriesExhausted,
                    format!("{reason}{last}"),
                ));
                next.next_retry_at = None;
            }
            (DeliveryState::Failed, StateChange::Abandon) => {
                if !self.is_permanently_failed() {
                    return Err(illegal());
                }
                next.state = DeliveryState::Abandoned;
            }
            _ => return Err(illegal()),
        }

        Ok(next)
    }
}

/// Number of records per delivery state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub delivered: u64,
    /// Failed records with a retry scheduled.
    pub failed_retrying: u64,
    /// Failed records waiting for an operator.
    pub failed_permanent: u64,
    pub abandoned: u64,
}

impl StatusCounts {
    pub fn record(&mut self, record: &DeliveryRecord) {
        match record.state {
            DeliveryState::Pending => self.pending += 1,
            DeliveryState::InFlight => self.in_flight += 1,
            DeliveryState::Delivered => self.delivered += 1,
            DeliveryState::Failed if record.is_retryable() => self.failed_retrying += 1,
            DeliveryState::Failed => self.failed_permanent += 1,
            DeliveryState::Abandoned => self.abandoned += 1,
        }
    }

    pub fn failed(&self) -> u64 {
        self.failed_retrying + self.failed_permanent
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.delivered + self.failed() + self.abandoned
    }
}
