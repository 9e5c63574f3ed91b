use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use relay_store::{DeliveryLedger, StoreError};
use relay_target::{SubmitOutcome, Submitter, Translator};
use relay_types::{
    DeliveryFailure, DeliveryRecord, DeliveryState, EventId, StateChange, TargetTxRef,
};

use crate::error::RelayResult;
use crate::scheduler::RetryScheduler;

/// How one delivery job ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered(TargetTxRef),
    /// Attempt failed; the record is `Failed` (retryable or not).
    Failed(DeliveryFailure),
    /// Nothing to do: not runnable, or another writer claimed it first.
    Skipped,
    /// Submission cancelled by shutdown; the record stays `InFlight`.
    Cancelled,
}

/// Counts a job as in progress for the lifetime of the guard.
pub struct InFlightGuard<'a>(&'a watch::Sender<usize>);

impl<'a> InFlightGuard<'a> {
    fn enter(gauge: &'a watch::Sender<usize>) -> Self {
        gauge.send_modify(|n| *n += 1);
        Self(gauge)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Resolves once `signal` turns true. Never resolves if the sender is gone.
pub(crate) async fn signalled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// `now` moved forward by the time elapsed since `since`.
fn advance(now: DateTime<Utc>, since: Instant) -> DateTime<Utc> {
    chrono::Duration::from_std(since.elapsed())
        .ok()
        .and_then(|elapsed| now.checked_add_signed(elapsed))
        .unwrap_or(now)
}

/// Translate, claim, submit and record the outcome for one record.
pub struct DeliveryPipeline {
    ledger: Arc<dyn DeliveryLedger>,
    translator: Arc<dyn Translator>,
    submitter: Submitter,
    scheduler: RetryScheduler,
    in_flight: watch::Sender<usize>,
}

impl DeliveryPipeline {
    pub fn new(
        ledger: Arc<dyn DeliveryLedger>,
        translator: Arc<dyn Translator>,
        submitter: Submitter,
        scheduler: RetryScheduler,
    ) -> Self {
        Self {
            ledger,
            translator,
            submitter,
            scheduler,
            in_flight: watch::Sender::new(0),
        }
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Mark a job as in progress until the guard drops.
    ///
    /// Workers take the guard before checking whether they may run a job,
    /// so a drain that sees zero jobs cannot race a claim.
    pub fn track(&self) -> InFlightGuard<'_> {
        InFlightGuard::enter(&self.in_flight)
    }

    /// Jobs currently holding a [`track`](Self::track) guard.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn watch_in_flight(&self) -> watch::Receiver<usize> {
        self.in_flight.subscribe()
    }

    /// Run one delivery attempt for `id`, starting at `now`.
    ///
    /// Storage faults are returned as errors; every other outcome is
    /// recorded in the delivery ledger and reported as a [`JobOutcome`].
    /// Outcomes are stamped with `now` plus the time the attempt took.
    pub async fn run(
        &self,
        id: &EventId,
        now: DateTime<Utc>,
        cancel: &mut watch::Receiver<bool>,
    ) -> RelayResult<JobOutcome> {
        let started = Instant::now();
        let max_attempts = self.scheduler.max_attempts();
        let Some(record) = self.ledger.get(id)? else {
            return Ok(JobOutcome::Skipped);
        };
        if record.state != DeliveryState::Pending && !record.is_due(now, max_attempts) {
            return Ok(JobOutcome::Skipped);
        }

        let translated = self.translator.translate(&record.event);
        if let (Err(e), DeliveryState::Pending) = (&translated, record.state) {
            // Terminal before any attempt is spent.
            let failure = e.to_failure();
            let change = StateChange::Fail {
                failure: failure.clone(),
                next_retry_at: None,
            };
            return match self.record(id, DeliveryState::Pending, change, now)? {
                Some(_) => {
                    error!(id = %id, key = record.event.source_record_key(), error = %e, "malformed payload");
                    Ok(JobOutcome::Failed(failure))
                }
                None => Ok(JobOutcome::Skipped),
            };
        }

        let claimed = match self.record(id, record.state, StateChange::Claim { max_attempts }, now)? {
            Some(claimed) => claimed,
            None => return Ok(JobOutcome::Skipped),
        };
        debug!(id = %id, key = claimed.event.source_record_key(), attempts = claimed.attempts, "claimed");

        let args = match translated {
            Ok(args) => args,
            Err(e) => {
                let failure = e.to_failure();
                let change = StateChange::Fail {
                    failure: failure.clone(),
                    next_retry_at: None,
                };
                self.record(id, DeliveryState::InFlight, change, now)?;
                error!(id = %id, error = %e, "malformed payload on retry");
                return Ok(JobOutcome::Failed(failure));
            }
        };

        let outcome = tokio::select! {
            outcome = self.submitter.submit(&args, claimed.last_error.as_ref()) => outcome,
            _ = signalled(cancel) => {
                warn!(id = %id, "submission cancelled, record left in flight");
                return Ok(JobOutcome::Cancelled);
            }
        };
        let observed = advance(now, started);

        match outcome {
            SubmitOutcome::Delivered { tx_ref, verified } => {
                let change = StateChange::Deliver {
                    tx_ref: tx_ref.clone(),
                };
                self.record(id, DeliveryState::InFlight, change, observed)?;
                debug!(id = %id, tx_ref = %tx_ref, verified, attempts = claimed.attempts, "delivered");
                Ok(JobOutcome::Delivered(tx_ref))
            }
            SubmitOutcome::Failed(failure) => {
                let change = self
                    .scheduler
                    .failure_change(failure.clone(), claimed.attempts, observed);
                let Some(failed) = self.record(id, DeliveryState::InFlight, change, observed)? else {
                    return Ok(JobOutcome::Failed(failure));
                };
                if !failure.kind.is_retryable() {
                    error!(id = %id, attempts = failed.attempts, error = %failure, "delivery failed permanently");
                    return Ok(JobOutcome::Failed(failure));
                }
                warn!(
                    id = %id,
                    attempts = failed.attempts,
                    next_retry_at = ?failed.next_retry_at,
                    error = %failure,
                    "delivery attempt failed"
                );
                if let Some(confirmed) = self.confirm_if_spent(&failed, advance(now, started)).await? {
                    if let Some(tx_ref) = confirmed.target_tx_ref {
                        return Ok(JobOutcome::Delivered(tx_ref));
                    }
                }
                self.scheduler.exhaust_if_spent(&failed, advance(now, started))?;
                Ok(JobOutcome::Failed(failure))
            }
        }
    }

    /// A spent record whose last attempt had no known outcome may already
    /// be applied on the target. Query once, without writing or spending an
    /// attempt, and record it delivered if the write is there.
    pub async fn confirm_if_spent(
        &self,
        record: &DeliveryRecord,
        now: DateTime<Utc>,
    ) -> RelayResult<Option<DeliveryRecord>> {
        let ambiguous = record
            .last_error
            .as_ref()
            .is_some_and(|e| e.kind.is_ambiguous());
        if !ambiguous
            || !record.is_retryable()
            || record.attempts < self.scheduler.max_attempts()
        {
            return Ok(None);
        }
        let Ok(args) = self.translator.translate(&record.event) else {
            return Ok(None);
        };
        let Some(tx_ref) = self.submitter.confirm(&args).await else {
            return Ok(None);
        };

        let change = StateChange::Confirm {
            tx_ref: tx_ref.clone(),
        };
        let confirmed = self.record(&record.id(), DeliveryState::Failed, change, now)?;
        if confirmed.is_some() {
            info!(
                id = %record.id(),
                key = record.event.source_record_key(),
                tx_ref = %tx_ref,
                "write found on target after last attempt"
            );
        }
        Ok(confirmed)
    }

    /// Run [`confirm_if_spent`](Self::confirm_if_spent) over every spent
    /// record. Returns the ids recorded delivered.
    pub async fn confirm_spent(&self, now: DateTime<Utc>) -> RelayResult<Vec<EventId>> {
        let mut confirmed = Vec::new();
        for record in self.ledger.list_exhausted(self.scheduler.max_attempts())? {
            if self.confirm_if_spent(&record, now).await?.is_some() {
                confirmed.push(record.id());
            }
        }
        Ok(confirmed)
    }

    /// Apply a change, treating a lost race as `None`.
    fn record(
        &self,
        id: &EventId,
        expected: DeliveryState,
        change: StateChange,
        now: DateTime<Utc>,
    ) -> RelayResult<Option<DeliveryRecord>> {
        match self.ledger.transition(id, expected, change, now) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::StateConflict { actual, .. }) => {
                debug!(id = %id, %expected, %actual, "state conflict, skipping");
                Ok(None)
            }
            Err(StoreError::IllegalTransition(e)) => {
                debug!(id = %id, error = %e, "transition no longer legal, skipping");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
