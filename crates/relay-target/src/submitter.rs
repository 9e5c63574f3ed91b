use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use relay_types::{DeliveryFailure, FailureKind, TargetTxRef};

use crate::args::TransactionArgs;
use crate::error::TargetError;
use crate::target::TargetLedger;

/// Classified result of one submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The target holds the write. `verified` is set when an earlier
    /// ambiguous attempt was found applied and no new write was issued.
    Delivered { tx_ref: TargetTxRef, verified: bool },
    Failed(DeliveryFailure),
}

/// Invokes the target ledger once per call and classifies the outcome.
pub struct Submitter {
    target: Arc<dyn TargetLedger>,
    timeout: Duration,
    verify_ambiguous: bool,
}

impl Submitter {
    pub fn new(target: Arc<dyn TargetLedger>, timeout: Duration, verify_ambiguous: bool) -> Self {
        Self {
            target,
            timeout,
            verify_ambiguous,
        }
    }

    /// Submit `args`. `previous` is the failure recorded by the last attempt,
    /// if any; an ambiguous one triggers a query before writing.
    pub async fn submit(
        &self,
        args: &TransactionArgs,
        previous: Option<&DeliveryFailure>,
    ) -> SubmitOutcome {
        let ambiguous = previous.is_some_and(|f| f.kind.is_ambiguous());
        if self.verify_ambiguous && ambiguous {
            match self.verify(args).await {
                Ok(Some(tx_ref)) => {
                    debug!(key = %args.key, id = %args.event_id, tx_ref = %tx_ref, "earlier write found on target");
                    return SubmitOutcome::Delivered {
                        tx_ref,
                        verified: true,
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %args.key, error = %e, "verification query failed");
                    // Still unknown whether the earlier write landed.
                    return SubmitOutcome::Failed(DeliveryFailure::new(
                        FailureKind::OutcomeUnknown,
                        format!("verification failed: {e}"),
                    ));
                }
            }
        }

        match tokio::time::timeout(self.timeout, self.target.write(args)).await {
            Ok(Ok(tx_ref)) => SubmitOutcome::Delivered {
                tx_ref,
                verified: false,
            },
            Ok(Err(e)) => SubmitOutcome::Failed(e.to_failure()),
            Err(_) => SubmitOutcome::Failed(
                TargetError::Timeout(format!("no answer within {}ms", self.timeout.as_millis()))
                    .to_failure(),
            ),
        }
    }

    /// Look for an earlier write of `args` on the target without writing.
    ///
    /// Returns `None` when verification is off, when the target holds
    /// nothing for this event, or when the query fails.
    pub async fn confirm(&self, args: &TransactionArgs) -> Option<TargetTxRef> {
        if !self.verify_ambiguous {
            return None;
        }
        match self.verify(args).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %args.key, error = %e, "confirmation query failed");
                None
            }
        }
    }

    async fn verify(&self, args: &TransactionArgs) -> Result<Option<TargetTxRef>, TargetError> {
        let receipt = tokio::time::timeout(self.timeout, self.target.query(&args.key))
            .await
            .map_err(|_| TargetError::Timeout("verification query".into()))??;
        Ok(receipt
            .filter(|r| r.event_id == args.event_id)
            .map(|r| r.tx_ref))
    }
}
