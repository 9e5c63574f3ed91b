use async_trait::async_trait;

use relay_types::TargetTxRef;

use crate::args::{TargetReceipt, TransactionArgs};
use crate::error::TargetResult;

/// Transaction API of the target ledger.
///
/// Writes must be upserts keyed by [`TransactionArgs::key`]: applying the
/// same arguments twice leaves the target in the same state.
#[async_trait]
pub trait TargetLedger: Send + Sync {
    async fn write(&self, args: &TransactionArgs) -> TargetResult<TargetTxRef>;

    /// Latest relayed write for `key`, if any.
    async fn query(&self, key: &str) -> TargetResult<Option<TargetReceipt>>;
}
