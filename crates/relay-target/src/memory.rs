use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use relay_types::TargetTxRef;

use crate::args::{TargetReceipt, TransactionArgs};
use crate::error::{TargetError, TargetResult};
use crate::target::TargetLedger;

#[derive(Default)]
struct TargetState {
    records: BTreeMap<String, (TransactionArgs, TargetTxRef)>,
    rejections: HashMap<String, String>,
    /// Writes that commit but then report a timeout.
    lost_acks: u32,
}

/// Upsert map standing in for a target ledger.
///
/// Fault switches: [`set_available`](Self::set_available) makes every call
/// fail as unavailable, [`reject_key`](Self::reject_key) scripts a business
/// rejection, [`lose_next_acks`](Self::lose_next_acks) commits writes but
/// reports a timeout, and [`set_write_delay`](Self::set_write_delay) slows
/// writes down.
#[derive(Default)]
pub struct InMemoryTargetLedger {
    state: Mutex<TargetState>,
    unavailable: AtomicBool,
    write_delay_ms: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryTargetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> TargetResult<std::sync::MutexGuard<'_, TargetState>> {
        self.state
            .lock()
            .map_err(|_| TargetError::Transport("target state lock poisoned".into()))
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    pub fn reject_key(&self, key: impl Into<String>, reason: impl Into<String>) {
        if let Ok(mut state) = self.lock() {
            state.rejections.insert(key.into(), reason.into());
        }
    }

    pub fn clear_rejection(&self, key: &str) {
        if let Ok(mut state) = self.lock() {
            state.rejections.remove(key);
        }
    }

    pub fn lose_next_acks(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.lost_acks = count;
        }
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Writes that reached the state map.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Last arguments applied for `key`.
    pub fn record(&self, key: &str) -> Option<TransactionArgs> {
        self.lock()
            .ok()
            .and_then(|state| state.records.get(key).map(|(args, _)| args.clone()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TargetLedger for InMemoryTargetLedger {
    async fn write(&self, args: &TransactionArgs) -> TargetResult<TargetTxRef> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.is_available() {
            return Err(TargetError::Unavailable("target ledger offline".into()));
        }

        let mut state = self.lock()?;
        if let Some(reason) = state.rejections.get(&args.key) {
            return Err(TargetError::Rejected {
                key: args.key.clone(),
                reason: reason.clone(),
            });
        }

        let tx_ref = TargetTxRef(format!("tx-{}", Uuid::now_v7()));
        state
            .records
            .insert(args.key.clone(), (args.clone(), tx_ref.clone()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(key = %args.key, function = %args.function, tx_ref = %tx_ref, "target write applied");

        if state.lost_acks > 0 {
            state.lost_acks -= 1;
            return Err(TargetError::Timeout("acknowledgement lost".into()));
        }
        Ok(tx_ref)
    }

    async fn query(&self, key: &str) -> TargetResult<Option<TargetReceipt>> {
        if !self.is_available() {
            return Err(TargetError::Unavailable("target ledger offline".into()));
        }
        let state = self.lock()?;
        Ok(state.records.get(key).map(|(args, tx_ref)| TargetReceipt {
            key: key.to_string(),
            tx_ref: tx_ref.clone(),
            event_id: args.event_id,
        }))
    }
}
