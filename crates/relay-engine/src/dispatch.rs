use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};

use relay_types::{DeliveryRecord, DeliveryState, EventId};

/// Records that still need work: pending, in flight, or awaiting a retry.
pub fn is_active(record: &DeliveryRecord) -> bool {
    matches!(
        record.state,
        DeliveryState::Pending | DeliveryState::InFlight
    ) || record.is_retryable()
}

fn is_runnable(record: &DeliveryRecord, now: DateTime<Utc>, max_attempts: u32) -> bool {
    record.state == DeliveryState::Pending || record.is_due(now, max_attempts)
}

/// Pick the records to hand to workers at `now`.
///
/// `active` must be in ingestion order. Records already `queued` with a
/// worker are skipped. With `ordered_per_key`, only the oldest active
/// record of each source key is eligible, so a later event never
/// overtakes an earlier one for the same key.
pub fn plan_dispatch(
    active: &[DeliveryRecord],
    now: DateTime<Utc>,
    max_attempts: u32,
    ordered_per_key: bool,
    queued: &HashSet<EventId>,
) -> Vec<DeliveryRecord> {
    let mut heads: HashSet<&str> = HashSet::new();
    let mut plan = Vec::new();

    for record in active {
        if ordered_per_key && !heads.insert(record.event.source_record_key()) {
            continue;
        }
        if is_runnable(record, now, max_attempts) && !queued.contains(&record.id()) {
            plan.push(record.clone());
        }
    }
    plan
}

/// Chooses the worker for each job.
#[derive(Debug)]
pub struct Sharder {
    workers: usize,
    by_key: bool,
    next: AtomicUsize,
}

impl Sharder {
    pub fn new(workers: usize, by_key: bool) -> Self {
        Self {
            workers: workers.max(1),
            by_key,
            next: AtomicUsize::new(0),
        }
    }

    /// Same key, same worker when sharding by key; round-robin otherwise.
    pub fn worker_for(&self, key: &str) -> usize {
        if self.by_key {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % self.workers as u64) as usize
        } else {
            self.next.fetch_add(1, Ordering::Relaxed) % self.workers
        }
    }
}
