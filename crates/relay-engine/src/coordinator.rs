use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relay_source::{EventSource, SourceError, SubscriptionFilter};
use relay_store::{DeliveryLedger, StoreError};
use relay_target::{Submitter, TargetLedger, Translator};
use relay_types::{DeliveryFailure, DeliveryRecord, DeliveryState, EventId, FailureKind, StateChange};

use crate::backoff::BackoffPolicy;
use crate::config::RelayConfig;
use crate::dispatch::{is_active, plan_dispatch, Sharder};
use crate::error::{RelayError, RelayResult};
use crate::ingest::{IngestOutcome, Ingestor};
use crate::pipeline::{signalled, DeliveryPipeline, JobOutcome};
use crate::scheduler::RetryScheduler;
use crate::status::{
    abandon_record, failure_summaries, DrainReport, Lifecycle, RecoveryReport, RelayStatus,
};

/// State shared between the coordinator handle and its tasks.
struct Shared {
    config: RelayConfig,
    ledger: Arc<dyn DeliveryLedger>,
    source: Arc<dyn EventSource>,
    ingestor: Ingestor,
    pipeline: DeliveryPipeline,
    sharder: Sharder,
    lifecycle: watch::Sender<Lifecycle>,
    paused: AtomicBool,
    halt_reason: Mutex<Option<String>>,
    /// Ids handed to a worker and not yet finished.
    queued: Mutex<HashSet<EventId>>,
    /// Stops the ingest, dispatch, retention and worker loops.
    stop: watch::Sender<bool>,
    /// Aborts submissions still waiting on the target.
    cancel: watch::Sender<bool>,
    wake: Notify,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    fn accepting_work(&self) -> bool {
        self.lifecycle() == Lifecycle::Running && !self.paused.load(Ordering::SeqCst)
    }

    fn halt(&self, reason: String) {
        error!(reason = %reason, "storage fault, relay halted");
        relock(&self.halt_reason).get_or_insert(reason);
        self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Stopped || *state == Lifecycle::Halted {
                false
            } else {
                *state = Lifecycle::Halted;
                true
            }
        });
        self.stop.send_replace(true);
        self.cancel.send_replace(true);
    }

    fn subscription_filter(&self) -> SubscriptionFilter {
        if self.config.event_types.is_empty() {
            SubscriptionFilter::all()
        } else {
            SubscriptionFilter::event_types(self.config.event_types.clone())
        }
    }

    /// Records eligible for dispatch at `now`, in ingestion order.
    async fn plan(&self, now: DateTime<Utc>) -> RelayResult<Vec<DeliveryRecord>> {
        self.pipeline.confirm_spent(now).await?;
        let scheduler = self.pipeline.scheduler();
        let candidates = if self.config.ordered_per_key {
            scheduler.exhaust_spent(now)?;
            self.ledger.scan(&is_active)?
        } else {
            let report = scheduler.scan_once(now)?;
            let mut candidates = self.ledger.list_pending()?;
            candidates.extend(report.due);
            candidates.sort_by_key(|r| r.seq);
            candidates
        };
        let queued = relock(&self.queued);
        Ok(plan_dispatch(
            &candidates,
            now,
            self.config.max_attempts,
            self.config.ordered_per_key,
            &queued,
        ))
    }

    async fn dispatch_once(
        &self,
        now: DateTime<Utc>,
        workers: &[mpsc::UnboundedSender<EventId>],
    ) -> RelayResult<usize> {
        let mut sent = 0;
        for record in self.plan(now).await? {
            let id = record.id();
            if !relock(&self.queued).insert(id) {
                continue;
            }
            let worker = self.sharder.worker_for(record.event.source_record_key());
            if workers[worker].send(id).is_ok() {
                sent += 1;
            } else {
                relock(&self.queued).remove(&id);
            }
        }
        if sent > 0 {
            debug!(sent, "jobs dispatched");
        }
        Ok(sent)
    }
}

/// Orchestrates ingestion, dispatch, retries and retention for one relay.
///
/// A coordinator is created in [`Lifecycle::Created`], started once with
/// [`start`](Self::start), and ends in `Stopped` after [`drain`](Self::drain)
/// or [`shutdown`](Self::shutdown), or in `Halted` after a storage fault.
/// It is not restartable; build a new one over the same delivery ledger to
/// resume.
pub struct RelayCoordinator {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RelayCoordinator {
    pub fn new(
        config: RelayConfig,
        ledger: Arc<dyn DeliveryLedger>,
        source: Arc<dyn EventSource>,
        translator: Arc<dyn Translator>,
        target: Arc<dyn TargetLedger>,
    ) -> RelayResult<Self> {
        config.validate()?;

        let scheduler = RetryScheduler::new(
            ledger.clone(),
            BackoffPolicy::from_config(&config),
            config.max_attempts,
        );
        let submitter = Submitter::new(target, config.submit_timeout(), config.verify_ambiguous);
        let pipeline = DeliveryPipeline::new(ledger.clone(), translator, submitter, scheduler);

        let shared = Shared {
            ingestor: Ingestor::new(ledger.clone(), source.clone()),
            sharder: Sharder::new(config.workers, config.ordered_per_key),
            config,
            ledger,
            source,
            pipeline,
            lifecycle: watch::Sender::new(Lifecycle::Created),
            paused: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            queued: Mutex::new(HashSet::new()),
            stop: watch::Sender::new(false),
            cancel: watch::Sender::new(false),
            wake: Notify::new(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn ledger(&self) -> &Arc<dyn DeliveryLedger> {
        &self.shared.ledger
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    /// Observe lifecycle changes, e.g. to exit the process on `Halted`.
    pub fn watch_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.shared.lifecycle.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn halt_reason(&self) -> Option<String> {
        relock(&self.shared.halt_reason).clone()
    }

    /// Recover, then spawn the ingest, dispatch, worker and retention tasks.
    pub async fn start(&self) -> RelayResult<RecoveryReport> {
        let mut started = false;
        self.shared.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Created {
                *state = Lifecycle::Running;
                started = true;
            }
            started
        });
        if !started {
            return Err(RelayError::AlreadyStarted);
        }

        let report = match self.recover(Utc::now()).await {
            Ok(report) => report,
            Err(e) => {
                if e.is_fatal() {
                    self.shared.halt(e.to_string());
                }
                return Err(e);
            }
        };

        let mut tasks = self.tasks.lock().await;
        let mut workers = Vec::with_capacity(self.shared.config.workers);
        for index in 0..self.shared.config.workers {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(tx);
            tasks.push(tokio::spawn(worker_loop(self.shared.clone(), index, rx)));
        }
        tasks.push(tokio::spawn(dispatch_loop(self.shared.clone(), workers)));
        tasks.push(tokio::spawn(ingest_loop(self.shared.clone())));
        if !self.shared.config.retention.is_keep_all() {
            tasks.push(tokio::spawn(retention_loop(self.shared.clone())));
        }

        info!(
            workers = self.shared.config.workers,
            ordered_per_key = self.shared.config.ordered_per_key,
            pending = report.pending,
            recovered = report.recovered_in_flight.len(),
            confirmed = report.confirmed.len(),
            exhausted = report.exhausted.len(),
            "relay started"
        );
        Ok(report)
    }

    /// Turn every `InFlight` record into an unknown-outcome failure that is
    /// due at `now`. Records with no attempts left are checked against the
    /// target first and exhausted only if their write is not there.
    pub async fn recover(&self, now: DateTime<Utc>) -> RelayResult<RecoveryReport> {
        let ledger = &self.shared.ledger;
        let mut report = RecoveryReport::default();

        for record in ledger.list_in_flight()? {
            let change = StateChange::Fail {
                failure: DeliveryFailure::new(
                    FailureKind::OutcomeUnknown,
                    "attempt interrupted by restart",
                ),
                next_retry_at: Some(now),
            };
            match ledger.transition(&record.id(), DeliveryState::InFlight, change, now) {
                Ok(_) => {
                    warn!(
                        id = %record.id(),
                        key = record.event.source_record_key(),
                        attempts = record.attempts,
                        "in-flight record recovered with unknown outcome"
                    );
                    report.recovered_in_flight.push(record.id());
                }
                Err(StoreError::StateConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        report.confirmed = self.shared.pipeline.confirm_spent(now).await?;
        report.exhausted = self.shared.pipeline.scheduler().exhaust_spent(now)?;
        report.pending = ledger.list_pending()?.len();
        Ok(report)
    }

    fn ensure_running(&self) -> RelayResult<()> {
        match self.lifecycle() {
            Lifecycle::Running => Ok(()),
            Lifecycle::Halted => Err(RelayError::Halted(
                self.halt_reason().unwrap_or_else(|| "storage fault".into()),
            )),
            _ => Err(RelayError::NotRunning),
        }
    }

    /// Stop dispatching new work. Ingestion and in-flight submissions go on.
    pub fn pause(&self) -> RelayResult<()> {
        self.ensure_running()?;
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("relay paused");
        }
        Ok(())
    }

    pub fn resume(&self) -> RelayResult<()> {
        self.ensure_running()?;
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("relay resumed");
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Stop dispatch, wait up to `timeout` for in-flight submissions, then
    /// cancel whatever is left and stop every task.
    pub async fn drain(&self, timeout: Duration) -> RelayResult<DrainReport> {
        let current = self.lifecycle();
        match current {
            Lifecycle::Running => {
                self.shared.lifecycle.send_replace(Lifecycle::Draining);
                info!(timeout_ms = timeout.as_millis() as u64, "draining relay");
            }
            Lifecycle::Halted => {}
            Lifecycle::Created => {
                self.shared.lifecycle.send_replace(Lifecycle::Stopped);
                return Ok(DrainReport {
                    drained: true,
                    cancelled: 0,
                    counts: self.shared.ledger.counts()?,
                });
            }
            Lifecycle::Draining | Lifecycle::Stopped => return Err(RelayError::NotRunning),
        }

        let mut in_flight = self.shared.pipeline.watch_in_flight();
        let drained = matches!(
            tokio::time::timeout(timeout, in_flight.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        let cancelled = if drained { 0 } else { self.shared.pipeline.in_flight() };

        self.shared.cancel.send_replace(true);
        self.shared.stop.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "relay task ended abnormally");
            }
        }

        if current != Lifecycle::Halted {
            self.shared.lifecycle.send_replace(Lifecycle::Stopped);
        }
        info!(drained, cancelled, "relay stopped");

        Ok(DrainReport {
            drained,
            cancelled,
            counts: self.shared.ledger.counts()?,
        })
    }

    /// [`drain`](Self::drain) with the configured shutdown grace period.
    pub async fn shutdown(&self) -> RelayResult<DrainReport> {
        self.drain(self.shared.config.shutdown_grace()).await
    }

    pub fn status(&self) -> RelayResult<RelayStatus> {
        Ok(RelayStatus {
            lifecycle: self.lifecycle(),
            paused: self.is_paused(),
            counts: self.shared.ledger.counts()?,
            in_flight_workers: self.shared.pipeline.in_flight(),
            failures: failure_summaries(self.shared.ledger.as_ref())?,
            halt_reason: self.halt_reason(),
        })
    }

    /// Operator action on a permanently failed record.
    pub fn abandon(&self, id: &EventId) -> RelayResult<DeliveryRecord> {
        abandon_record(self.shared.ledger.as_ref(), id, Utc::now())
    }

    /// Purge expired terminal records now.
    pub fn run_retention(&self, now: DateTime<Utc>) -> RelayResult<Vec<EventId>> {
        let removed = self.shared.ledger.purge(&self.shared.config.retention, now)?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "retention purged records");
        }
        Ok(removed)
    }
}

impl Drop for RelayCoordinator {
    fn drop(&mut self) {
        self.shared.stop.send_replace(true);
        self.shared.cancel.send_replace(true);
    }
}

/// Sleep for `period` unless `stop` fires first. Returns `false` on stop.
async fn pause_or_stop(period: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = signalled(stop) => false,
    }
}

async fn ingest_loop(shared: Arc<Shared>) {
    let mut stop = shared.stop.subscribe();
    let filter = shared.subscription_filter();

    'subscribe: loop {
        let mut stream = match shared.source.subscribe(&filter).await {
            Ok(stream) => stream,
            Err(SourceError::Shutdown) => {
                info!("source shut down, ingestion stopped");
                break;
            }
            Err(e) => {
                warn!(error = %e, "subscription failed, retrying");
                if pause_or_stop(shared.config.poll_interval(), &mut stop).await {
                    continue;
                }
                break;
            }
        };

        loop {
            let next = tokio::select! {
                _ = signalled(&mut stop) => break 'subscribe,
                next = stream.recv() => next,
            };
            let Some(notification) = next else {
                warn!("source stream ended, resubscribing");
                if pause_or_stop(shared.config.poll_interval(), &mut stop).await {
                    continue 'subscribe;
                }
                break 'subscribe;
            };

            match shared.ingestor.ingest(&notification, Utc::now()).await {
                Ok(IngestOutcome::Accepted(_)) => shared.wake.notify_one(),
                Ok(IngestOutcome::Duplicate(_)) => {}
                Err(e) if e.is_fatal() => {
                    shared.halt(e.to_string());
                    break 'subscribe;
                }
                Err(e) => warn!(error = %e, tx_id = %notification.tx_id, "ingest failed"),
            }
        }
    }
    debug!("ingest loop exited");
}

async fn dispatch_loop(shared: Arc<Shared>, workers: Vec<mpsc::UnboundedSender<EventId>>) {
    let mut stop = shared.stop.subscribe();
    let mut tick = tokio::time::interval(shared.config.poll_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = signalled(&mut stop) => break,
            _ = tick.tick() => {}
            _ = shared.wake.notified() => {}
        }
        if !shared.accepting_work() {
            continue;
        }
        if let Err(e) = shared.dispatch_once(Utc::now(), &workers).await {
            if e.is_fatal() {
                shared.halt(e.to_string());
                break;
            }
            warn!(error = %e, "dispatch pass failed");
        }
    }
    debug!("dispatch loop exited");
}

async fn worker_loop(shared: Arc<Shared>, index: usize, mut jobs: mpsc::UnboundedReceiver<EventId>) {
    let mut stop = shared.stop.subscribe();
    let mut cancel = shared.cancel.subscribe();

    loop {
        let id = tokio::select! {
            _ = signalled(&mut stop) => break,
            job = jobs.recv() => match job {
                Some(id) => id,
                None => break,
            },
        };

        let busy = shared.pipeline.track();
        if shared.accepting_work() {
            match shared.pipeline.run(&id, Utc::now(), &mut cancel).await {
                Ok(JobOutcome::Skipped) => {}
                Ok(outcome) => debug!(worker = index, id = %id, ?outcome, "job finished"),
                Err(e) if e.is_fatal() => {
                    shared.halt(e.to_string());
                    relock(&shared.queued).remove(&id);
                    break;
                }
                Err(e) => warn!(worker = index, id = %id, error = %e, "job failed"),
            }
        }
        drop(busy);
        relock(&shared.queued).remove(&id);
        shared.wake.notify_one();
    }
    debug!(worker = index, "worker exited");
}

async fn retention_loop(shared: Arc<Shared>) {
    let mut stop = shared.stop.subscribe();
    while pause_or_stop(shared.config.retention_interval(), &mut stop).await {
        match shared.ledger.purge(&shared.config.retention, Utc::now()) {
            Ok(removed) if !removed.is_empty() => {
                info!(removed = removed.len(), "retention purged records");
            }
            Ok(_) => {}
            Err(e) if e.is_storage_fault() => {
                shared.halt(e.to_string());
                break;
            }
            Err(e) => warn!(error = %e, "retention pass failed"),
        }
    }
    debug!("retention loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_source::{ChannelEventSource, RawNotification};
    use relay_store::{InMemoryDeliveryLedger, RetentionPolicy, WalConfig, WalDeliveryLedger};
    use relay_target::{FieldMappingTranslator, InMemoryTargetLedger};

    const TOYOTA: &[u8] =
        br#"{"make":"Toyota","model":"Prius","colour":"blue","owner":"Tomoko"}"#;

    fn fast_config() -> RelayConfig {
        RelayConfig {
            workers: 2,
            base_backoff_ms: 20,
            max_backoff_ms: 200,
            poll_interval_ms: 10,
            submit_timeout_ms: 500,
            shutdown_grace_ms: 100,
            ..RelayConfig::default()
        }
    }

    fn car(tx: &str, key: &str, payload: &[u8]) -> RawNotification {
        RawNotification::new(tx, "CarCreated", 0, key, payload.to_vec())
    }

    fn owner_update(tx: &str, key: &str, owner: &str) -> RawNotification {
        let payload = format!(
            r#"{{"make":"Toyota","model":"Prius","colour":"blue","owner":"{owner}"}}"#
        );
        RawNotification::new(tx, "CarUpdated", 0, key, payload.into_bytes())
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    struct Harness {
        ledger: Arc<dyn DeliveryLedger>,
        source: Arc<ChannelEventSource>,
        target: Arc<InMemoryTargetLedger>,
        relay: RelayCoordinator,
    }

    impl Harness {
        fn with_ledger(config: RelayConfig, ledger: Arc<dyn DeliveryLedger>) -> Self {
            let source = Arc::new(ChannelEventSource::new());
            let target = Arc::new(InMemoryTargetLedger::new());
            let relay = RelayCoordinator::new(
                config,
                ledger.clone(),
                source.clone(),
                Arc::new(FieldMappingTranslator::car_registry()),
                target.clone(),
            )
            .unwrap();
            Self {
                ledger,
                source,
                target,
                relay,
            }
        }

        fn new(config: RelayConfig) -> Self {
            Self::with_ledger(config, Arc::new(InMemoryDeliveryLedger::new()))
        }

        fn record(&self, notification: &RawNotification) -> Option<DeliveryRecord> {
            let id = EventId::derive(&notification.identity());
            self.ledger.get(&id).unwrap()
        }

        fn state_of(&self, notification: &RawNotification) -> Option<DeliveryState> {
            self.record(notification).map(|r| r.state)
        }
    }

    #[tokio::test]
    async fn delivers_published_events() {
        let h = Harness::new(fast_config());
        h.relay.start().await.unwrap();

        let n = car("tx-1", "CAR10", TOYOTA);
        h.source.publish(n.clone()).unwrap();
        eventually("delivery", || h.state_of(&n) == Some(DeliveryState::Delivered)).await;

        let record = h.record(&n).unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.target_tx_ref.is_some());
        assert_eq!(h.target.write_count(), 1);
        assert_eq!(h.source.unacked_count(), 0);
        assert_eq!(h.target.record("CAR10").unwrap().function, "createCar");

        let report = h.relay.shutdown().await.unwrap();
        assert!(report.drained);
        assert_eq!(report.counts.delivered, 1);
        assert_eq!(h.relay.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn duplicate_notifications_write_once() {
        let h = Harness::new(fast_config());
        h.relay.start().await.unwrap();

        let n = car("tx-1", "CAR10", TOYOTA);
        h.source.publish(n.clone()).unwrap();
        h.source.publish(n.clone()).unwrap();
        eventually("delivery", || h.state_of(&n) == Some(DeliveryState::Delivered)).await;

        // Redelivered after delivery: discarded, no second write.
        h.source.publish(n.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.target.write_count(), 1);
        assert_eq!(h.ledger.counts().unwrap().total(), 1);
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn target_outage_then_recovery() {
        let config = RelayConfig {
            base_backoff_ms: 200,
            max_backoff_ms: 2_000,
            ..fast_config()
        };
        let h = Harness::new(config);
        h.target.set_available(false);
        h.relay.start().await.unwrap();

        let n = car("tx-1", "CAR10", TOYOTA);
        h.source.publish(n.clone()).unwrap();
        eventually("first failure", || h.state_of(&n) == Some(DeliveryState::Failed)).await;

        let failed = h.record(&n).unwrap();
        assert_eq!(failed.attempts, 1);
        assert!(failed.next_retry_at.is_some());
        assert_eq!(failed.last_error.unwrap().kind, FailureKind::TargetTransient);

        h.target.set_available(true);
        eventually("delivery", || h.state_of(&n) == Some(DeliveryState::Delivered)).await;
        let delivered = h.record(&n).unwrap();
        assert_eq!(delivered.attempts, 2);
        assert!(delivered.target_tx_ref.is_some());
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_surfaces_in_status() {
        let h = Harness::new(fast_config());
        h.relay.start().await.unwrap();

        let n = car("tx-1", "CAR10", br#"{"make":"Toyota","model":"Prius","owner":"Tomoko"}"#);
        h.source.publish(n.clone()).unwrap();
        eventually("failure", || h.state_of(&n) == Some(DeliveryState::Failed)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = h.relay.status().unwrap();
        assert_eq!(status.counts.failed_permanent, 1);
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].attempts, 0);
        assert_eq!(
            status.failures[0].error.as_ref().unwrap().kind,
            FailureKind::MalformedPayload
        );
        assert_eq!(h.target.write_count(), 0);
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pause_holds_dispatch_but_not_ingestion() {
        let h = Harness::new(fast_config());
        h.relay.start().await.unwrap();
        h.relay.pause().unwrap();
        assert!(h.relay.status().unwrap().paused);

        let n = car("tx-1", "CAR10", TOYOTA);
        h.source.publish(n.clone()).unwrap();
        eventually("ingestion", || h.state_of(&n) == Some(DeliveryState::Pending)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.state_of(&n), Some(DeliveryState::Pending));
        assert_eq!(h.target.write_count(), 0);

        h.relay.resume().unwrap();
        eventually("delivery", || h.state_of(&n) == Some(DeliveryState::Delivered)).await;
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_work() {
        let h = Harness::new(fast_config());
        h.target.set_write_delay(Duration::from_millis(100));
        h.relay.start().await.unwrap();

        let n = car("tx-1", "CAR10", TOYOTA);
        h.source.publish(n.clone()).unwrap();
        eventually("submission", || h.relay.status().unwrap().in_flight_workers == 1).await;

        let report = h.relay.drain(Duration::from_secs(2)).await.unwrap();
        assert!(report.drained);
        assert_eq!(report.cancelled, 0);
        assert_eq!(report.counts.delivered, 1);
        assert!(matches!(h.relay.pause(), Err(RelayError::NotRunning)));
    }

    #[tokio::test]
    async fn shutdown_cancels_slow_submission() {
        let config = RelayConfig {
            shutdown_grace_ms: 30,
            submit_timeout_ms: 10_000,
            ..fast_config()
        };
        let h = Harness::new(config);
        h.target.set_write_delay(Duration::from_secs(5));
        h.relay.start().await.unwrap();

        let n = car("tx-1", "CAR10", TOYOTA);
        h.source.publish(n.clone()).unwrap();
        eventually("submission", || h.relay.status().unwrap().in_flight_workers == 1).await;

        let report = h.relay.shutdown().await.unwrap();
        assert!(!report.drained);
        assert_eq!(report.cancelled, 1);
        assert_eq!(h.state_of(&n), Some(DeliveryState::InFlight));
    }

    #[tokio::test]
    async fn restart_recovers_in_flight_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.wal");
        let n = car("tx-1", "CAR10", TOYOTA);

        {
            let ledger = WalDeliveryLedger::open(&path, WalConfig::default()).unwrap();
            let event = crate::ingest::normalize(&n, Utc::now());
            let id = ledger.put_if_absent(event).unwrap().record().id();
            ledger
                .transition(&id, DeliveryState::Pending, StateChange::Claim { max_attempts: 8 }, Utc::now())
                .unwrap();
        }

        let ledger = Arc::new(WalDeliveryLedger::open(&path, WalConfig::default()).unwrap());
        let h = Harness::with_ledger(fast_config(), ledger);
        let report = h.relay.start().await.unwrap();
        assert_eq!(report.recovered_in_flight.len(), 1);

        eventually("delivery", || h.state_of(&n) == Some(DeliveryState::Delivered)).await;
        assert_eq!(h.record(&n).unwrap().attempts, 2);
        assert_eq!(h.target.write_count(), 1);
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_at_attempt_ceiling_checks_target_before_exhausting() {
        let config = RelayConfig {
            max_attempts: 1,
            ..fast_config()
        };
        let ledger: Arc<dyn DeliveryLedger> = Arc::new(InMemoryDeliveryLedger::new());
        let landed = car("tx-1", "CAR10", TOYOTA);
        let lost = car("tx-2", "CAR11", TOYOTA);
        for n in [&landed, &lost] {
            let event = crate::ingest::normalize(n, Utc::now());
            let id = ledger.put_if_absent(event).unwrap().record().id();
            ledger
                .transition(&id, DeliveryState::Pending, StateChange::Claim { max_attempts: 1 }, Utc::now())
                .unwrap();
        }

        let h = Harness::with_ledger(config, ledger);
        let event = h.record(&landed).unwrap().event;
        let args = FieldMappingTranslator::car_registry().translate(&event).unwrap();
        let committed = h.target.write(&args).await.unwrap();

        let report = h.relay.start().await.unwrap();
        assert_eq!(report.recovered_in_flight.len(), 2);
        assert_eq!(report.confirmed, vec![event.id()]);
        assert_eq!(report.exhausted, vec![EventId::derive(&lost.identity())]);

        let record = h.record(&landed).unwrap();
        assert_eq!(record.state, DeliveryState::Delivered);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.target_tx_ref, Some(committed));
        assert!(h.record(&lost).unwrap().is_permanently_failed());
        assert_eq!(h.target.write_count(), 1);
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn drain_counts_jobs_not_yet_claimed() {
        let h = Harness::new(fast_config());
        h.relay.start().await.unwrap();

        // A worker that picked up a job and has not claimed it yet.
        let picked_up = h.relay.shared.pipeline.track();
        let report = h.relay.drain(Duration::from_millis(30)).await.unwrap();
        assert!(!report.drained);
        assert_eq!(report.cancelled, 1);
        drop(picked_up);
    }

    #[tokio::test]
    async fn restart_after_unacknowledged_commit_does_not_rewrite() {
        let ledger: Arc<dyn DeliveryLedger> = Arc::new(InMemoryDeliveryLedger::new());
        let n = car("tx-1", "CAR10", TOYOTA);
        let event = crate::ingest::normalize(&n, Utc::now());
        let id = ledger.put_if_absent(event.clone()).unwrap().record().id();
        ledger
            .transition(&id, DeliveryState::Pending, StateChange::Claim { max_attempts: 8 }, Utc::now())
            .unwrap();

        let h = Harness::with_ledger(fast_config(), ledger);
        // The previous process committed the write but died before recording it.
        let args = FieldMappingTranslator::car_registry().translate(&event).unwrap();
        let committed = h.target.write(&args).await.unwrap();

        h.relay.start().await.unwrap();
        eventually("delivery", || h.state_of(&n) == Some(DeliveryState::Delivered)).await;
        assert_eq!(h.target.write_count(), 1);
        assert_eq!(h.record(&n).unwrap().target_tx_ref, Some(committed));
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn storage_fault_halts_relay() {
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let h = Harness::with_ledger(fast_config(), ledger.clone());
        let mut lifecycle = h.relay.watch_lifecycle();
        h.relay.start().await.unwrap();

        ledger.set_unavailable(true);
        h.source.publish(car("tx-1", "CAR10", TOYOTA)).unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            lifecycle.wait_for(|l| *l == Lifecycle::Halted),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(h.relay.halt_reason().unwrap().contains("storage unavailable"));
        assert_eq!(h.source.unacked_count(), 1);
        assert!(matches!(h.relay.pause(), Err(RelayError::Halted(_))));
        assert!(h.relay.pause().unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn rejected_record_can_be_abandoned() {
        let h = Harness::new(fast_config());
        h.target.reject_key("CAR10", "unknown owner");
        h.relay.start().await.unwrap();

        let n = car("tx-1", "CAR10", TOYOTA);
        h.source.publish(n.clone()).unwrap();
        eventually("failure", || {
            h.record(&n).is_some_and(|r| r.is_permanently_failed())
        })
        .await;

        let id = EventId::derive(&n.identity());
        let abandoned = h.relay.abandon(&id).unwrap();
        assert_eq!(abandoned.state, DeliveryState::Abandoned);
        assert!(h.relay.status().unwrap().failures.is_empty());
        assert!(matches!(
            h.relay.abandon(&id),
            Err(RelayError::NotAbandonable { .. })
        ));
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ordered_keys_hold_later_events() {
        let config = RelayConfig {
            ordered_per_key: true,
            base_backoff_ms: 50,
            max_backoff_ms: 100,
            max_attempts: 50,
            ..fast_config()
        };
        let h = Harness::new(config);
        h.target.set_available(false);
        h.relay.start().await.unwrap();

        let first = owner_update("tx-1", "CAR1", "Alice");
        let second = owner_update("tx-2", "CAR1", "Bob");
        h.source.publish(first.clone()).unwrap();
        eventually("first failure", || h.state_of(&first) == Some(DeliveryState::Failed)).await;

        h.source.publish(second.clone()).unwrap();
        eventually("ingestion", || h.state_of(&second).is_some()).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.state_of(&second), Some(DeliveryState::Pending));

        h.target.set_available(true);
        eventually("both delivered", || {
            h.state_of(&first) == Some(DeliveryState::Delivered)
                && h.state_of(&second) == Some(DeliveryState::Delivered)
        })
        .await;
        assert_eq!(h.target.record("CAR1").unwrap().args[3], "Bob");
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn retention_purges_delivered_records() {
        let config = RelayConfig {
            retention_interval_ms: 20,
            retention: RetentionPolicy {
                delivered_ttl_secs: Some(0),
                abandoned_ttl_secs: None,
            },
            ..fast_config()
        };
        let h = Harness::new(config);
        h.relay.start().await.unwrap();

        h.source.publish(car("tx-1", "CAR10", TOYOTA)).unwrap();
        eventually("delivery then purge", || {
            h.target.write_count() == 1 && h.ledger.counts().unwrap().total() == 0
        })
        .await;
        h.relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_guards() {
        let h = Harness::new(fast_config());
        assert_eq!(h.relay.lifecycle(), Lifecycle::Created);
        assert!(matches!(h.relay.pause(), Err(RelayError::NotRunning)));

        h.relay.start().await.unwrap();
        assert!(matches!(h.relay.start().await, Err(RelayError::AlreadyStarted)));

        h.relay.shutdown().await.unwrap();
        assert!(matches!(
            h.relay.drain(Duration::from_millis(10)).await,
            Err(RelayError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = RelayCoordinator::new(
            RelayConfig {
                workers: 0,
                ..RelayConfig::default()
            },
            Arc::new(InMemoryDeliveryLedger::new()),
            Arc::new(ChannelEventSource::new()),
            Arc::new(FieldMappingTranslator::car_registry()),
            Arc::new(InMemoryTargetLedger::new()),
        );
        assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
    }
}
