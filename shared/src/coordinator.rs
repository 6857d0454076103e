//! Outbox draining.
//!
//! A pass walks the outbox in creation order and dispatches every due item
//! with its idempotency key. Passes never overlap: a second trigger while one
//! is running is a no-op, and the running pass schedules its own follow-up.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::cache::ReadCache;
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::draft::DraftManager;
use crate::ids::OpId;
use crate::model::EntityRef;
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::outbox::{MutationKind, Outbox, OutboxIntent, OutboxItem};
use crate::reconciler::OptimisticReconciler;
use crate::remote::{DispatchError, RemoteApi};
use crate::store::Collection;

/// Aggregate result of one drain pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub success_count: usize,
    pub fail_count: usize,
    pub dropped_count: usize,
    /// Connectivity was lost part-way through the pass.
    pub preempted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    /// Retry budget used up on transient failures.
    Exhausted { last_error: Option<String> },
    /// The server refused the intent outright.
    Rejected { error: DispatchError },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Exhausted {
                last_error: Some(e),
            } => write!(f, "gave up after repeated failures ({e})"),
            DropReason::Exhausted { last_error: None } => write!(f, "gave up after repeated failures"),
            DropReason::Rejected { error } => write!(f, "rejected by server ({error})"),
        }
    }
}

/// User-visible failure. Emitted exactly once per dropped item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotice {
    Dropped {
        item_id: OpId,
        kind: MutationKind,
        attempts: u32,
        reason: DropReason,
    },
}

struct CoordinatorInner {
    outbox: Arc<Outbox>,
    remote: Arc<dyn RemoteApi>,
    monitor: NetworkMonitor,
    cache: ReadCache,
    reconciler: OptimisticReconciler,
    drafts: DraftManager,
    clock: SharedClock,
    tick_interval: Duration,
    draining: AtomicBool,
    follow_up: Mutex<Option<JoinHandle<()>>>,
    wake: Notify,
    outcomes: broadcast::Sender<SyncOutcome>,
    notices: broadcast::Sender<SyncNotice>,
    recent: Mutex<VecDeque<SyncNotice>>,
    recent_kept: usize,
}

/// Resets the drain flag however the pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        outbox: Arc<Outbox>,
        remote: Arc<dyn RemoteApi>,
        monitor: NetworkMonitor,
        reconciler: OptimisticReconciler,
        cache: ReadCache,
        drafts: DraftManager,
        config: &SyncConfig,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(64);
        let (notices, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CoordinatorInner {
                outbox,
                remote,
                monitor,
                clock: cache.store().clock(),
                cache,
                reconciler,
                drafts,
                tick_interval: config.tick_interval(),
                draining: AtomicBool::new(false),
                follow_up: Mutex::new(None),
                wake: Notify::new(),
                outcomes,
                notices,
                recent: Mutex::new(VecDeque::new()),
                recent_kept: config.recent_failures_kept,
            }),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<SyncOutcome> {
        self.inner.outcomes.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.inner.notices.subscribe()
    }

    /// Most recent drop notices, oldest first.
    pub fn recent_failures(&self) -> Vec<SyncNotice> {
        self.recent().iter().cloned().collect()
    }

    pub fn clear_recent_failures(&self) {
        self.recent().clear();
    }

    fn recent(&self) -> MutexGuard<'_, VecDeque<SyncNotice>> {
        self.inner.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn follow_up_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .follow_up
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks the trigger loop for a pass without waiting for it.
    pub fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    /// Runs one pass now. `None` when offline or a pass is already running.
    pub async fn sync_now(&self) -> Option<SyncOutcome> {
        self.drain().await
    }

    /// Gives every failed item a fresh retry budget and drains.
    pub async fn retry_failed(&self) -> Option<SyncOutcome> {
        let reset = self.inner.outbox.reset_failed().await;
        debug!(reset, "manual retry requested");
        self.drain().await
    }

    /// Boxed because the follow-up task it schedules calls back into it.
    fn drain(&self) -> Pin<Box<dyn Future<Output = Option<SyncOutcome>> + Send + '_>> {
        Box::pin(self.drain_pass())
    }

    #[instrument(skip(self))]
    async fn drain_pass(&self) -> Option<SyncOutcome> {
        if !self.inner.monitor.is_online() {
            debug!("offline, skipping drain");
            return None;
        }
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already running");
            return None;
        }
        let _guard = DrainGuard(&self.inner.draining);

        let outcome = self.run_pass().await;

        info!(
            success = outcome.success_count,
            failed = outcome.fail_count,
            dropped = outcome.dropped_count,
            preempted = outcome.preempted,
            "drain pass finished"
        );
        if self.inner.outcomes.send(outcome.clone()).is_err() {
            trace!("no subscribers for sync outcome");
        }
        Some(outcome)
    }

    async fn run_pass(&self) -> SyncOutcome {
        let outbox = &self.inner.outbox;
        let mut outcome = SyncOutcome::default();
        let mut failed_targets: HashSet<EntityRef> = HashSet::new();
        let mut touched: Vec<Collection> = Vec::new();

        for item in outbox.all().await {
            if !self.inner.monitor.is_online() {
                warn!("went offline mid-pass, stopping");
                outcome.preempted = true;
                break;
            }

            if outbox.is_exhausted(&item) {
                let reason = DropReason::Exhausted {
                    last_error: item.last_error.clone(),
                };
                if self.drop_item(&item, reason).await {
                    outcome.dropped_count += 1;
                }
                continue;
            }

            if !outbox.is_due(&item, self.inner.clock.now()) {
                trace!(op_id = %item.id, retry_count = item.retry_count, "not due yet");
                continue;
            }

            let target = item.intent.target();
            if failed_targets.contains(&target) {
                debug!(op_id = %item.id, "earlier change to the same entity failed, deferring");
                continue;
            }

            debug!(op_id = %item.id, kind = item.kind().as_str(), "dispatching");
            match self
                .inner
                .remote
                .dispatch(&item.intent, &item.idempotency_key)
                .await
            {
                Ok(result) => {
                    if let Err(e) = outbox.mark_attempt(&item.id, true).await {
                        warn!(op_id = %item.id, error = %e, "delivered item already gone");
                    }
                    if result.replayed {
                        debug!(op_id = %item.id, "server replayed earlier result");
                    }
                    self.inner
                        .reconciler
                        .settle_delivered(&item.intent, &item.idempotency_key, result.record)
                        .await;
                    if let OutboxIntent::CreateReport {
                        draft_id: Some(draft_id),
                        ..
                    } = &item.intent
                    {
                        self.inner.drafts.discard(draft_id).await;
                    }
                    outcome.success_count += 1;
                    let collection = item.kind().collection();
                    if !touched.contains(&collection) {
                        touched.push(collection);
                    }
                }
                Err(error) if error.is_retryable() => {
                    outcome.fail_count += 1;
                    failed_targets.insert(target);
                    match outbox.record_failure(&item.id, error.to_string()).await {
                        Ok(updated) if outbox.is_exhausted(&updated) => {
                            let reason = DropReason::Exhausted {
                                last_error: updated.last_error.clone(),
                            };
                            if self.drop_item(&updated, reason).await {
                                outcome.dropped_count += 1;
                            }
                        }
                        Ok(updated) => {
                            debug!(op_id = %item.id, retry_count = updated.retry_count, error = %error, "dispatch failed, will retry");
                        }
                        Err(e) => warn!(op_id = %item.id, error = %e, "failed to record attempt"),
                    }
                }
                Err(error) => {
                    outcome.fail_count += 1;
                    failed_targets.insert(target);
                    warn!(op_id = %item.id, error = %error, "dispatch rejected");
                    let reason = DropReason::Rejected { error };
                    if self.drop_item(&item, reason).await {
                        outcome.dropped_count += 1;
                    }
                }
            }
        }

        // Targeted refresh of whatever the confirmed writes touched
        for collection in touched {
            if let Err(e) = self.inner.cache.refresh_collection(&collection).await {
                debug!(%collection, error = %e, "post-sync refresh failed");
            }
        }

        if !outcome.preempted {
            self.schedule_follow_up().await;
        }
        outcome
    }

    /// Removes the item and reports it. Returns false when someone else got
    /// there first, so the notice is never duplicated.
    async fn drop_item(&self, item: &OutboxItem, reason: DropReason) -> bool {
        if self.inner.outbox.remove(&item.id).await.is_none() {
            return false;
        }
        self.inner
            .reconciler
            .settle_dropped(&item.intent, &item.idempotency_key)
            .await;

        warn!(op_id = %item.id, kind = item.kind().as_str(), %reason, "item dropped");
        let notice = SyncNotice::Dropped {
            item_id: item.id.clone(),
            kind: item.kind(),
            attempts: item.retry_count,
            reason,
        };
        {
            let mut recent = self.recent();
            recent.push_back(notice.clone());
            while recent.len() > self.inner.recent_kept {
                recent.pop_front();
            }
        }
        if self.inner.notices.send(notice).is_err() {
            trace!("no subscribers for sync notice");
        }
        true
    }

    /// One pending follow-up at most, timed by the least-retried remaining
    /// item. An empty outbox cancels it.
    async fn schedule_follow_up(&self) {
        let remaining = self.inner.outbox.all().await;
        let delay = remaining
            .iter()
            .map(|item| item.retry_count)
            .min()
            .map(|retry_count| self.inner.outbox.backoff(retry_count));

        let task = delay.map(|delay| {
            debug!(?delay, remaining = remaining.len(), "follow-up pass scheduled");
            let coordinator = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Leave the slot empty so the pass can schedule the next one
                drop(coordinator.follow_up_slot().take());
                coordinator.drain().await;
            })
        });

        let previous = std::mem::replace(&mut *self.follow_up_slot(), task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn cancel_follow_up(&self) {
        if let Some(task) = self.follow_up_slot().take() {
            task.abort();
        }
    }

    /// Spawns the trigger loop: a pass on start, on every became-online
    /// edge, on each tick while online and on [`trigger`](Self::trigger).
    pub fn start(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let mut events = self.inner.monitor.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.inner.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately and doubles as the startup pass
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(NetworkEvent::BecameOnline) => {
                            info!("back online, draining outbox");
                            coordinator.drain().await;
                        }
                        Ok(NetworkEvent::BecameOffline) => {}
                        Err(RecvError::Lagged(missed)) => {
                            debug!(missed, "connectivity events lagged");
                            coordinator.drain().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        coordinator.drain().await;
                    }
                    () = coordinator.inner.wake.notified() => {
                        coordinator.drain().await;
                    }
                }
            }
        })
    }
}
