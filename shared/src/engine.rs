//! The assembled sync engine.
//!
//! One `SyncEngine` per tenant session. It owns the store, outbox, cache and
//! background tasks; nothing lives in module globals, so two engines in one
//! process never share state and `shutdown` tears everything down.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheUpdate, ReadCache};
use crate::clock::SystemClock;
use crate::config::{ConfigError, SyncConfig};
use crate::coordinator::{SyncCoordinator, SyncNotice, SyncOutcome};
use crate::draft::{DraftError, DraftManager, LegacyDraftSource, PreviewRegistry};
use crate::ids::{new_key, DraftId, IdempotencyKey, MutationToken, OpId, RecordId};
use crate::model::{CommentSubmission, ReactionKind, TopicSubmission, ValidationError};
use crate::network::NetworkMonitor;
use crate::outbox::{MetricsSnapshot, Outbox, OutboxError, OutboxIntent, RetryInfo};
use crate::reconciler::OptimisticReconciler;
use crate::remote::{DispatchError, RemoteApi, RemoteRecord};
use crate::store::{CacheRecord, Collection, LocalStore, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("draft error: {0}")]
    Draft(#[from] DraftError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("rejected by server: {0}")]
    Rejected(#[from] DispatchError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where a write ended up.
#[derive(Clone, Debug, PartialEq)]
pub enum Submission {
    /// Delivered directly; carries the server's copy when it sent one.
    Sent { record: Option<RemoteRecord> },
    /// Waiting in the outbox.
    Queued { item_id: OpId },
}

impl Submission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Submission::Queued { .. })
    }
}

/// What the UI shows in its sync banner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncStatusSnapshot {
    pub pending_count: usize,
    pub failed_count: usize,
    pub is_online: bool,
    pub is_syncing: bool,
    pub storage_degraded: bool,
    pub failed_with_retry_info: Vec<RetryInfo>,
}

pub struct SyncEngineBuilder {
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
    store: Option<LocalStore>,
    monitor: Option<NetworkMonitor>,
    legacy: Option<Arc<dyn LegacyDraftSource>>,
    previews: Option<Arc<dyn PreviewRegistry>>,
}

impl SyncEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a memory-only store on the system clock.
    #[must_use]
    pub fn store(mut self, store: LocalStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to a monitor that starts offline.
    #[must_use]
    pub fn monitor(mut self, monitor: NetworkMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn legacy_drafts(mut self, legacy: Arc<dyn LegacyDraftSource>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    #[must_use]
    pub fn previews(mut self, previews: Arc<dyn PreviewRegistry>) -> Self {
        self.previews = Some(previews);
        self
    }

    #[instrument(skip(self))]
    pub async fn build(self) -> Result<SyncEngine, SyncError> {
        self.config.validate()?;
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| LocalStore::memory_only(Arc::new(SystemClock)));
        if store.is_degraded() {
            warn!("local storage unavailable, running memory-only");
        }
        let monitor = self.monitor.unwrap_or_default();

        let outbox = Arc::new(Outbox::open(&store, &config).await);
        let cache = ReadCache::new(
            store.clone(),
            Arc::clone(&self.remote),
            config.cache_stale_after(),
            config.cache_capacity,
        );
        let reconciler = OptimisticReconciler::new(cache.clone(), config.revalidate_delay());
        let mut drafts = DraftManager::new(&store, &config);
        if let Some(legacy) = self.legacy {
            drafts = drafts.with_legacy(legacy);
        }
        if let Some(previews) = self.previews {
            drafts = drafts.with_previews(previews);
        }
        let coordinator = SyncCoordinator::new(
            Arc::clone(&outbox),
            Arc::clone(&self.remote),
            monitor.clone(),
            reconciler.clone(),
            cache.clone(),
            drafts.clone(),
            &config,
        );

        info!(pending = outbox.len().await, durable = store.is_durable(), "sync engine ready");

        Ok(SyncEngine {
            config,
            store,
            remote: self.remote,
            monitor,
            outbox,
            cache,
            reconciler,
            coordinator,
            drafts,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    store: LocalStore,
    remote: Arc<dyn RemoteApi>,
    monitor: NetworkMonitor,
    outbox: Arc<Outbox>,
    cache: ReadCache,
    reconciler: OptimisticReconciler,
    coordinator: SyncCoordinator,
    drafts: DraftManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn builder(remote: Arc<dyn RemoteApi>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            remote,
            config: SyncConfig::default(),
            store: None,
            monitor: None,
            legacy: None,
            previews: None,
        }
    }

    /// Starts the trigger loop and, when configured, the reachability probe.
    pub fn start(&self) {
        let handle = self.coordinator.start();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        if let Some(interval) = self.config.probe_interval() {
            self.monitor.start_probe(Arc::clone(&self.remote), interval);
        }
    }

    /// Stops every background task and writes out pending draft edits.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.monitor.stop_probe();
        self.coordinator.cancel_follow_up();
        self.drafts.flush().await;
        info!("sync engine stopped");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn drafts(&self) -> &DraftManager {
        &self.drafts
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn reconciler(&self) -> &OptimisticReconciler {
        &self.reconciler
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.outbox.metrics()
    }

    /// Host-reported connectivity change.
    pub fn set_online(&self, online: bool) {
        self.monitor.set_online(online);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn read(&self, collection: &Collection, id: &str) -> Option<CacheRecord> {
        self.cache.read(collection, id).await
    }

    pub async fn read_collection(&self, collection: &Collection) -> Vec<CacheRecord> {
        self.cache.read_collection(collection).await
    }

    pub fn subscribe_cache(&self) -> broadcast::Receiver<CacheUpdate> {
        self.cache.subscribe()
    }

    // ------------------------------------------------------------------
    // Sync control
    // ------------------------------------------------------------------

    pub async fn status(&self) -> SyncStatusSnapshot {
        let retry_info = self.outbox.retry_info().await;
        SyncStatusSnapshot {
            pending_count: self.outbox.len().await,
            failed_count: retry_info.len(),
            is_online: self.monitor.is_online(),
            is_syncing: self.coordinator.is_syncing(),
            storage_degraded: self.store.is_degraded(),
            failed_with_retry_info: retry_info,
        }
    }

    pub async fn sync_now(&self) -> Option<SyncOutcome> {
        self.coordinator.sync_now().await
    }

    pub async fn retry_failed(&self) -> Option<SyncOutcome> {
        self.coordinator.retry_failed().await
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<SyncOutcome> {
        self.coordinator.subscribe_outcomes()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.coordinator.subscribe_notices()
    }

    pub fn recent_failures(&self) -> Vec<SyncNotice> {
        self.coordinator.recent_failures()
    }

    pub fn dismiss_failures(&self) {
        self.coordinator.clear_recent_failures();
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Sends `intent` straight away when online, otherwise queues it.
    ///
    /// An intent whose entity still has queued writes goes behind them. A
    /// transient failure on the direct path demotes the intent to the
    /// outbox under the same key. A permanent one rolls back `token` and
    /// returns the error; nothing is queued.
    #[instrument(skip(self, intent, token), fields(kind = intent.kind().as_str(), idempotency_key = %key))]
    pub async fn submit(
        &self,
        intent: OutboxIntent,
        key: IdempotencyKey,
        token: Option<MutationToken>,
    ) -> Result<Submission, SyncError> {
        if let Err(e) = intent.validate() {
            self.settle_failed(token.as_ref()).await;
            return Err(e.into());
        }
        if let Some(token) = &token {
            self.reconciler.link(key.clone(), token.clone());
        }

        if self.monitor.is_online() && self.outbox.has_pending_for(&intent.target()).await {
            debug!(entity = %intent.target(), "earlier writes still queued, keeping order");
            let item_id = self.enqueue(intent, key).await?;
            self.coordinator.trigger();
            return Ok(Submission::Queued { item_id });
        }

        if self.monitor.is_online() {
            match self.remote.dispatch(&intent, &key).await {
                Ok(outcome) => {
                    debug!(replayed = outcome.replayed, "sent directly");
                    self.reconciler
                        .settle_delivered(&intent, &key, outcome.record.clone())
                        .await;
                    return Ok(Submission::Sent {
                        record: outcome.record,
                    });
                }
                Err(error) if error.is_retryable() => {
                    debug!(%error, "direct send failed, queueing");
                    let item_id = self.enqueue(intent, key).await?;
                    if let Err(e) = self.outbox.record_failure(&item_id, error.to_string()).await {
                        // Already delivered by a concurrent pass
                        debug!(error = %e, "demoted item settled early");
                    }
                    self.coordinator.trigger();
                    return Ok(Submission::Queued { item_id });
                }
                Err(error) => {
                    warn!(%error, "write rejected");
                    self.reconciler.rollback_linked(&key).await;
                    return Err(error.into());
                }
            }
        }

        let item_id = self.enqueue(intent, key).await?;
        Ok(Submission::Queued { item_id })
    }

    async fn enqueue(&self, intent: OutboxIntent, key: IdempotencyKey) -> Result<OpId, SyncError> {
        match self.outbox.enqueue(intent, key.clone()).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.reconciler.rollback_linked(&key).await;
                Err(e.into())
            }
        }
    }

    async fn settle_failed(&self, token: Option<&MutationToken>) {
        if let Some(token) = token {
            self.reconciler.rollback(token).await;
        }
    }

    /// Submits a finished draft. A sent report discards the draft at once; a
    /// queued one keeps it until the sync pass delivers it, so a rejection
    /// leaves the user's work in place. An incomplete draft is rejected with
    /// no mutation.
    #[instrument(skip(self))]
    pub async fn create_report_from_draft(&self, id: &DraftId) -> Result<Submission, SyncError> {
        let draft = self
            .drafts
            .load(id)
            .await
            .ok_or_else(|| DraftError::NotFound(id.to_string()))?;
        let report = draft.to_submission()?;

        let local_id = RecordId::local();
        let mut placeholder = serde_json::to_value(&report)?;
        placeholder["id"] = json!(local_id.as_str());
        placeholder["status"] = json!("pending");
        let token = self
            .reconciler
            .apply_optimistic(Collection::Reports, local_id.as_str(), move |v: &mut Value| {
                *v = placeholder.clone();
            })
            .await;

        let intent = OutboxIntent::CreateReport {
            local_id,
            draft_id: Some(id.clone()),
            report,
        };
        // The draft's key makes a resubmission of the same draft a replay
        let submission = self
            .submit(intent, draft.idempotency_key.clone(), Some(token))
            .await?;
        if !submission.is_queued() {
            self.drafts.discard(id).await;
        }
        Ok(submission)
    }

    #[instrument(skip(self, topic))]
    pub async fn create_topic(&self, topic: TopicSubmission) -> Result<Submission, SyncError> {
        topic.validate()?;
        let local_id = RecordId::local();
        let placeholder = json!({
            "id": local_id.as_str(),
            "category": topic.category,
            "title": topic.title,
            "body": topic.body,
            "likes": 0,
            "liked": false,
            "comment_count": 0,
            "pending": true,
        });
        let token = self
            .reconciler
            .apply_optimistic(Collection::Topics, local_id.as_str(), move |v: &mut Value| {
                *v = placeholder.clone();
            })
            .await;

        let intent = OutboxIntent::CreateTopic { local_id, topic };
        self.submit(intent, new_key(), Some(token)).await
    }

    /// Shows the comment as pending right away under a local id.
    #[instrument(skip(self, body))]
    pub async fn add_comment(&self, topic_id: RecordId, body: impl Into<String>) -> Result<Submission, SyncError> {
        let comment = CommentSubmission {
            topic_id,
            local_id: RecordId::local(),
            body: body.into(),
        };
        comment.validate()?;

        let placeholder = json!({
            "id": comment.local_id.as_str(),
            "topic_id": comment.topic_id.as_str(),
            "body": comment.body,
            "pending": true,
        });
        let token = self
            .reconciler
            .apply_optimistic(Collection::Comments, comment.local_id.as_str(), move |v: &mut Value| {
                *v = placeholder.clone();
            })
            .await;

        self.submit(OutboxIntent::AddComment(comment), new_key(), Some(token))
            .await
    }

    #[instrument(skip(self))]
    pub async fn toggle_like(&self, topic_id: RecordId, liked: bool) -> Result<Submission, SyncError> {
        let token = self
            .optimistic_toggle(Collection::Topics, &topic_id, move |v: &mut Value| {
                toggle_counter(v, &["liked"], &["likes"], liked);
            })
            .await;
        let intent = OutboxIntent::ToggleLike { topic_id, liked };
        self.submit(intent, new_key(), token).await
    }

    #[instrument(skip(self))]
    pub async fn toggle_reaction(
        &self,
        place_id: RecordId,
        reaction: ReactionKind,
        active: bool,
    ) -> Result<Submission, SyncError> {
        let key = reaction.as_str();
        let token = self
            .optimistic_toggle(Collection::Places, &place_id, move |v: &mut Value| {
                toggle_counter(v, &["my_reactions", key], &["reactions", key], active);
            })
            .await;
        let intent = OutboxIntent::ToggleReaction {
            place_id,
            reaction,
            active,
        };
        self.submit(intent, new_key(), token).await
    }

    /// Only records already cached get an optimistic change; there is no
    /// count to adjust otherwise.
    async fn optimistic_toggle<F>(&self, collection: Collection, id: &RecordId, mutator: F) -> Option<MutationToken>
    where
        F: Fn(&mut Value) + Send + Sync + 'static,
    {
        self.cache.get(&collection, id.as_str()).await?;
        Some(
            self.reconciler
                .apply_optimistic(collection, id.as_str(), mutator)
                .await,
        )
    }
}

fn get_path<'a>(record: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(record, |value, segment| value.get(*segment))
}

fn set_path(record: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = record;
    for segment in parents {
        let Some(object) = current.as_object_mut() else {
            return;
        };
        current = object
            .entry(*segment)
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(object) = current.as_object_mut() {
        object.insert((*last).to_string(), value);
    }
}

/// Sets a boolean flag and moves its counter with it. A flag already in the
/// wanted state leaves the record untouched; counts never go below zero.
fn toggle_counter(record: &mut Value, flag: &[&str], counter: &[&str], on: bool) {
    let current = get_path(record, flag).and_then(Value::as_bool).unwrap_or(false);
    if current == on {
        return;
    }
    let count = get_path(record, counter).and_then(Value::as_i64).unwrap_or(0);
    let next = if on { count + 1 } else { (count - 1).max(0) };
    set_path(record, counter, json!(next));
    set_path(record, flag, json!(on));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, UnixTimeMs};
    use crate::draft::ReportPatch;
    use crate::remote::{Fault, InMemoryRemote};
    use crate::outbox::MutationKind;
    use assert_matches::assert_matches;
    use std::time::Duration;

    async fn engine(online: bool) -> (SyncEngine, Arc<InMemoryRemote>) {
        let clock = ManualClock::new(UnixTimeMs(1_700_000_000_000));
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed(
            Collection::Topics,
            "7",
            json!({"id": "7", "title": "Potholes", "likes": 3, "liked": false, "comment_count": 0}),
        );
        remote.seed(
            Collection::Places,
            "p1",
            json!({"id": "p1", "reactions": {"like": 2}, "my_reactions": {}}),
        );
        let engine = SyncEngine::builder(remote.clone())
            .store(LocalStore::memory_only(Arc::new(clock)))
            .monitor(NetworkMonitor::new(online))
            .build()
            .await
            .unwrap();
        engine.cache().refresh_collection(&Collection::Topics).await.ok();
        engine.cache().refresh_collection(&Collection::Places).await.ok();
        (engine, remote)
    }

    async fn topic(engine: &SyncEngine) -> Value {
        engine.cache().get(&Collection::Topics, "7").await.unwrap().payload
    }

    #[test]
    fn test_toggle_counter_is_idempotent() {
        let mut record = json!({"likes": 3, "liked": false});
        toggle_counter(&mut record, &["liked"], &["likes"], true);
        toggle_counter(&mut record, &["liked"], &["likes"], true);
        assert_eq!(record, json!({"likes": 4, "liked": true}));

        toggle_counter(&mut record, &["liked"], &["likes"], false);
        assert_eq!(record, json!({"likes": 3, "liked": false}));
    }

    #[test]
    fn test_toggle_counter_creates_nested_maps() {
        let mut record = json!({"id": "p1"});
        toggle_counter(&mut record, &["my_reactions", "wow"], &["reactions", "wow"], true);
        assert_eq!(record["reactions"]["wow"], 1);
        assert_eq!(record["my_reactions"]["wow"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_like_is_optimistic_and_queued() {
        let (engine, remote) = engine(true).await;
        engine.set_online(false);

        let submission = engine
            .toggle_like(RecordId::new("7").unwrap(), true)
            .await
            .unwrap();
        assert!(submission.is_queued());
        assert_eq!(topic(&engine).await["likes"], 4);
        assert_eq!(remote.dispatch_calls(), 0);

        engine.set_online(true);
        let outcome = engine.sync_now().await.unwrap();
        assert_eq!(outcome.success_count, 1);
        assert_eq!(topic(&engine).await["likes"], 4);
        assert_eq!(engine.status().await.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_send_is_direct() {
        let (engine, remote) = engine(true).await;
        let submission = engine
            .toggle_like(RecordId::new("7").unwrap(), true)
            .await
            .unwrap();
        assert_matches!(submission, Submission::Sent { record: Some(_) });
        assert!(engine.outbox().is_empty().await);
        assert_eq!(remote.payload(&Collection::Topics, "7").unwrap()["likes"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_demotes_with_same_key() {
        let (engine, remote) = engine(true).await;
        remote.fail_next(MutationKind::ToggleLike, Fault::Transient, 1);

        let submission = engine
            .toggle_like(RecordId::new("7").unwrap(), true)
            .await
            .unwrap();
        let Submission::Queued { item_id } = submission else {
            panic!("expected queued");
        };
        let item = engine.outbox().get(&item_id).await.unwrap();
        assert_eq!(item.retry_count, 1);
        // Still showing the optimistic like
        assert_eq!(topic(&engine).await["likes"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_rolls_back() {
        let (engine, remote) = engine(true).await;
        remote.fail_kind(MutationKind::ToggleLike, Fault::Reject(403));

        let err = engine
            .toggle_like(RecordId::new("7").unwrap(), true)
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::Rejected(_));
        assert_eq!(topic(&engine).await["likes"], 3);
        assert!(engine.outbox().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaction_rollback_restores_count() {
        let (engine, remote) = engine(false).await;
        remote.fail_kind(MutationKind::ToggleReaction, Fault::Reject(422));
        engine
            .toggle_reaction(RecordId::new("p1").unwrap(), ReactionKind::Like, true)
            .await
            .unwrap();
        let place = engine.cache().get(&Collection::Places, "p1").await.unwrap();
        assert_eq!(place.payload["reactions"]["like"], 3);

        engine.set_online(true);
        engine.sync_now().await.unwrap();
        let place = engine.cache().get(&Collection::Places, "p1").await.unwrap();
        assert_eq!(place.payload["reactions"]["like"], 2);
        assert_eq!(engine.recent_failures().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_comment_placeholder_replaced_on_confirm() {
        let (engine, _remote) = engine(false).await;
        engine
            .add_comment(RecordId::new("7").unwrap(), "Fixed yet?")
            .await
            .unwrap();
        let pending = engine.cache().store().get_all(&Collection::Comments).await;
        assert_eq!(pending.len(), 1);
        assert!(pending[0].id.starts_with("local-"));
        assert_eq!(pending[0].payload["pending"], true);

        engine.set_online(true);
        engine.sync_now().await.unwrap();
        let comments = engine.cache().store().get_all(&Collection::Comments).await;
        assert_eq!(comments.len(), 1);
        assert!(!comments[0].id.starts_with("local-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_from_draft_discards_draft() {
        let (engine, remote) = engine(true).await;
        let draft = engine.drafts().create();
        let draft = engine
            .drafts()
            .start(
                draft,
                ReportPatch {
                    category: Some("roads".into()),
                    title: Some("Broken light".into()),
                    ..ReportPatch::default()
                },
            )
            .await;

        let submission = engine.create_report_from_draft(&draft.id).await.unwrap();
        assert_matches!(submission, Submission::Sent { .. });
        assert!(engine.drafts().load(&draft.id).await.is_none());
        assert_eq!(remote.applied().len(), 1);
        assert_eq!(remote.applied()[0].1, draft.idempotency_key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_draft_rejected_without_mutation() {
        let (engine, _remote) = engine(false).await;
        let draft = engine.drafts().create();
        let draft = engine.drafts().start(draft, ReportPatch::default()).await;

        let err = engine.create_report_from_draft(&draft.id).await.unwrap_err();
        assert_matches!(err, SyncError::Draft(DraftError::Incomplete(_)));
        assert!(engine.outbox().is_empty().await);
        assert!(engine.drafts().load(&draft.id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_failures() {
        let (engine, remote) = engine(false).await;
        remote.fail_kind(MutationKind::CreateTopic, Fault::Transient);
        engine
            .create_topic(TopicSubmission {
                category: "general".into(),
                title: "Bus schedule".into(),
                body: "When does line 4 run?".into(),
            })
            .await
            .unwrap();

        engine.set_online(true);
        engine.sync_now().await.unwrap();
        let status = engine.status().await;
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.failed_count, 1);
        assert!(status.is_online);
        assert!(!status.is_syncing);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_drafts() {
        let (engine, _remote) = engine(false).await;
        let draft = engine.drafts().create();
        let id = draft.id.clone();
        engine.drafts().save(draft);
        assert!(engine.drafts().has_pending_saves());

        engine.shutdown().await;
        assert!(!engine.drafts().has_pending_saves());
        assert!(engine.store().get(&Collection::Drafts, id.as_str()).await.is_some());
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    async fn report_draft(engine: &SyncEngine) -> DraftId {
        let draft = engine.drafts().create();
        engine
            .drafts()
            .start(
                draft,
                ReportPatch {
                    category: Some("lighting".into()),
                    title: Some("Street light out".into()),
                    ..ReportPatch::default()
                },
            )
            .await
            .id
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_queued_report_keeps_draft() {
        let (engine, remote) = engine(false).await;
        let id = report_draft(&engine).await;

        let submission = engine.create_report_from_draft(&id).await.unwrap();
        assert!(submission.is_queued());
        assert!(engine.drafts().load(&id).await.is_some());

        remote.fail_kind(MutationKind::CreateReport, Fault::Reject(422));
        engine.set_online(true);
        let outcome = engine.sync_now().await.unwrap();
        assert_eq!(outcome.dropped_count, 1);
        assert!(engine.drafts().load(&id).await.is_some());
        assert!(engine.store().get_all(&Collection::Reports).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_queued_report_discards_draft() {
        let (engine, remote) = engine(false).await;
        let id = report_draft(&engine).await;
        engine.create_report_from_draft(&id).await.unwrap();

        engine.set_online(true);
        let outcome = engine.sync_now().await.unwrap();
        assert_eq!(outcome.success_count, 1);
        assert!(engine.drafts().load(&id).await.is_none());
        assert_eq!(remote.applied().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_send_waits_behind_queued_write() {
        let (engine, remote) = engine(false).await;
        let topic_id = RecordId::new("7").unwrap();
        engine.toggle_like(topic_id.clone(), true).await.unwrap();

        engine.set_online(true);
        let submission = engine.toggle_like(topic_id, false).await.unwrap();
        assert!(submission.is_queued());
        assert_eq!(remote.dispatch_calls(), 0);

        engine.sync_now().await.unwrap();
        assert!(engine.outbox().is_empty().await);
        let server = remote.payload(&Collection::Topics, "7").unwrap();
        assert_eq!(server["liked"], false);
        assert_eq!(server["likes"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_create_without_body_settles_placeholder() {
        let (engine, remote) = engine(true).await;
        remote.set_bodiless_replays(true);
        let local_id = RecordId::local();
        let intent = OutboxIntent::CreateTopic {
            local_id: local_id.clone(),
            topic: TopicSubmission {
                category: "transit".into(),
                title: "Night buses".into(),
                body: "Could line 9 run later?".into(),
            },
        };
        let key = new_key();
        // An earlier attempt reached the server but its response was lost
        remote.dispatch(&intent, &key).await.unwrap();

        let token = engine
            .reconciler()
            .apply_optimistic(Collection::Topics, local_id.as_str(), |v: &mut Value| {
                *v = json!({"title": "Night buses", "pending": true});
            })
            .await;
        let submission = engine.submit(intent, key, Some(token)).await.unwrap();
        assert_matches!(submission, Submission::Sent { record: None });
        assert!(engine.cache().get(&Collection::Topics, local_id.as_str()).await.is_none());

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        let topics = engine.store().get_all(&Collection::Topics).await;
        assert_eq!(topics.len(), 2);
        assert!(topics.iter().all(|t| !t.id.starts_with("local-")));
        assert!(topics.iter().any(|t| t.payload["title"] == "Night buses"));
    }
}
