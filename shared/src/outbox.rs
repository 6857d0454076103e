use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::clock::{SharedClock, UnixTimeMs};
use crate::config::SyncConfig;
use crate::ids::{DraftId, IdempotencyKey, OpId, RecordId};
use crate::model::{
    CommentSubmission, EntityRef, ReactionKind, ReportSubmission, TopicSubmission,
    ValidationError,
};
use crate::store::{Collection, LocalStore, StoreError, TypedCollection};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

// ============================================================================
// Intent Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateReport,
    CreateTopic,
    AddComment,
    ToggleLike,
    ToggleReaction,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MutationKind::CreateReport => "create_report",
            MutationKind::CreateTopic => "create_topic",
            MutationKind::AddComment => "add_comment",
            MutationKind::ToggleLike => "toggle_like",
            MutationKind::ToggleReaction => "toggle_reaction",
        }
    }

    /// Collection refreshed from the server once a mutation of this kind
    /// is confirmed.
    pub fn collection(self) -> Collection {
        match self {
            MutationKind::CreateReport => Collection::Reports,
            MutationKind::CreateTopic | MutationKind::ToggleLike => Collection::Topics,
            MutationKind::AddComment => Collection::Comments,
            MutationKind::ToggleReaction => Collection::Places,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum OutboxIntent {
    CreateReport {
        local_id: RecordId,
        /// Draft to delete once the report is delivered.
        draft_id: Option<DraftId>,
        report: ReportSubmission,
    },
    CreateTopic {
        local_id: RecordId,
        topic: TopicSubmission,
    },
    AddComment(CommentSubmission),
    ToggleLike {
        topic_id: RecordId,
        liked: bool,
    },
    ToggleReaction {
        place_id: RecordId,
        reaction: ReactionKind,
        active: bool,
    },
}

impl OutboxIntent {
    pub fn kind(&self) -> MutationKind {
        match self {
            OutboxIntent::CreateReport { .. } => MutationKind::CreateReport,
            OutboxIntent::CreateTopic { .. } => MutationKind::CreateTopic,
            OutboxIntent::AddComment(_) => MutationKind::AddComment,
            OutboxIntent::ToggleLike { .. } => MutationKind::ToggleLike,
            OutboxIntent::ToggleReaction { .. } => MutationKind::ToggleReaction,
        }
    }

    /// Entity whose mutations must reach the server in order.
    pub fn target(&self) -> EntityRef {
        match self {
            OutboxIntent::CreateReport { local_id, .. } => {
                EntityRef::new(Collection::Reports, local_id.clone())
            }
            OutboxIntent::CreateTopic { local_id, .. } => {
                EntityRef::new(Collection::Topics, local_id.clone())
            }
            OutboxIntent::AddComment(comment) => {
                EntityRef::new(Collection::Topics, comment.topic_id.clone())
            }
            OutboxIntent::ToggleLike { topic_id, .. } => {
                EntityRef::new(Collection::Topics, topic_id.clone())
            }
            OutboxIntent::ToggleReaction { place_id, .. } => {
                EntityRef::new(Collection::Places, place_id.clone())
            }
        }
    }

    /// Local record shown until the server assigns the real one. Stored
    /// with the item so it can be cleaned up after a restart.
    pub fn placeholder(&self) -> Option<EntityRef> {
        match self {
            OutboxIntent::CreateReport { local_id, .. } => {
                Some(EntityRef::new(Collection::Reports, local_id.clone()))
            }
            OutboxIntent::CreateTopic { local_id, .. } => {
                Some(EntityRef::new(Collection::Topics, local_id.clone()))
            }
            OutboxIntent::AddComment(comment) => Some(EntityRef::new(
                Collection::Comments,
                comment.local_id.clone(),
            )),
            OutboxIntent::ToggleLike { .. } | OutboxIntent::ToggleReaction { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            OutboxIntent::CreateReport { report, .. } => report.validate(),
            OutboxIntent::CreateTopic { topic, .. } => topic.validate(),
            OutboxIntent::AddComment(comment) => comment.validate(),
            OutboxIntent::ToggleLike { .. } | OutboxIntent::ToggleReaction { .. } => Ok(()),
        }
    }
}

// ============================================================================
// Outbox Item
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: OpId,
    pub idempotency_key: IdempotencyKey,
    pub intent: OutboxIntent,
    pub retry_count: u32,
    pub last_attempt: Option<UnixTimeMs>,
    pub created_at: UnixTimeMs,
    /// Tie-breaker for items created within the same millisecond.
    pub sequence: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OutboxItem {
    pub fn kind(&self) -> MutationKind {
        self.intent.kind()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub item_id: OpId,
    pub kind: MutationKind,
    pub attempts: u32,
    pub last_error: Option<String>,
}

// ============================================================================
// Backoff
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_backoff_ms),
            cap: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// `min(base * 2^retry_count, cap)`
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(31);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(1u64 << exponent).min(cap_ms))
    }

    /// Never-attempted items are always due.
    pub fn is_due(&self, item: &OutboxItem, now: UnixTimeMs) -> bool {
        match item.last_attempt {
            None => true,
            Some(last) => now.elapsed_since(last) >= self.delay(item.retry_count),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

// ============================================================================
// Metrics and Observability
// ============================================================================

#[derive(Debug, Default)]
pub struct OutboxMetrics {
    pub entries_enqueued: AtomicU64,
    pub entries_completed: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub entries_dropped: AtomicU64,
    pub duplicate_rejections: AtomicU64,
}

impl OutboxMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_enqueued: self.entries_enqueued.load(Ordering::Relaxed),
            entries_completed: self.entries_completed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            duplicate_rejections: self.duplicate_rejections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub entries_enqueued: u64,
    pub entries_completed: u64,
    pub failed_attempts: u64,
    pub entries_dropped: u64,
    pub duplicate_rejections: u64,
}

// ============================================================================
// Outbox
// ============================================================================

#[derive(Default)]
struct OutboxState {
    by_id: HashMap<OpId, OutboxItem>,
    by_key: HashMap<IdempotencyKey, OpId>,
    next_sequence: u64,
}

impl OutboxState {
    fn insert(&mut self, item: OutboxItem) {
        self.next_sequence = self.next_sequence.max(item.sequence.saturating_add(1));
        self.by_key
            .insert(item.idempotency_key.clone(), item.id.clone());
        self.by_id.insert(item.id.clone(), item);
    }

    fn remove(&mut self, id: &OpId) -> Option<OutboxItem> {
        let item = self.by_id.remove(id)?;
        self.by_key.remove(&item.idempotency_key);
        Some(item)
    }
}

/// Durable FIFO of write intents that have not been confirmed by the server.
///
/// The in-memory index is authoritative while the process runs; every change
/// is written through to the `outbox` collection of the local store.
pub struct Outbox {
    items: TypedCollection<OutboxItem>,
    state: RwLock<OutboxState>,
    policy: BackoffPolicy,
    max_entries: usize,
    max_retries: u32,
    clock: SharedClock,
    metrics: OutboxMetrics,
}

impl Outbox {
    /// Loads whatever a previous run left behind.
    #[instrument(skip(store, config))]
    pub async fn open(store: &LocalStore, config: &SyncConfig) -> Self {
        let items = store.typed::<OutboxItem>(Collection::Outbox);
        let mut state = OutboxState::default();
        for item in items.all().await {
            state.insert(item);
        }

        info!(entries = state.by_id.len(), "outbox loaded");

        Self {
            items,
            state: RwLock::new(state),
            policy: BackoffPolicy::from_config(config),
            max_entries: config.max_outbox_entries,
            max_retries: config.max_retries,
            clock: store.clock(),
            metrics: OutboxMetrics::default(),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Appends a new intent. The key must not already be queued.
    #[instrument(skip(self, intent), fields(kind = intent.kind().as_str()))]
    pub async fn enqueue(
        &self,
        intent: OutboxIntent,
        idempotency_key: IdempotencyKey,
    ) -> Result<OpId, OutboxError> {
        intent.validate()?;

        let mut state = self.state.write().await;

        if state.by_id.len() >= self.max_entries {
            return Err(OutboxError::Full(self.max_entries));
        }

        if state.by_key.contains_key(&idempotency_key) {
            self.metrics
                .duplicate_rejections
                .fetch_add(1, Ordering::Relaxed);
            return Err(OutboxError::DuplicateIdempotencyKey(
                idempotency_key.to_string(),
            ));
        }

        let item = OutboxItem {
            id: OpId::generate(),
            idempotency_key,
            intent,
            retry_count: 0,
            last_attempt: None,
            created_at: self.clock.now(),
            sequence: state.next_sequence,
            last_error: None,
        };

        self.items.put(item.id.as_str(), &item).await?;
        let id = item.id.clone();
        state.insert(item);

        self.metrics.entries_enqueued.fetch_add(1, Ordering::Relaxed);
        info!(op_id = %id, "entry enqueued");
        Ok(id)
    }

    /// Every pending item in creation order.
    pub async fn all(&self) -> Vec<OutboxItem> {
        let state = self.state.read().await;
        let mut items: Vec<_> = state.by_id.values().cloned().collect();
        items.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        items
    }

    pub async fn get(&self, id: &OpId) -> Option<OutboxItem> {
        self.state.read().await.by_id.get(id).cloned()
    }

    pub async fn contains_key(&self, key: &IdempotencyKey) -> bool {
        self.state.read().await.by_key.contains_key(key)
    }

    /// Whether any queued item still has to reach `target` first.
    pub async fn has_pending_for(&self, target: &EntityRef) -> bool {
        self.state
            .read()
            .await
            .by_id
            .values()
            .any(|item| &item.intent.target() == target)
    }

    /// Success removes the item; failure bumps `retry_count` and stamps
    /// `last_attempt`.
    pub async fn mark_attempt(
        &self,
        id: &OpId,
        success: bool,
    ) -> Result<Option<OutboxItem>, OutboxError> {
        self.attempt(id, success, None).await
    }

    /// Failed attempt with the reason kept for the status view.
    pub async fn record_failure(
        &self,
        id: &OpId,
        reason: impl Into<String>,
    ) -> Result<OutboxItem, OutboxError> {
        self.attempt(id, false, Some(reason.into()))
            .await?
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))
    }

    #[instrument(skip(self, reason), fields(op_id = %id))]
    async fn attempt(
        &self,
        id: &OpId,
        success: bool,
        reason: Option<String>,
    ) -> Result<Option<OutboxItem>, OutboxError> {
        let mut state = self.state.write().await;

        if success {
            let removed = state
                .remove(id)
                .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
            self.items.delete(id.as_str()).await;
            self.metrics.entries_completed.fetch_add(1, Ordering::Relaxed);
            debug!("entry completed");
            return Ok(Some(removed));
        }

        let item = state
            .by_id
            .get_mut(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        item.retry_count = item.retry_count.saturating_add(1);
        item.last_attempt = Some(self.clock.now());
        if reason.is_some() {
            item.last_error = reason;
        }
        let updated = item.clone();

        self.items.put(id.as_str(), &updated).await?;
        self.metrics.failed_attempts.fetch_add(1, Ordering::Relaxed);
        debug!(retry_count = updated.retry_count, "entry failed");
        Ok(Some(updated))
    }

    /// Drops an item without delivering it (exhausted or rejected).
    pub async fn remove(&self, id: &OpId) -> Option<OutboxItem> {
        let mut state = self.state.write().await;
        let removed = state.remove(id)?;
        self.items.delete(id.as_str()).await;
        self.metrics.entries_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(op_id = %id, kind = removed.kind().as_str(), "entry dropped");
        Some(removed)
    }

    pub fn is_due(&self, item: &OutboxItem, now: UnixTimeMs) -> bool {
        self.policy.is_due(item, now)
    }

    pub fn is_exhausted(&self, item: &OutboxItem) -> bool {
        item.retry_count >= self.max_retries
    }

    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.policy.delay(retry_count)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Items that have failed at least once.
    pub async fn retry_info(&self) -> Vec<RetryInfo> {
        self.all()
            .await
            .into_iter()
            .filter(|item| item.retry_count > 0)
            .map(|item| RetryInfo {
                kind: item.kind(),
                item_id: item.id,
                attempts: item.retry_count,
                last_error: item.last_error,
            })
            .collect()
    }

    /// Makes every failed item due again with a fresh retry budget.
    #[instrument(skip(self))]
    pub async fn reset_failed(&self) -> usize {
        let mut state = self.state.write().await;
        let mut reset = Vec::new();
        for item in state.by_id.values_mut() {
            if item.retry_count > 0 {
                item.retry_count = 0;
                item.last_attempt = None;
                reset.push(item.clone());
            }
        }
        for item in &reset {
            if let Err(e) = self.items.put(item.id.as_str(), item).await {
                warn!(op_id = %item.id, error = %e, "failed to persist reset entry");
            }
        }
        info!(count = reset.len(), "failed entries reset");
        reset.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
