//! Multi-step report drafts.
//!
//! A draft is created on first input, persisted on every edit through a
//! debounced save, and deleted once its submission reaches the server (or
//! the user discards it). Attachments are stored as [`BlobRef`]s; preview
//! handles are transient and recreated on demand after a restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock::{SharedClock, UnixTimeMs};
use crate::config::SyncConfig;
use crate::ids::{BlobId, DraftId, IdempotencyKey};
use crate::model::{BlobRef, LatLon, ReportSubmission, ValidationError};
use crate::store::{Collection, LocalStore, StoreError, TypedCollection};

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("draft not found: {0}")]
    NotFound(String),

    #[error("attachment limit reached ({max})")]
    AttachmentLimit { max: usize },

    #[error("draft is incomplete: {0}")]
    Incomplete(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

// ============================================================================
// Draft Entity
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftKind {
    #[default]
    Report,
}

/// Wizard position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStep {
    #[default]
    Category,
    Details,
    Location,
    Photos,
    Review,
}

impl DraftStep {
    const ORDER: [DraftStep; 5] = [
        DraftStep::Category,
        DraftStep::Details,
        DraftStep::Location,
        DraftStep::Photos,
        DraftStep::Review,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ORDER.get(index).copied()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSteps {
    pub category: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<LatLon>,
    pub address: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportPatch {
    pub category: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<LatLon>,
    pub address: Option<String>,
    pub is_anonymous: Option<bool>,
    pub step: Option<DraftStep>,
}

impl ReportPatch {
    fn apply(self, draft: &mut DraftEntity) {
        let steps = &mut draft.steps;
        if let Some(category) = self.category {
            steps.category = Some(category);
        }
        if let Some(title) = self.title {
            steps.title = Some(title);
        }
        if let Some(description) = self.description {
            steps.description = Some(description);
        }
        if let Some(location) = self.location {
            steps.location = Some(location);
        }
        if let Some(address) = self.address {
            steps.address = Some(address);
        }
        if let Some(is_anonymous) = self.is_anonymous {
            steps.is_anonymous = is_anonymous;
        }
        if let Some(step) = self.step {
            draft.current_step = step;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DraftAttachment {
    pub id: BlobId,
    pub blob: BlobRef,
    pub created_at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DraftEntity {
    pub id: DraftId,
    pub kind: DraftKind,
    pub steps: ReportSteps,
    pub attachments: Vec<DraftAttachment>,
    pub current_step: DraftStep,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
    /// Minted with the draft so a resubmitted draft dedups server-side.
    pub idempotency_key: IdempotencyKey,
}

impl DraftEntity {
    pub fn new(id: DraftId, now: UnixTimeMs) -> Self {
        Self {
            id,
            kind: DraftKind::Report,
            steps: ReportSteps::default(),
            attachments: Vec::new(),
            current_step: DraftStep::default(),
            created_at: now,
            updated_at: now,
            idempotency_key: IdempotencyKey::generate(),
        }
    }

    /// Builds the payload handed to the outbox. Title and category are
    /// required; everything else is optional.
    pub fn to_submission(&self) -> Result<ReportSubmission, DraftError> {
        let steps = &self.steps;
        let submission = ReportSubmission {
            category: steps.category.clone().unwrap_or_default(),
            title: steps.title.clone().unwrap_or_default(),
            description: steps.description.clone().filter(|d| !d.trim().is_empty()),
            location: steps.location,
            address: steps.address.clone().filter(|a| !a.trim().is_empty()),
            is_anonymous: steps.is_anonymous,
            attachments: self.attachments.iter().map(|a| a.blob.clone()).collect(),
        };
        submission.validate()?;
        Ok(submission)
    }
}

// ============================================================================
// Host Seams
// ============================================================================

/// Pre-existing flat key-value drafts (one string value per field).
#[async_trait]
pub trait LegacyDraftSource: Send + Sync {
    async fn read(&self, id: &DraftId) -> Option<BTreeMap<String, String>>;
    async fn remove(&self, id: &DraftId);
}

#[derive(Debug, Default)]
pub struct MemoryLegacySource {
    entries: Mutex<HashMap<DraftId, BTreeMap<String, String>>>,
}

impl MemoryLegacySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: DraftId, fields: BTreeMap<String, String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, fields);
    }

    pub fn contains(&self, id: &DraftId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

#[async_trait]
impl LegacyDraftSource for MemoryLegacySource {
    async fn read(&self, id: &DraftId) -> Option<BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    async fn remove(&self, id: &DraftId) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Translates a legacy record. Unparseable fields are dropped, never fatal.
fn migrate_legacy(id: &DraftId, fields: &BTreeMap<String, String>, now: UnixTimeMs) -> DraftEntity {
    let text = |key: &str| {
        fields
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let location = match (
        text("lat").and_then(|v| v.parse::<f64>().ok()),
        text("lng").and_then(|v| v.parse::<f64>().ok()),
    ) {
        (Some(lat), Some(lng)) => LatLon::new(lat, lng)
            .map_err(|e| warn!(draft_id = %id, error = %e, "legacy draft location dropped"))
            .ok(),
        _ => None,
    };

    let mut draft = DraftEntity::new(id.clone(), now);
    // Re-migrating after a restart on a degraded store must keep the key
    if let Ok(key) = IdempotencyKey::new(format!("legacy-{id}")) {
        draft.idempotency_key = key;
    }
    draft.steps = ReportSteps {
        category: text("category"),
        title: text("title"),
        description: text("description"),
        location,
        address: text("address"),
        is_anonymous: text("anonymous").is_some_and(|v| v == "true" || v == "1"),
    };
    draft.current_step = text("step")
        .and_then(|v| v.parse::<usize>().ok())
        .and_then(DraftStep::from_index)
        .unwrap_or_default();
    draft
}

/// Short-lived display handles for attachments (object URLs, thumbnails).
pub trait PreviewRegistry: Send + Sync {
    fn create(&self, blob: &BlobRef) -> Option<String>;
    fn revoke(&self, handle: &str);
}

/// Uses the blob URI itself as the preview; nothing to revoke.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectPreviews;

impl PreviewRegistry for DirectPreviews {
    fn create(&self, blob: &BlobRef) -> Option<String> {
        Some(blob.uri.clone())
    }

    fn revoke(&self, _handle: &str) {}
}

// ============================================================================
// Draft Manager
// ============================================================================

struct PendingSave {
    generation: u64,
    draft: DraftEntity,
    task: JoinHandle<()>,
}

struct DraftInner {
    drafts: TypedCollection<DraftEntity>,
    legacy: Option<Arc<dyn LegacyDraftSource>>,
    previews: Arc<dyn PreviewRegistry>,
    preview_handles: Mutex<HashMap<BlobId, String>>,
    pending: Mutex<HashMap<DraftId, PendingSave>>,
    /// Serializes load-modify-save edits per draft.
    edit_locks: Mutex<HashMap<DraftId, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: std::sync::atomic::AtomicU64,
    debounce: Duration,
    max_attachments: usize,
    clock: SharedClock,
}

impl DraftInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<DraftId, PendingSave>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lock_edits(&self, id: &DraftId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.edit_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<BlobId, String>> {
        self.preview_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, draft: &DraftEntity) {
        if let Err(e) = self.drafts.put(draft.id.as_str(), draft).await {
            warn!(draft_id = %draft.id, error = %e, "draft save failed");
        } else {
            debug!(draft_id = %draft.id, "draft saved");
        }
    }
}

#[derive(Clone)]
pub struct DraftManager {
    inner: Arc<DraftInner>,
}

impl DraftManager {
    pub fn new(store: &LocalStore, config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(DraftInner {
                drafts: store.typed(Collection::Drafts),
                legacy: None,
                previews: Arc::new(DirectPreviews),
                preview_handles: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                edit_locks: Mutex::new(HashMap::new()),
                next_generation: std::sync::atomic::AtomicU64::new(0),
                debounce: config.draft_debounce(),
                max_attachments: config.max_attachments,
                clock: store.clock(),
            }),
        }
    }

    /// Only valid before the manager is shared.
    #[must_use]
    pub fn with_legacy(mut self, legacy: Arc<dyn LegacyDraftSource>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.legacy = Some(legacy);
        }
        self
    }

    #[must_use]
    pub fn with_previews(mut self, previews: Arc<dyn PreviewRegistry>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.previews = previews;
        }
        self
    }

    /// Fresh in-memory draft. Nothing is written until the first edit.
    pub fn create(&self) -> DraftEntity {
        DraftEntity::new(DraftId::generate(), self.inner.clock.now())
    }

    /// Latest state of a draft: unsaved edits first, then the store, then a
    /// one-time migration from the legacy source.
    #[instrument(skip(self), fields(draft_id = %id))]
    pub async fn load(&self, id: &DraftId) -> Option<DraftEntity> {
        if let Some(pending) = self.inner.pending().get(id) {
            return Some(pending.draft.clone());
        }

        if let Some(draft) = self.inner.drafts.get(id.as_str()).await {
            return Some(draft);
        }

        let legacy = self.inner.legacy.as_ref()?;
        let fields = legacy.read(id).await?;
        let draft = migrate_legacy(id, &fields, self.inner.clock.now());
        // The legacy record stays put; it is the fallback while the store is
        // degraded and this write only lands in memory.
        self.inner.persist(&draft).await;
        info!("legacy draft migrated");
        Some(draft)
    }

    /// Debounced write: cancels any pending save for this draft and
    /// schedules a new one.
    pub fn save(&self, draft: DraftEntity) {
        let id = draft.id.clone();
        let generation = self
            .inner
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // Registered under the lock so the timer can never observe a
        // missing entry.
        let mut pending = self.inner.pending();
        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let draft = {
                let mut pending = inner.pending();
                match pending.get(&task_id) {
                    Some(p) if p.generation == generation => pending.remove(&task_id).map(|p| p.draft),
                    _ => None,
                }
            };
            if let Some(draft) = draft {
                inner.persist(&draft).await;
            }
        });

        let previous = pending.insert(
            id,
            PendingSave {
                generation,
                draft,
                task,
            },
        );
        drop(pending);
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    /// Writes every pending save immediately.
    pub async fn flush(&self) {
        let pending: Vec<PendingSave> = self.inner.pending().drain().map(|(_, p)| p).collect();
        for save in pending {
            save.task.abort();
            self.inner.persist(&save.draft).await;
        }
    }

    pub fn has_pending_saves(&self) -> bool {
        !self.inner.pending().is_empty()
    }

    #[instrument(skip(self, patch), fields(draft_id = %id))]
    pub async fn update_field(&self, id: &DraftId, patch: ReportPatch) -> Result<DraftEntity, DraftError> {
        let _edit = self.inner.lock_edits(id).await;
        let mut draft = self
            .load(id)
            .await
            .ok_or_else(|| DraftError::NotFound(id.to_string()))?;
        patch.apply(&mut draft);
        draft.updated_at = self.inner.clock.now();
        self.save(draft.clone());
        Ok(draft)
    }

    /// Starts tracking a draft returned by [`create`](Self::create) with its
    /// first edit.
    pub async fn start(&self, mut draft: DraftEntity, patch: ReportPatch) -> DraftEntity {
        patch.apply(&mut draft);
        draft.updated_at = self.inner.clock.now();
        self.save(draft.clone());
        draft
    }

    /// Fails without touching the draft once the attachment limit is hit.
    #[instrument(skip(self, blob), fields(draft_id = %id))]
    pub async fn attach_blob(&self, id: &DraftId, blob: BlobRef) -> Result<BlobId, DraftError> {
        let _edit = self.inner.lock_edits(id).await;
        let mut draft = self
            .load(id)
            .await
            .ok_or_else(|| DraftError::NotFound(id.to_string()))?;

        if draft.attachments.len() >= self.inner.max_attachments {
            return Err(DraftError::AttachmentLimit {
                max: self.inner.max_attachments,
            });
        }

        let now = self.inner.clock.now();
        let blob_id = BlobId::generate();
        if let Some(handle) = self.inner.previews.create(&blob) {
            self.inner.handles().insert(blob_id.clone(), handle);
        }
        draft.attachments.push(DraftAttachment {
            id: blob_id.clone(),
            blob,
            created_at: now,
        });
        draft.updated_at = now;
        self.save(draft);
        Ok(blob_id)
    }

    /// Returns whether the attachment existed.
    #[instrument(skip(self), fields(draft_id = %id))]
    pub async fn remove_blob(&self, id: &DraftId, blob_id: &BlobId) -> Result<bool, DraftError> {
        let _edit = self.inner.lock_edits(id).await;
        let mut draft = self
            .load(id)
            .await
            .ok_or_else(|| DraftError::NotFound(id.to_string()))?;

        let before = draft.attachments.len();
        draft.attachments.retain(|a| &a.id != blob_id);
        if draft.attachments.len() == before {
            return Ok(false);
        }

        self.revoke_preview(blob_id);
        draft.updated_at = self.inner.clock.now();
        self.save(draft);
        Ok(true)
    }

    /// Preview handle for an attachment, recreated from the persisted ref
    /// when the process restarted since it was attached.
    pub async fn preview(&self, id: &DraftId, blob_id: &BlobId) -> Option<String> {
        if let Some(handle) = self.inner.handles().get(blob_id) {
            return Some(handle.clone());
        }
        let draft = self.load(id).await?;
        let attachment = draft.attachments.iter().find(|a| &a.id == blob_id)?;
        let handle = self.inner.previews.create(&attachment.blob)?;
        self.inner.handles().insert(blob_id.clone(), handle.clone());
        Some(handle)
    }

    fn revoke_preview(&self, blob_id: &BlobId) {
        let handle = self.inner.handles().remove(blob_id);
        if let Some(handle) = handle {
            self.inner.previews.revoke(&handle);
        }
    }

    /// Deletes the draft and everything it holds. Used both for user discard
    /// and after the submission was delivered.
    #[instrument(skip(self), fields(draft_id = %id))]
    pub async fn discard(&self, id: &DraftId) {
        let edit = self.inner.lock_edits(id).await;
        let pending = self.inner.pending().remove(id);
        let draft = match pending {
            Some(save) => {
                save.task.abort();
                Some(save.draft)
            }
            None => self.inner.drafts.get(id.as_str()).await,
        };

        if let Some(draft) = &draft {
            for attachment in &draft.attachments {
                self.revoke_preview(&attachment.id);
            }
        }

        self.inner.drafts.delete(id.as_str()).await;
        if let Some(legacy) = &self.inner.legacy {
            legacy.remove(id).await;
        }
        drop(edit);
        self.inner
            .edit_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        info!("draft discarded");
    }

    /// Every persisted draft, pending edits included.
    pub async fn all(&self) -> Vec<DraftEntity> {
        let mut drafts: BTreeMap<DraftId, DraftEntity> = self
            .inner
            .drafts
            .all()
            .await
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        for (id, save) in self.inner.pending().iter() {
            drafts.insert(id.clone(), save.draft.clone());
        }
        drafts.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPreviews {
        created: AtomicUsize,
        revoked: Mutex<Vec<String>>,
    }

    impl PreviewRegistry for CountingPreviews {
        fn create(&self, blob: &BlobRef) -> Option<String> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Some(format!("blob:{}#{n}", blob.uri))
        }

        fn revoke(&self, handle: &str) {
            self.revoked.lock().unwrap().push(handle.to_string());
        }
    }

    fn store() -> LocalStore {
        LocalStore::memory_only(Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000))))
    }

    fn title(t: &str) -> ReportPatch {
        ReportPatch {
            title: Some(t.into()),
            ..ReportPatch::default()
        }
    }

    fn photo(n: u32) -> BlobRef {
        BlobRef::new(format!("file:///photos/{n}.jpg"), "image/jpeg")
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_is_debounced() {
        let store = store();
        let drafts = DraftManager::new(&store, &SyncConfig::default());
        let draft = drafts.start(drafts.create(), title("a")).await;
        let id = draft.id.clone();

        for t in ["ab", "abc", "abcd"] {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drafts.update_field(&id, title(t)).await.unwrap();
        }
        // Nothing written while edits keep arriving
        assert!(store.get(&Collection::Drafts, id.as_str()).await.is_none());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let saved: DraftEntity = store
            .get(&Collection::Drafts, id.as_str())
            .await
            .unwrap()
            .deserialize()
            .unwrap();
        assert_eq!(saved.steps.title.as_deref(), Some("abcd"));
        assert!(!drafts.has_pending_saves());
    }

    #[tokio::test]
    async fn test_load_sees_unsaved_edits() {
        let drafts = DraftManager::new(&store(), &SyncConfig::default());
        let draft = drafts.start(drafts.create(), title("Pothole")).await;
        let loaded = drafts.load(&draft.id).await.unwrap();
        assert_eq!(loaded.steps.title.as_deref(), Some("Pothole"));
    }

    #[tokio::test]
    async fn test_flush_writes_immediately() {
        let store = store();
        let drafts = DraftManager::new(&store, &SyncConfig::default());
        let draft = drafts.start(drafts.create(), title("Streetlight")).await;
        drafts.flush().await;

        assert!(!drafts.has_pending_saves());
        assert!(store.get(&Collection::Drafts, draft.id.as_str()).await.is_some());
    }

    #[tokio::test]
    async fn test_update_unknown_draft() {
        let drafts = DraftManager::new(&store(), &SyncConfig::default());
        let result = drafts.update_field(&DraftId::generate(), title("x")).await;
        assert_matches!(result, Err(DraftError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_attachment_limit_rejects_without_mutation() {
        let previews = Arc::new(CountingPreviews::default());
        let drafts = DraftManager::new(&store(), &SyncConfig::default()).with_previews(previews.clone());
        let draft = drafts.start(drafts.create(), title("Trash")).await;

        for n in 0..3 {
            drafts.attach_blob(&draft.id, photo(n)).await.unwrap();
        }
        let result = drafts.attach_blob(&draft.id, photo(3)).await;
        assert_matches!(result, Err(DraftError::AttachmentLimit { max: 3 }));

        let loaded = drafts.load(&draft.id).await.unwrap();
        assert_eq!(loaded.attachments.len(), 3);
        assert_eq!(previews.created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_remove_blob_revokes_preview() {
        let previews = Arc::new(CountingPreviews::default());
        let drafts = DraftManager::new(&store(), &SyncConfig::default()).with_previews(previews.clone());
        let draft = drafts.start(drafts.create(), title("Graffiti")).await;
        let blob_id = drafts.attach_blob(&draft.id, photo(1)).await.unwrap();

        assert!(drafts.remove_blob(&draft.id, &blob_id).await.unwrap());
        assert!(!drafts.remove_blob(&draft.id, &blob_id).await.unwrap());
        assert_eq!(previews.revoked.lock().unwrap().len(), 1);
        assert!(drafts.load(&draft.id).await.unwrap().attachments.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_edits_are_not_lost() {
        let store = store();
        let previews = Arc::new(CountingPreviews::default());
        let drafts = DraftManager::new(&store, &SyncConfig::default()).with_previews(previews.clone());
        let draft = drafts.start(drafts.create(), title("Flooding")).await;
        drafts.flush().await;

        let tasks: Vec<_> = (0..3)
            .map(|n| {
                let drafts = drafts.clone();
                let id = draft.id.clone();
                tokio::spawn(async move { drafts.attach_blob(&id, photo(n)).await.unwrap() })
            })
            .collect();
        let edit = {
            let drafts = drafts.clone();
            let id = draft.id.clone();
            tokio::spawn(async move {
                drafts
                    .update_field(
                        &id,
                        ReportPatch {
                            description: Some("Water on the road".into()),
                            ..ReportPatch::default()
                        },
                    )
                    .await
                    .unwrap()
            })
        };

        let mut blob_ids = Vec::new();
        for task in tasks {
            blob_ids.push(task.await.unwrap());
        }
        edit.await.unwrap();

        let loaded = drafts.load(&draft.id).await.unwrap();
        assert_eq!(loaded.attachments.len(), 3);
        assert!(blob_ids
            .iter()
            .all(|id| loaded.attachments.iter().any(|a| &a.id == id)));
        assert_eq!(loaded.steps.description.as_deref(), Some("Water on the road"));
        assert_eq!(loaded.steps.title.as_deref(), Some("Flooding"));
        assert_eq!(previews.created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_discard_revokes_all_and_deletes() {
        let store = store();
        let previews = Arc::new(CountingPreviews::default());
        let drafts = DraftManager::new(&store, &SyncConfig::default()).with_previews(previews.clone());
        let draft = drafts.start(drafts.create(), title("Bench")).await;
        drafts.attach_blob(&draft.id, photo(1)).await.unwrap();
        drafts.attach_blob(&draft.id, photo(2)).await.unwrap();
        drafts.flush().await;

        drafts.discard(&draft.id).await;
        assert_eq!(previews.revoked.lock().unwrap().len(), 2);
        assert!(drafts.load(&draft.id).await.is_none());
        assert!(store.get(&Collection::Drafts, draft.id.as_str()).await.is_none());
    }

    #[tokio::test]
    async fn test_previews_regenerate_after_restart() {
        let store = store();
        let previews = Arc::new(CountingPreviews::default());
        let drafts = DraftManager::new(&store, &SyncConfig::default()).with_previews(previews.clone());
        let draft = drafts.start(drafts.create(), title("Sign")).await;
        let blob_id = drafts.attach_blob(&draft.id, photo(7)).await.unwrap();
        drafts.flush().await;
        drop(drafts);

        let restarted = DraftManager::new(&store, &SyncConfig::default()).with_previews(previews.clone());
        let handle = restarted.preview(&draft.id, &blob_id).await.unwrap();
        assert!(handle.starts_with("blob:file:///photos/7.jpg"));
        assert_eq!(previews.created.load(Ordering::SeqCst), 2);
        // Cached from here on
        assert_eq!(restarted.preview(&draft.id, &blob_id).await.unwrap(), handle);
        assert_eq!(previews.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_legacy_migration_keeps_source() {
        let store = store();
        let legacy = Arc::new(MemoryLegacySource::new());
        let id = DraftId::new("legacy-1").unwrap();
        legacy.insert(
            id.clone(),
            BTreeMap::from([
                ("category".to_string(), "roads".to_string()),
                ("title".to_string(), "Crack".to_string()),
                ("lat".to_string(), "45.81".to_string()),
                ("lng".to_string(), "15.98".to_string()),
                ("step".to_string(), "2".to_string()),
            ]),
        );

        let drafts = DraftManager::new(&store, &SyncConfig::default()).with_legacy(legacy.clone());
        let draft = drafts.load(&id).await.unwrap();

        assert_eq!(draft.steps.category.as_deref(), Some("roads"));
        assert_eq!(draft.steps.location.map(|l| l.lat()), Some(45.81));
        assert_eq!(draft.current_step, DraftStep::Location);
        assert!(draft.attachments.is_empty());
        assert_eq!(draft.idempotency_key.as_str(), "legacy-legacy-1");
        assert!(legacy.contains(&id));
        assert!(store.get(&Collection::Drafts, "legacy-1").await.is_some());

        // Second load comes from the new store and keeps the same identity
        let again = drafts.load(&id).await.unwrap();
        assert_eq!(again.idempotency_key, draft.idempotency_key);
    }

    #[test]
    fn test_legacy_bad_fields_are_dropped() {
        let id = DraftId::new("legacy-2").unwrap();
        let fields = BTreeMap::from([
            ("title".to_string(), "  ".to_string()),
            ("lat".to_string(), "north".to_string()),
            ("lng".to_string(), "15.0".to_string()),
            ("step".to_string(), "99".to_string()),
        ]);
        let draft = migrate_legacy(&id, &fields, UnixTimeMs(0));
        assert!(draft.steps.title.is_none());
        assert!(draft.steps.location.is_none());
        assert_eq!(draft.current_step, DraftStep::Category);
    }

    #[test]
    fn test_to_submission_requires_title_and_category() {
        let mut draft = DraftEntity::new(DraftId::generate(), UnixTimeMs(0));
        assert_matches!(draft.to_submission(), Err(DraftError::Incomplete(_)));

        draft.steps.category = Some("lighting".into());
        draft.steps.title = Some("Lamp out".into());
        draft.steps.description = Some("   ".into());
        let submission = draft.to_submission().unwrap();
        assert_eq!(submission.title, "Lamp out");
        assert!(submission.description.is_none());
    }
}
