//! Optimistic local mutations.
//!
//! Every tracked record keeps its last authoritative value (`base`) plus the
//! queue of mutators that have been applied locally but not confirmed. The
//! visible state is always `base` with the queue replayed on top, so a server
//! refresh landing mid-flight never erases a pending change and a rollback
//! restores exactly what the server last said.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cache::ReadCache;
use crate::ids::{IdempotencyKey, MutationToken};
use crate::model::EntityRef;
use crate::outbox::OutboxIntent;
use crate::remote::RemoteRecord;
use crate::store::Collection;

pub type Mutator = Arc<dyn Fn(&mut Value) + Send + Sync>;

type RecordKey = (Collection, String);

struct PendingMutation {
    token: MutationToken,
    mutator: Mutator,
}

struct Tracked {
    /// `None` when the record did not exist before the first local change.
    base: Option<Value>,
    pending: Vec<PendingMutation>,
}

impl Tracked {
    fn visible(&self) -> Option<Value> {
        if self.base.is_none() && self.pending.is_empty() {
            return None;
        }
        let mut value = self.base.clone().unwrap_or(Value::Null);
        for mutation in &self.pending {
            (mutation.mutator)(&mut value);
        }
        Some(value)
    }
}

#[derive(Default)]
struct OverlayState {
    records: HashMap<RecordKey, Tracked>,
    tokens: HashMap<MutationToken, RecordKey>,
    links: HashMap<IdempotencyKey, MutationToken>,
}

/// Pending-mutation bookkeeping shared by the cache (server writes rebase
/// through it) and the reconciler.
#[derive(Default)]
pub struct PendingOverlay {
    state: Mutex<OverlayState>,
}

impl PendingOverlay {
    fn state(&self) -> MutexGuard<'_, OverlayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, key: RecordKey, current: Option<Value>, mutator: Mutator) -> (MutationToken, Option<Value>) {
        let token = MutationToken::generate();
        let mut state = self.state();
        state.tokens.insert(token.clone(), key.clone());
        let tracked = state.records.entry(key).or_insert_with(|| Tracked {
            base: current,
            pending: Vec::new(),
        });
        tracked.pending.push(PendingMutation {
            token: token.clone(),
            mutator,
        });
        (token, tracked.visible())
    }

    /// Removes `token` from its record's queue. With `keep`, its effect is
    /// folded into the base first (or the server value replaces the base).
    fn settle(&self, token: &MutationToken, keep: bool, server: Option<Value>) -> Option<(RecordKey, Option<Value>)> {
        let mut state = self.state();
        let key = state.tokens.remove(token)?;
        state.links.retain(|_, t| t != token);

        let tracked = state.records.get_mut(&key)?;
        let index = tracked.pending.iter().position(|m| &m.token == token)?;
        let mutation = tracked.pending.remove(index);

        if keep {
            match server {
                Some(server) => tracked.base = Some(server),
                None => {
                    let mut base = tracked.base.take().unwrap_or(Value::Null);
                    (mutation.mutator)(&mut base);
                    tracked.base = Some(base);
                }
            }
        }

        let visible = tracked.visible();
        if tracked.pending.is_empty() {
            state.records.remove(&key);
        }
        Some((key, visible))
    }

    /// Value to store for a fresh server copy of `key`.
    pub(crate) fn rebase(&self, collection: &Collection, id: &str, server: Value) -> Value {
        let mut state = self.state();
        match state.records.get_mut(&(collection.clone(), id.to_string())) {
            Some(tracked) => {
                tracked.base = Some(server);
                tracked.visible().unwrap_or(Value::Null)
            }
            None => server,
        }
    }

    pub(crate) fn is_tracked(&self, collection: &Collection, id: &str) -> bool {
        self.state()
            .records
            .contains_key(&(collection.clone(), id.to_string()))
    }

    fn link(&self, key: IdempotencyKey, token: MutationToken) {
        let mut state = self.state();
        if state.tokens.contains_key(&token) {
            state.links.insert(key, token);
        }
    }

    fn take_link(&self, key: &IdempotencyKey) -> Option<MutationToken> {
        self.state().links.remove(key)
    }

    fn pending_count(&self) -> usize {
        self.state().tokens.len()
    }
}

/// Applies UI mutations immediately and settles them once the server answers.
#[derive(Clone)]
pub struct OptimisticReconciler {
    cache: ReadCache,
    overlay: Arc<PendingOverlay>,
    revalidate_delay: Duration,
}

impl OptimisticReconciler {
    pub fn new(cache: ReadCache, revalidate_delay: Duration) -> Self {
        Self {
            overlay: cache.overlay(),
            cache,
            revalidate_delay,
        }
    }

    /// Runs `mutator` against the current local value and makes the result
    /// visible straight away. A record that does not exist yet starts out as
    /// `null`.
    #[instrument(skip(self, mutator))]
    pub async fn apply_optimistic<F>(&self, collection: Collection, id: &str, mutator: F) -> MutationToken
    where
        F: Fn(&mut Value) + Send + Sync + 'static,
    {
        let current = self.cache.get(&collection, id).await.map(|r| r.payload);
        let (token, visible) = self
            .overlay
            .apply((collection.clone(), id.to_string()), current, Arc::new(mutator));
        self.cache.put_local(collection, id, visible).await;
        debug!(%token, "optimistic change applied");
        token
    }

    /// Makes the change permanent. The server copy, when given, replaces the
    /// local base; a server record with a different id (a create) replaces
    /// the local placeholder.
    #[instrument(skip(self, server))]
    pub async fn confirm(&self, token: &MutationToken, server: Option<RemoteRecord>) {
        let Some(key) = self.overlay.state().tokens.get(token).cloned() else {
            debug!("confirm for unknown token");
            return;
        };

        match server {
            Some(record) if record.collection == key.0 && record.id == key.1 => {
                if let Some((key, _)) = self.overlay.settle(token, true, Some(record.payload.clone())) {
                    // Rebases onto anything still pending for this record
                    self.cache.put_server(record).await;
                    self.schedule_refresh(key.0, key.1);
                }
            }
            Some(record) => {
                // Placeholder superseded by the server-assigned record
                if let Some((key, visible)) = self.overlay.settle(token, false, None) {
                    self.cache.put_local(key.0, &key.1, visible).await;
                }
                let (collection, id) = (record.collection.clone(), record.id.clone());
                self.cache.put_server(record).await;
                self.schedule_refresh(collection, id);
            }
            None => {
                if let Some((key, visible)) = self.overlay.settle(token, true, None) {
                    self.cache.put_local(key.0.clone(), &key.1, visible).await;
                    self.schedule_refresh(key.0, key.1);
                }
            }
        }
        info!("optimistic change confirmed");
    }

    /// Undoes the change; the record shows its last server value plus
    /// whatever other changes are still pending.
    #[instrument(skip(self))]
    pub async fn rollback(&self, token: &MutationToken) {
        let Some(key) = self.retract(token).await else {
            debug!("rollback for unknown token");
            return;
        };
        warn!(collection = %key.0, id = %key.1, "optimistic change rolled back");
        self.schedule_refresh(key.0, key.1);
    }

    async fn retract(&self, token: &MutationToken) -> Option<RecordKey> {
        let (key, visible) = self.overlay.settle(token, false, None)?;
        self.cache.put_local(key.0.clone(), &key.1, visible).await;
        Some(key)
    }

    /// Ties a token to the write intent that will settle it. Linking by
    /// idempotency key works before the intent reaches the outbox.
    pub fn link(&self, key: IdempotencyKey, token: MutationToken) {
        self.overlay.link(key, token);
    }

    /// Settles the local change behind a delivered intent.
    ///
    /// Without a linked token (the process restarted since the change was
    /// made) the intent itself says what to clean up. A create answered
    /// without a record, as a replay is, loses its placeholder and the
    /// listing is fetched instead.
    #[instrument(skip(self, intent, server), fields(kind = intent.kind().as_str()))]
    pub async fn settle_delivered(
        &self,
        intent: &OutboxIntent,
        key: &IdempotencyKey,
        server: Option<RemoteRecord>,
    ) {
        let token = self.overlay.take_link(key);
        match (intent.placeholder(), server) {
            (Some(placeholder), None) => {
                match token {
                    Some(token) => {
                        self.retract(&token).await;
                    }
                    None => self.remove_placeholder(&placeholder).await,
                }
                debug!(%placeholder, "create confirmed without a record, refetching listing");
                self.schedule_collection_refresh(placeholder.collection);
            }
            (placeholder, server) => match token {
                Some(token) => self.confirm(&token, server).await,
                None => {
                    if let Some(placeholder) = placeholder {
                        self.remove_placeholder(&placeholder).await;
                    }
                    match server {
                        Some(record) => {
                            let (collection, id) = (record.collection.clone(), record.id.clone());
                            self.cache.put_server(record).await;
                            self.schedule_refresh(collection, id);
                        }
                        None => {
                            let target = intent.target();
                            self.schedule_refresh(target.collection, target.id.as_str().to_string());
                        }
                    }
                }
            },
        }
    }

    /// Undoes the local change behind a dropped intent. Without a linked
    /// token the placeholder is deleted, or the record refetched.
    #[instrument(skip(self, intent), fields(kind = intent.kind().as_str()))]
    pub async fn settle_dropped(&self, intent: &OutboxIntent, key: &IdempotencyKey) {
        if let Some(token) = self.overlay.take_link(key) {
            self.rollback(&token).await;
            return;
        }
        match intent.placeholder() {
            Some(placeholder) => self.remove_placeholder(&placeholder).await,
            None => {
                let target = intent.target();
                self.schedule_refresh(target.collection, target.id.as_str().to_string());
            }
        }
    }

    pub async fn rollback_linked(&self, key: &IdempotencyKey) {
        if let Some(token) = self.overlay.take_link(key) {
            self.rollback(&token).await;
        }
    }

    /// Deletes a placeholder left by an earlier run. One this run still
    /// tracks belongs to its token and stays.
    async fn remove_placeholder(&self, placeholder: &EntityRef) {
        let id = placeholder.id.as_str();
        if self.overlay.is_tracked(&placeholder.collection, id) {
            return;
        }
        debug!(%placeholder, "removing orphaned placeholder");
        self.cache
            .put_local(placeholder.collection.clone(), id, None)
            .await;
    }

    pub fn pending_count(&self) -> usize {
        self.overlay.pending_count()
    }

    /// Fire-and-forget revalidation after the settle delay. Local
    /// placeholders have nothing to fetch.
    fn schedule_refresh(&self, collection: Collection, id: String) {
        if id.starts_with("local-") || !collection.is_entity() {
            return;
        }
        let cache = self.cache.clone();
        let delay = self.revalidate_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = cache.refresh(&collection, &id).await {
                debug!(%collection, id, error = %e, "background refresh failed");
            }
        });
    }

    fn schedule_collection_refresh(&self, collection: Collection) {
        let cache = self.cache.clone();
        let delay = self.revalidate_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = cache.refresh_collection(&collection).await {
                debug!(%collection, error = %e, "background listing refresh failed");
            }
        });
    }
}
