use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{DispatchError, DispatchOutcome, ErrorCategory, RemoteApi, RemoteRecord};
use crate::ids::IdempotencyKey;
use crate::model::EntityRef;
use crate::outbox::{MutationKind, OutboxIntent};
use crate::store::{content_hash, Collection};

/// Injected dispatch failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// 503: retried with backoff.
    Transient,
    /// Given status, expected to be a non-retryable 4xx.
    Reject(u16),
}

impl Fault {
    fn to_error(&self) -> DispatchError {
        match self {
            Fault::Transient => DispatchError::from_status(503, "service unavailable"),
            Fault::Reject(status) => DispatchError::from_status(*status, "rejected"),
        }
    }
}

#[derive(Clone, Debug)]
enum FaultScope {
    Kind(MutationKind),
    Entity(EntityRef),
}

#[derive(Clone, Debug)]
struct FaultRule {
    scope: FaultScope,
    fault: Fault,
    /// `None` keeps failing until cleared.
    remaining: Option<u32>,
}

impl FaultRule {
    fn matches(&self, intent: &OutboxIntent) -> bool {
        match &self.scope {
            FaultScope::Kind(kind) => intent.kind() == *kind,
            FaultScope::Entity(entity) => intent.target() == *entity,
        }
    }
}

#[derive(Default)]
struct ServerState {
    collections: HashMap<Collection, BTreeMap<String, Value>>,
    replays: HashMap<IdempotencyKey, DispatchOutcome>,
    faults: Vec<FaultRule>,
    next_id: u64,
    applied: Vec<(MutationKind, IdempotencyKey)>,
}

impl ServerState {
    fn mint_id(&mut self) -> String {
        self.next_id += 1;
        (100 + self.next_id).to_string()
    }

    fn take_fault(&mut self, intent: &OutboxIntent) -> Option<Fault> {
        let index = self.faults.iter().position(|rule| rule.matches(intent))?;
        let rule = &mut self.faults[index];
        let fault = rule.fault.clone();
        let exhausted = match rule.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(index);
        }
        Some(fault)
    }

    fn record(&self, collection: &Collection, id: &str) -> Option<RemoteRecord> {
        let payload = self.collections.get(collection)?.get(id)?.clone();
        Some(RemoteRecord {
            collection: collection.clone(),
            id: id.to_string(),
            etag: Some(content_hash(&payload)),
            payload,
        })
    }

    fn existing_mut(&mut self, collection: &Collection, id: &str) -> Result<&mut Value, DispatchError> {
        self.collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| DispatchError::from_status(404, format!("{collection}/{id} not found")))
    }

    fn insert(&mut self, collection: Collection, id: &str, payload: Value) {
        self.collections
            .entry(collection)
            .or_default()
            .insert(id.to_string(), payload);
    }

    fn apply(&mut self, intent: &OutboxIntent) -> Result<RemoteRecord, DispatchError> {
        let (collection, id) = match intent {
            OutboxIntent::CreateReport { report, .. } => {
                let id = self.mint_id();
                let mut payload = serde_json::to_value(report)
                    .map_err(|e| DispatchError::from_status(400, e.to_string()))?;
                payload["id"] = json!(id);
                payload["status"] = json!("submitted");
                self.insert(Collection::Reports, &id, payload);
                (Collection::Reports, id)
            }
            OutboxIntent::CreateTopic { topic, .. } => {
                let id = self.mint_id();
                let payload = json!({
                    "id": id,
                    "category": topic.category,
                    "title": topic.title,
                    "body": topic.body,
                    "likes": 0,
                    "liked": false,
                    "comment_count": 0,
                });
                self.insert(Collection::Topics, &id, payload);
                (Collection::Topics, id)
            }
            OutboxIntent::AddComment(comment) => {
                let topic = self.existing_mut(&Collection::Topics, comment.topic_id.as_str())?;
                let count = topic["comment_count"].as_i64().unwrap_or(0);
                topic["comment_count"] = json!(count + 1);

                let id = self.mint_id();
                let payload = json!({
                    "id": id,
                    "topic_id": comment.topic_id.as_str(),
                    "body": comment.body,
                });
                self.insert(Collection::Comments, &id, payload);
                (Collection::Comments, id)
            }
            OutboxIntent::ToggleLike { topic_id, liked } => {
                let topic = self.existing_mut(&Collection::Topics, topic_id.as_str())?;
                let was = topic["liked"].as_bool().unwrap_or(false);
                if was != *liked {
                    let likes = topic["likes"].as_i64().unwrap_or(0);
                    topic["likes"] = json!(if *liked { likes + 1 } else { (likes - 1).max(0) });
                    topic["liked"] = json!(liked);
                }
                (Collection::Topics, topic_id.to_string())
            }
            OutboxIntent::ToggleReaction {
                place_id,
                reaction,
                active,
            } => {
                let place = self.existing_mut(&Collection::Places, place_id.as_str())?;
                let key = reaction.as_str();
                let mine = place["my_reactions"][key].as_bool().unwrap_or(false);
                if mine != *active {
                    let count = place["reactions"][key].as_i64().unwrap_or(0);
                    place["reactions"][key] = json!(if *active { count + 1 } else { (count - 1).max(0) });
                    place["my_reactions"][key] = json!(active);
                }
                (Collection::Places, place_id.to_string())
            }
        };

        self.record(&collection, &id)
            .ok_or_else(|| DispatchError::new(ErrorCategory::Unknown, "missing", "record vanished"))
    }
}

/// Server double with idempotency-key dedup and fault injection.
///
/// Every intent mutates server state at most once per key; a replayed key
/// gets the original outcome back with `replayed = true`.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<ServerState>,
    offline: AtomicBool,
    bodiless_replays: AtomicBool,
    dispatch_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call fails with a network error while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Answers replays the way the HTTP transport sees a 409: no record.
    pub fn set_bodiless_replays(&self, bodiless: bool) {
        self.bodiless_replays.store(bodiless, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn seed(&self, collection: Collection, id: &str, payload: Value) {
        self.state().insert(collection, id, payload);
    }

    pub fn payload(&self, collection: &Collection, id: &str) -> Option<Value> {
        self.state().collections.get(collection)?.get(id).cloned()
    }

    /// Fails every dispatch of `kind` until [`clear_faults`](Self::clear_faults).
    pub fn fail_kind(&self, kind: MutationKind, fault: Fault) {
        self.state().faults.push(FaultRule {
            scope: FaultScope::Kind(kind),
            fault,
            remaining: None,
        });
    }

    /// Fails every dispatch targeting `entity` until cleared.
    pub fn fail_entity(&self, entity: EntityRef, fault: Fault) {
        self.state().faults.push(FaultRule {
            scope: FaultScope::Entity(entity),
            fault,
            remaining: None,
        });
    }

    /// Fails the next `times` dispatches of `kind`.
    pub fn fail_next(&self, kind: MutationKind, fault: Fault, times: u32) {
        if times == 0 {
            return;
        }
        self.state().faults.push(FaultRule {
            scope: FaultScope::Kind(kind),
            fault,
            remaining: Some(times),
        });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Dispatch calls received, replays and failures included.
    pub fn dispatch_calls(&self) -> usize {
        self.dispatch_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Mutations that actually changed server state, in order.
    pub fn applied(&self) -> Vec<(MutationKind, IdempotencyKey)> {
        self.state().applied.clone()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_online(&self) -> Result<(), DispatchError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DispatchError::network("server unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn dispatch(
        &self,
        intent: &OutboxIntent,
        key: &IdempotencyKey,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_online()?;

        let mut state = self.state();
        if let Some(previous) = state.replays.get(key) {
            debug!(idempotency_key = %key, "replayed dispatch");
            let record = if self.bodiless_replays.load(Ordering::SeqCst) {
                None
            } else {
                previous.record.clone()
            };
            return Ok(DispatchOutcome {
                record,
                replayed: true,
            });
        }
        if let Some(fault) = state.take_fault(intent) {
            return Err(fault.to_error());
        }

        let record = state.apply(intent)?;
        let outcome = DispatchOutcome {
            record: Some(record),
            replayed: false,
        };
        state.replays.insert(key.clone(), outcome.clone());
        state.applied.push((intent.kind(), key.clone()));
        Ok(outcome)
    }

    async fn fetch(&self, collection: &Collection, id: &str) -> Result<Option<RemoteRecord>, DispatchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_online()?;
        Ok(self.state().record(collection, id))
    }

    async fn fetch_collection(&self, collection: &Collection) -> Result<Vec<RemoteRecord>, DispatchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_online()?;
        let state = self.state();
        let ids: Vec<String> = state
            .collections
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.record(collection, id))
            .collect())
    }

    async fn ping(&self) -> bool {
        self.check_online().is_ok()
    }
}
