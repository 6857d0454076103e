// lib.rs - Offline-first sync core for the citizen-services client

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod draft;
pub mod engine;
pub mod ids;
pub mod model;
pub mod network;
pub mod outbox;
pub mod reconciler;
pub mod remote;
pub mod store;

pub use cache::{CacheUpdate, ReadCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, UnixTimeMs};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{DropReason, SyncCoordinator, SyncNotice, SyncOutcome};
pub use draft::{DraftEntity, DraftError, DraftManager, DraftStep, ReportPatch};
pub use engine::{Submission, SyncEngine, SyncEngineBuilder, SyncError, SyncStatusSnapshot};
pub use ids::{new_key, BlobId, DraftId, IdempotencyKey, MutationToken, OpId, RecordId};
pub use network::{NetworkEvent, NetworkMonitor};
pub use outbox::{MutationKind, Outbox, OutboxError, OutboxIntent, OutboxItem, RetryInfo};
pub use reconciler::OptimisticReconciler;
pub use remote::{DispatchError, DispatchOutcome, ErrorCategory, InMemoryRemote, RemoteApi, RemoteRecord};
pub use store::{CacheRecord, Collection, LocalStore, StoreError};
