//! Server boundary.
//!
//! [`RemoteApi`] is the only way the engine talks to the tenant backend: one
//! dispatch per outbox intent (always with its idempotency key), plus the
//! reads used for targeted refreshes and the reachability probe.

#[cfg(feature = "http")]
pub mod http;
mod memory;

pub use self::memory::{Fault, InMemoryRemote};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::UnixTimeMs;
use crate::ids::IdempotencyKey;
use crate::outbox::OutboxIntent;
use crate::store::{CacheRecord, Collection};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
                | ErrorCategory::NetworkError
                | ErrorCategory::Timeout
        )
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            408 => ErrorCategory::Timeout,
            429 => ErrorCategory::RateLimited,
            400..=499 => ErrorCategory::ClientError,
            500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        }
    }
}

/// How a dispatch response status is treated by the sync engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 409 on an idempotent write: the server already has this mutation.
    Replayed,
    Failed(ErrorCategory),
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        409 => StatusClass::Replayed,
        other => StatusClass::Failed(ErrorCategory::from_status(other)),
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct DispatchError {
    pub category: ErrorCategory,
    pub status: Option<u16>,
    pub code: String,
    pub message: String,
    pub truncated: bool,
}

impl DispatchError {
    const MAX_MESSAGE_LENGTH: usize = 512;
    const MAX_CODE_LENGTH: usize = 64;

    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        let mut code = code.into();

        let truncated =
            message.len() > Self::MAX_MESSAGE_LENGTH || code.len() > Self::MAX_CODE_LENGTH;

        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        truncate_utf8_safe(&mut code, Self::MAX_CODE_LENGTH);

        Self {
            category,
            status: None,
            code,
            message,
            truncated,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NetworkError, "network", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, "timeout", message)
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let mut error = Self::new(
            ErrorCategory::from_status(status),
            format!("http_{status}"),
            message,
        );
        error.status = Some(status);
        error
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    /// The server will never accept this intent as sent.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

/// Authoritative server copy of one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub collection: Collection,
    pub id: String,
    pub payload: serde_json::Value,
    pub etag: Option<String>,
}

impl RemoteRecord {
    pub fn into_cache_record(self, fetched_at: UnixTimeMs) -> CacheRecord {
        CacheRecord::new(self.collection, self.id, self.payload, fetched_at).with_etag(self.etag)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Entity as the server stored it, when the response carried one.
    pub record: Option<RemoteRecord>,
    /// The idempotency key had already been seen.
    pub replayed: bool,
}

/// Tenant backend as seen by the sync engine.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn dispatch(
        &self,
        intent: &OutboxIntent,
        key: &IdempotencyKey,
    ) -> Result<DispatchOutcome, DispatchError>;

    async fn fetch(&self, collection: &Collection, id: &str) -> Result<Option<RemoteRecord>, DispatchError>;

    async fn fetch_collection(&self, collection: &Collection) -> Result<Vec<RemoteRecord>, DispatchError>;

    /// Cheap reachability check.
    async fn ping(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::RateLimited.is_retryable());
        assert!(ErrorCategory::NetworkError.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(!ErrorCategory::ClientError.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(201), StatusClass::Success);
        assert_eq!(classify_status(409), StatusClass::Replayed);
        assert_eq!(
            classify_status(503),
            StatusClass::Failed(ErrorCategory::ServerError)
        );
        assert_eq!(
            classify_status(429),
            StatusClass::Failed(ErrorCategory::RateLimited)
        );
        assert_eq!(
            classify_status(422),
            StatusClass::Failed(ErrorCategory::ClientError)
        );
        assert_eq!(
            classify_status(408),
            StatusClass::Failed(ErrorCategory::Timeout)
        );
    }

    #[test]
    fn test_dispatch_error_marks_truncation() {
        let error = DispatchError::new(ErrorCategory::Unknown, "code", "é".repeat(600));
        assert!(error.truncated);
        assert!(error.message.len() <= DispatchError::MAX_MESSAGE_LENGTH);
        assert!(error.message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_status_error_keeps_status() {
        let error = DispatchError::from_status(400, "bad category");
        assert_eq!(error.status, Some(400));
        assert_eq!(error.code, "http_400");
        assert!(error.is_permanent());
    }
}
