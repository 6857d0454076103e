//! Validated identifiers.
//!
//! Every id that ends up as a storage key or an HTTP header goes through one
//! of these newtypes, so validation happens once at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    #[error("{kind} exceeds {max} characters")]
    TooLong { kind: &'static str, max: usize },

    #[error("{kind} contains invalid characters")]
    InvalidChars { kind: &'static str },
}

/// Token-style ids: ascii alphanumerics, `-` and `_`.
fn validate_token(kind: &'static str, id: &str, max: usize) -> Result<(), IdError> {
    if id.is_empty() {
        return Err(IdError::Empty { kind });
    }
    if id.len() > max {
        return Err(IdError::TooLong { kind, max });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(IdError::InvalidChars { kind });
    }
    Ok(())
}

macro_rules! token_id {
    ($(#[$meta:meta])* $name:ident, $max:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            const MAX_LENGTH: usize = $max;

            pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
                let id = id.into().trim().to_string();
                validate_token(stringify!($name), &id, Self::MAX_LENGTH)?;
                Ok(Self(id))
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

token_id!(
    /// Identity of one outbox item.
    OpId,
    128
);
token_id!(
    /// Client-minted deduplication token, sent as the `Idempotency-Key` header.
    ///
    /// Minted once per logical write intent and reused on every retry of it.
    IdempotencyKey,
    128
);
token_id!(DraftId, 128);
token_id!(BlobId, 128);
token_id!(MutationToken, 128);

/// Opaque server-side entity id (report, topic, comment, place).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    const MAX_LENGTH: usize = 256;

    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(IdError::Empty { kind: "RecordId" });
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(IdError::TooLong {
                kind: "RecordId",
                max: Self::MAX_LENGTH,
            });
        }
        // Server ids are opaque, only reject what would break keys or headers
        if id.chars().any(|c| c.is_control() || c == '/' || c == '\\') || id.contains("..") {
            return Err(IdError::InvalidChars { kind: "RecordId" });
        }
        Ok(Self(id))
    }

    /// Temporary id for an entity that only exists locally until the server
    /// confirms it.
    pub fn local() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with("local-")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

/// Mint a fresh idempotency key for a new write intent.
pub fn new_key() -> IdempotencyKey {
    IdempotencyKey::generate()
}
