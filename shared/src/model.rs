use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::ids::RecordId;
use crate::store::Collection;

pub const MAX_TITLE_LENGTH: usize = 200;
pub const MAX_BODY_LENGTH: usize = 8_192;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid coordinate: lat={0}, lng={1}")]
    InvalidCoordinate(f64, f64),

    #[error("{field} too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} is required")]
    Missing(&'static str),
}

/// Validated lat/lon
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    lat: f64,
    lng: f64,
}

impl LatLon {
    pub fn new(lat: f64, lng: f64) -> Result<Self, ValidationError> {
        if !lat.is_finite()
            || !lng.is_finite()
            || !(-90.0..=90.0).contains(&lat)
            || !(-180.0..=180.0).contains(&lng)
        {
            return Err(ValidationError::InvalidCoordinate(lat, lng));
        }
        Ok(Self { lat, lng })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lng(&self) -> f64 {
        self.lng
    }
}

/// Don't store image bytes. Store a handle/URI/path.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    pub uri: String,
    pub content_type: String,
    pub size_bytes: Option<u64>,
}

impl BlobRef {
    pub fn new(uri: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content_type: content_type.into(),
            size_bytes: None,
        }
    }

    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }
}

/// Opaque pointer at one server entity: references across namespaces are by
/// id only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub collection: Collection,
    pub id: RecordId,
}

impl EntityRef {
    pub fn new(collection: Collection, id: RecordId) -> Self {
        Self { collection, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection.prefix(), self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Like,
    Love,
    Wow,
    Visited,
}

impl ReactionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Love => "love",
            Self::Wow => "wow",
            Self::Visited => "visited",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct ReportSubmission {
    pub category: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<LatLon>,
    pub address: Option<String>,
    pub is_anonymous: bool,
    pub attachments: Vec<BlobRef>,
}

impl ReportSubmission {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.category.trim().is_empty() {
            return Err(ValidationError::Missing("category"));
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::Missing("title"));
        }
        check_len("title", &self.title, MAX_TITLE_LENGTH)?;
        if let Some(description) = &self.description {
            check_len("description", description, MAX_BODY_LENGTH)?;
        }
        Ok(())
    }
}

// Redact debug output because this can contain sensitive user-provided data.
impl fmt::Debug for ReportSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportSubmission")
            .field("category", &self.category)
            .field("title_len", &self.title.len())
            .field("description_present", &self.description.is_some())
            .field("location_present", &self.location.is_some())
            .field("is_anonymous", &self.is_anonymous)
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TopicSubmission {
    pub category: String,
    pub title: String,
    pub body: String,
}

impl TopicSubmission {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::Missing("title"));
        }
        check_len("title", &self.title, MAX_TITLE_LENGTH)?;
        check_len("body", &self.body, MAX_BODY_LENGTH)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommentSubmission {
    pub topic_id: RecordId,
    /// Placeholder id of the optimistic comment shown until the server
    /// assigns a real one.
    pub local_id: RecordId,
    pub body: String,
}

impl CommentSubmission {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.body.trim().is_empty() {
            return Err(ValidationError::Missing("body"));
        }
        check_len("body", &self.body, MAX_BODY_LENGTH)
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latlon_validation() {
        assert!(LatLon::new(0.0, 0.0).is_ok());
        assert!(LatLon::new(90.0, 180.0).is_ok());
        assert!(LatLon::new(-90.0, -180.0).is_ok());
        assert!(LatLon::new(91.0, 0.0).is_err());
        assert!(LatLon::new(0.0, 181.0).is_err());
        assert!(LatLon::new(f64::NAN, 0.0).is_err());
        assert!(LatLon::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_report_validation() {
        let mut report = ReportSubmission {
            category: "roads".into(),
            title: "Pothole on Main St".into(),
            description: None,
            location: None,
            address: None,
            is_anonymous: false,
            attachments: Vec::new(),
        };
        assert!(report.validate().is_ok());

        report.title = "x".repeat(MAX_TITLE_LENGTH + 1);
        assert!(matches!(
            report.validate(),
            Err(ValidationError::TooLong { field: "title", .. })
        ));

        report.title = "  ".into();
        assert_eq!(report.validate(), Err(ValidationError::Missing("title")));
    }

    #[test]
    fn test_report_debug_redacts_text() {
        let report = ReportSubmission {
            category: "lighting".into(),
            title: "Broken lamp near my house at 12 Elm".into(),
            description: Some("private details".into()),
            location: None,
            address: None,
            is_anonymous: true,
            attachments: Vec::new(),
        };
        let debug = format!("{report:?}");
        assert!(!debug.contains("Elm"));
        assert!(!debug.contains("private details"));
    }

    #[test]
    fn test_entity_ref_display() {
        let entity = EntityRef::new(Collection::Topics, RecordId::new("7").unwrap());
        assert_eq!(entity.to_string(), "topics/7");
    }
}
