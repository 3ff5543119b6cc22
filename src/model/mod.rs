//! Documents owned by each service and the facts exchanged between them.
//!
//! Field names match the JSON documents already on the wire (`image`,
//! `username`), so facts published by older producers still decode.

use serde::{Deserialize, Serialize};

use crate::storage::Document;

/// Image MIME types accepted for targets and tags.
pub const ACCEPTED_IMAGE_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/jpg"];

/// Score of a tag that has not been compared yet.
pub const PENDING_SCORE: f64 = 0.0;
/// Score of a tag whose image is identical to its target's.
pub const INVALID_SCORE: f64 = -1.0;

/// A photo target. Owned by the target service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub targetname: String,
    pub description: String,
    pub placename: String,
    /// Path of the stored image.
    pub image: String,
    /// Owner.
    pub username: String,
    /// Tags linked to this target, in link order, without duplicates.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Document for TargetRecord {
    const COLLECTION: &'static str = "targets";

    fn key(&self) -> &str {
        &self.targetname
    }
}

/// A user and the projection of the targets they own. Owned by the user service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

impl Document for UserRecord {
    const COLLECTION: &'static str = "users";

    fn key(&self) -> &str {
        &self.username
    }
}

/// A submitted photo for a target. Owned by the tag service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub tagname: String,
    pub image: String,
    pub targetname: String,
    pub username: String,
    /// `0` pending, `(0, 100]` scored, `-1` invalid.
    pub score: f64,
}

impl TagRecord {
    pub fn status(&self) -> TagStatus {
        TagStatus::from_score(self.score)
    }
}

impl Document for TagRecord {
    const COLLECTION: &'static str = "tags";

    fn key(&self) -> &str {
        &self.tagname
    }
}

/// Where a tag is in the scoring saga. `Scored` and `Invalid` are terminal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagStatus {
    Pending,
    Scored(f64),
    Invalid,
}

impl TagStatus {
    pub fn from_score(score: f64) -> Self {
        if score == PENDING_SCORE {
            TagStatus::Pending
        } else if score == INVALID_SCORE {
            TagStatus::Invalid
        } else {
            TagStatus::Scored(score)
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, TagStatus::Pending)
    }
}

/// An uploaded image as handed over by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    /// Where the upload was stored.
    pub path: String,
    pub mime_type: String,
}

impl ImageUpload {
    pub fn new(path: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn has_accepted_type(&self) -> bool {
        ACCEPTED_IMAGE_TYPES
            .iter()
            .any(|accepted| self.mime_type.eq_ignore_ascii_case(accepted))
    }
}

// ============================================================================
// Facts
// ============================================================================

/// Remove a target from its owner's list. Sent on `deleteUserTarget`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUserTarget {
    pub targetname: String,
    pub username: String,
}

/// Delete every tag of a target. Sent on `deleteTagsOfTarget`.
///
/// `target` is `null` when the delete raced another one and found nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTagsOfTarget {
    #[serde(default)]
    pub target: Option<TargetRecord>,
}

/// A tag claims a target. Routed under `tag_target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagLink {
    pub tagname: String,
    pub targetname: String,
}

/// The target a tag was linked to, ready for scoring. Routed under `target_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResults {
    #[serde(default)]
    pub target: Option<TargetRecord>,
    pub tagname: String,
}
