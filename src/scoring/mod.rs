//! Tag scoring against the target image.
//!
//! The similarity service returns a distance between two images: `0` for
//! identical images, growing as they differ. A tag that simply re-uploads the
//! target's own image is invalid; anything else scores `100 / (distance + 1)`.

use async_trait::async_trait;

use crate::bus::HandlerError;
use crate::model::INVALID_SCORE;

pub mod http;

pub use http::HttpSimilarityClient;

/// Errors from the similarity collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SimilarityError {
    #[error("Similarity service not configured: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Similarity service unavailable: {0}")]
    Unavailable(String),

    #[error("Similarity service rejected the comparison: {0}")]
    Rejected(String),

    #[error("Invalid distance {0}")]
    InvalidDistance(f64),
}

impl From<SimilarityError> for HandlerError {
    fn from(err: SimilarityError) -> Self {
        HandlerError::Failed(Box::new(err))
    }
}

/// Compares two images.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    /// Distance between the target image and the tag image.
    async fn distance(&self, target_image: &str, tag_image: &str) -> Result<f64, SimilarityError>;
}

/// Score for a distance: `-1` when identical, otherwise `100 / (distance + 1)`.
pub fn compute_score(distance: f64) -> Result<f64, SimilarityError> {
    if !distance.is_finite() || distance < 0.0 {
        return Err(SimilarityError::InvalidDistance(distance));
    }
    if distance == 0.0 {
        return Ok(INVALID_SCORE);
    }
    Ok(100.0 / (distance + 1.0))
}
