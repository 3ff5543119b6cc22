//! Service entry points and fact consumers.
//!
//! Each service owns one store. Entry points validate synchronously and emit
//! facts; consumers apply facts to the owning store and may emit derived
//! facts, forming the target lifecycle and the tag scoring saga.

use crate::bus::BusError;
use crate::model::ImageUpload;
use crate::storage::StoreError;

pub mod tag;
pub mod target;
pub mod user;

pub use tag::{NewTag, TagService};
pub use target::{NewTarget, TargetPage, TargetService};
pub use user::{NewUser, UserService};

/// Errors returned synchronously by entry points.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} is required")]
    Validation(&'static str),

    #[error("Invalid file type {0:?}, it should be png, jpeg, jpg")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Broker failure: {0}")]
    Bus(#[from] BusError),
}

impl ServiceError {
    /// HTTP status the web layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) | ServiceError::UnsupportedMediaType(_) => 400,
            ServiceError::Conflict(_) => 409,
            ServiceError::NotFound(_) => 404,
            ServiceError::Store(_) => 500,
            ServiceError::Bus(_) => 503,
        }
    }
}

/// Fail with `Validation(field)` when `value` is blank.
fn require(field: &'static str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(field));
    }
    Ok(())
}

/// The upload, or `Validation("image")` when none was sent.
fn require_image(image: Option<&ImageUpload>) -> Result<&ImageUpload, ServiceError> {
    match image {
        Some(upload) if !upload.path.trim().is_empty() => Ok(upload),
        _ => Err(ServiceError::Validation("image")),
    }
}

fn check_media_type(image: &ImageUpload) -> Result<(), ServiceError> {
    if !image.has_accepted_type() {
        return Err(ServiceError::UnsupportedMediaType(image.mime_type.clone()));
    }
    Ok(())
}
