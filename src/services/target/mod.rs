//! Target service: owns the target store.
//!
//! Entry points create and delete targets. Consumers persist new targets
//! from `targets` and link tags to targets from `tag_target`, announcing each
//! successful link on `target_results` for the tag saga.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::{check_media_type, require, require_image, ServiceError};
use crate::bus::{cancel_all, BusError, Fabric, FanoutChannel, HandlerError, PointToPoint, Subscription};
use crate::config::{DeletionConfig, ServiceRole};
use crate::model::{DeleteTagsOfTarget, DeleteUserTarget, ImageUpload, TagLink, TargetRecord, TargetResults};
use crate::storage::DocumentStore;
use crate::topology::{
    DELETE_TAGS_OF_TARGET_QUEUE, DELETE_USER_TARGET_QUEUE, TAGS_TOPIC, TAG_TARGET, TARGETS_QUEUE,
    TARGET_RESULTS, USER_TARGETS_QUEUE,
};

/// Page size used when the request asks for none.
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// A target submitted for creation.
#[derive(Debug, Clone, Default)]
pub struct NewTarget {
    pub targetname: String,
    pub description: String,
    pub placename: String,
    /// Caller, becomes the owner.
    pub username: String,
    pub image: Option<ImageUpload>,
}

/// One page of targets, echoing the requested paging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetPage {
    pub count: usize,
    pub page: i64,
    pub size: i64,
    pub data: Vec<TargetRecord>,
}

pub struct TargetService {
    targets: Arc<dyn DocumentStore<TargetRecord>>,
    queues: PointToPoint,
    topic: FanoutChannel,
    duplicate_owner_removal: bool,
}

impl TargetService {
    pub fn new(
        targets: Arc<dyn DocumentStore<TargetRecord>>,
        fabric: &Fabric,
        deletion: &DeletionConfig,
    ) -> Self {
        Self {
            targets,
            queues: fabric.queues(),
            topic: fabric.topic(ServiceRole::Target.name()),
            duplicate_owner_removal: deletion.duplicate_owner_removal,
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Validate a new target and announce it on `targets` and `userTargets`.
    ///
    /// Nothing is stored here; the `targets` consumer persists the record.
    #[tracing::instrument(name = "target.create", skip_all, fields(targetname = %request.targetname))]
    pub async fn create_target(&self, request: NewTarget) -> Result<TargetRecord, ServiceError> {
        require("targetname", &request.targetname)?;
        require("description", &request.description)?;
        require("placename", &request.placename)?;
        require("username", &request.username)?;
        let image = require_image(request.image.as_ref())?;

        if self.targets.find(&request.targetname).await?.is_some() {
            return Err(ServiceError::Conflict("Target name is already in use".to_string()));
        }
        check_media_type(image)?;

        let record = TargetRecord {
            targetname: request.targetname,
            description: request.description,
            placename: request.placename,
            image: image.path.clone(),
            username: request.username,
            tags: Vec::new(),
        };

        self.queues.publish(TARGETS_QUEUE, &record).await?;
        self.queues.publish(USER_TARGETS_QUEUE, &record).await?;

        info!(targetname = %record.targetname, username = %record.username, "Target created");
        Ok(record)
    }

    /// Delete a target owned by `username` and cascade the removal.
    ///
    /// Emits `deleteUserTarget`, then `deleteTagsOfTarget` with the deleted
    /// record, then `deleteUserTarget` again unless that repeat is disabled.
    #[tracing::instrument(name = "target.delete", skip(self))]
    pub async fn delete_target(&self, targetname: &str, username: &str) -> Result<Option<TargetRecord>, ServiceError> {
        match self.targets.find(targetname).await? {
            Some(target) if target.username == username => {}
            _ => return Err(ServiceError::NotFound("Target not found".to_string())),
        }

        let deleted = self.targets.delete(targetname).await?;
        let owner_removal = DeleteUserTarget {
            targetname: targetname.to_string(),
            username: username.to_string(),
        };

        self.queues.publish(DELETE_USER_TARGET_QUEUE, &owner_removal).await?;
        self.queues
            .publish(
                DELETE_TAGS_OF_TARGET_QUEUE,
                &DeleteTagsOfTarget {
                    target: deleted.clone(),
                },
            )
            .await?;
        if self.duplicate_owner_removal {
            self.queues.publish(DELETE_USER_TARGET_QUEUE, &owner_removal).await?;
        }

        info!(targetname = %targetname, username = %username, "Target deleted");
        Ok(deleted)
    }

    pub async fn find_target(&self, targetname: &str) -> Result<TargetRecord, ServiceError> {
        self.targets
            .find(targetname)
            .await?
            .ok_or_else(|| ServiceError::NotFound("target not found".to_string()))
    }

    /// One page of targets. `size <= 0` means 10 and `page <= 0` means 1.
    pub async fn list_targets(&self, page: i64, size: i64) -> Result<TargetPage, ServiceError> {
        let limit = if size <= 0 { DEFAULT_PAGE_SIZE } else { size };
        let page_number = if page <= 0 { 1 } else { page };
        let skip = (page_number - 1).saturating_mul(limit);

        let data = self.targets.list(skip as usize, limit as usize).await?;
        Ok(TargetPage {
            count: data.len(),
            page,
            size,
            data,
        })
    }

    pub async fn targets_by_place(&self, placename: &str) -> Result<Vec<TargetRecord>, ServiceError> {
        let placename = placename.to_string();
        Ok(self
            .targets
            .find_where(&move |target: &TargetRecord| target.placename == placename)
            .await?)
    }

    /// A single field of a target as JSON. Blank or unknown fields are 404.
    pub async fn target_field(&self, targetname: &str, field: &str) -> Result<serde_json::Value, ServiceError> {
        if targetname.is_empty() || field.is_empty() {
            return Err(ServiceError::Validation("targetname and field"));
        }

        let target = self.find_target(targetname).await?;
        let value = serde_json::to_value(&target)
            .ok()
            .and_then(|mut doc| doc.get_mut(field).map(serde_json::Value::take))
            .filter(|value| !is_blank(value));

        value.ok_or_else(|| ServiceError::NotFound("field not found".to_string()))
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    /// `targets`: persist a new target unless its name is taken.
    pub async fn on_target_created(&self, record: TargetRecord) -> Result<(), HandlerError> {
        let targetname = record.targetname.clone();
        if self.targets.insert(record).await? {
            info!(targetname = %targetname, "Stored target");
        } else {
            debug!(targetname = %targetname, "Target already stored");
        }
        Ok(())
    }

    /// `tag_target`: add the tag to its target and pass the target on for scoring.
    pub async fn on_tag_linked(&self, link: TagLink) -> Result<(), HandlerError> {
        let tagname = link.tagname.clone();
        let updated = self
            .targets
            .update(
                &link.targetname,
                Box::new(move |target: &mut TargetRecord| {
                    if !target.tags.contains(&tagname) {
                        target.tags.push(tagname);
                    }
                }),
            )
            .await?;

        let Some(target) = updated else {
            return Err(HandlerError::not_found("target", link.targetname));
        };

        debug!(targetname = %target.targetname, tagname = %link.tagname, "Linked tag to target");
        self.topic
            .publish(
                TAGS_TOPIC,
                TARGET_RESULTS,
                &TargetResults {
                    target: Some(target),
                    tagname: link.tagname,
                },
            )
            .await?;
        Ok(())
    }

    /// Subscribe the consumers this service owns.
    ///
    /// On failure the consumers already started are cancelled.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<Subscription>, BusError> {
        let mut subscriptions = Vec::new();
        match self.subscribe_consumers(&mut subscriptions).await {
            Ok(()) => Ok(subscriptions),
            Err(e) => {
                cancel_all(subscriptions);
                Err(e)
            }
        }
    }

    async fn subscribe_consumers(self: &Arc<Self>, subscriptions: &mut Vec<Subscription>) -> Result<(), BusError> {
        let service = Arc::clone(self);
        subscriptions.push(
            self.queues
                .subscribe(TARGETS_QUEUE, move |record: TargetRecord| {
                    let service = Arc::clone(&service);
                    async move { service.on_target_created(record).await }
                })
                .await?,
        );

        let service = Arc::clone(self);
        subscriptions.push(
            self.topic
                .subscribe(TAGS_TOPIC, TAG_TARGET, move |link: TagLink| {
                    let service = Arc::clone(&service);
                    async move { service.on_tag_linked(link).await }
                })
                .await?,
        );

        Ok(())
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests;
