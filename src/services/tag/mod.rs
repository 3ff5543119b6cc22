//! Tag service: owns the tag store and drives the scoring saga.
//!
//! ```text
//! create_tag ──tag_create──▶ tag store (pending)
//!            └─tag_target──▶ target service ──target_results──▶ score tag
//! ```
//!
//! A tag moves from pending to scored or invalid exactly once. When its
//! target is deleted, `deleteTagsOfTarget` removes every tag of that target.

use std::sync::Arc;

use tracing::{debug, info};

use super::{check_media_type, require, require_image, ServiceError};
use crate::bus::{
    cancel_all, BusError, Fabric, FanoutChannel, HandlerError, PointToPoint, Subscription,
};
use crate::config::ServiceRole;
use crate::model::{DeleteTagsOfTarget, ImageUpload, TagLink, TagRecord, TargetResults, PENDING_SCORE};
use crate::scoring::{compute_score, SimilarityScorer};
use crate::storage::DocumentStore;
use crate::topology::{DELETE_TAGS_OF_TARGET_QUEUE, TAGS_TOPIC, TAG_CREATE, TAG_TARGET, TARGET_RESULTS};

/// A tag submitted for a target.
#[derive(Debug, Clone, Default)]
pub struct NewTag {
    pub tagname: String,
    pub targetname: String,
    /// Caller, becomes the tag's author.
    pub username: String,
    pub image: Option<ImageUpload>,
}

pub struct TagService {
    tags: Arc<dyn DocumentStore<TagRecord>>,
    scorer: Arc<dyn SimilarityScorer>,
    queues: PointToPoint,
    topic: FanoutChannel,
}

impl TagService {
    pub fn new(
        tags: Arc<dyn DocumentStore<TagRecord>>,
        scorer: Arc<dyn SimilarityScorer>,
        fabric: &Fabric,
    ) -> Self {
        Self {
            tags,
            scorer,
            queues: fabric.queues(),
            topic: fabric.topic(ServiceRole::Tag.name()),
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Validate a tag and start the saga with `tag_create` and `tag_target`.
    ///
    /// The target is not checked here. A tag for a missing target stays
    /// pending.
    #[tracing::instrument(name = "tag.create", skip_all, fields(tagname = %request.tagname))]
    pub async fn create_tag(&self, request: NewTag) -> Result<TagRecord, ServiceError> {
        require("tagname", &request.tagname)?;
        require("targetname", &request.targetname)?;
        require("username", &request.username)?;
        let image = require_image(request.image.as_ref())?;

        if self.tags.find(&request.tagname).await?.is_some() {
            return Err(ServiceError::Conflict("Tag name is already in use".to_string()));
        }
        check_media_type(image)?;

        let tag = TagRecord {
            tagname: request.tagname,
            image: image.path.clone(),
            targetname: request.targetname,
            username: request.username,
            score: PENDING_SCORE,
        };
        let link = TagLink {
            tagname: tag.tagname.clone(),
            targetname: tag.targetname.clone(),
        };

        self.topic.publish(TAGS_TOPIC, TAG_CREATE, &tag).await?;
        self.topic.publish(TAGS_TOPIC, TAG_TARGET, &link).await?;

        info!(tagname = %tag.tagname, targetname = %tag.targetname, "Tag submitted");
        Ok(tag)
    }

    pub async fn find_tag(&self, tagname: &str) -> Result<TagRecord, ServiceError> {
        self.tags
            .find(tagname)
            .await?
            .ok_or_else(|| ServiceError::NotFound("tag not found".to_string()))
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    /// `tag_create`: store the pending tag unless its name is taken.
    ///
    /// Runs on its own queue, independent of `target_results`; see
    /// [`TagService::on_target_results`] for the ordering this implies.
    pub async fn on_tag_created(&self, tag: TagRecord) -> Result<(), HandlerError> {
        let tagname = tag.tagname.clone();
        if self.tags.insert(tag).await? {
            info!(tagname = %tagname, "Stored pending tag");
        } else {
            debug!(tagname = %tagname, "Tag already stored");
        }
        Ok(())
    }

    /// `target_results`: compare the tag with its target and record the score.
    ///
    /// `tag_create` and `target_results` are consumed on separate queues, so
    /// nothing orders them. Storing the pending tag before scoring it is best
    /// effort: a result that arrives before its tag is stored fails with
    /// `NotFound` and is dropped, leaving the tag pending once it lands.
    pub async fn on_target_results(&self, fact: TargetResults) -> Result<(), HandlerError> {
        let Some(target) = fact.target else {
            debug!(tagname = %fact.tagname, "No target in result; nothing to score");
            return Ok(());
        };

        let tag = self
            .tags
            .find(&fact.tagname)
            .await?
            .ok_or_else(|| HandlerError::not_found("tag", fact.tagname.clone()))?;
        if !tag.status().is_pending() {
            debug!(tagname = %tag.tagname, score = tag.score, "Tag already scored");
            return Ok(());
        }

        let distance = self.scorer.distance(&target.image, &tag.image).await?;
        let score = compute_score(distance)?;

        self.tags
            .update(
                &tag.tagname,
                Box::new(move |stored: &mut TagRecord| {
                    if stored.status().is_pending() {
                        stored.score = score;
                    }
                }),
            )
            .await?;

        info!(
            tagname = %tag.tagname,
            targetname = %target.targetname,
            distance,
            score,
            "Scored tag"
        );
        Ok(())
    }

    /// `deleteTagsOfTarget`: remove every tag of the deleted target.
    pub async fn on_delete_tags_of_target(&self, fact: DeleteTagsOfTarget) -> Result<(), HandlerError> {
        let Some(target) = fact.target else {
            debug!("No target in deletion; nothing to remove");
            return Ok(());
        };

        let targetname = target.targetname.clone();
        let keys: Vec<String> = self
            .tags
            .find_where(&move |tag: &TagRecord| tag.targetname == targetname)
            .await?
            .into_iter()
            .map(|tag| tag.tagname)
            .collect();

        let removed = self.tags.delete_many(&keys).await?;
        info!(targetname = %target.targetname, removed, "Removed tags of deleted target");
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
            self.topic
                .subscribe(TAGS_TOPIC, TAG_CREATE, move |tag: TagRecord| {
                    let service = Arc::clone(&service);
                    async move { service.on_tag_created(tag).await }
                })
                .await?,
        );

        let service = Arc::clone(self);
        subscriptions.push(
            self.topic
                .subscribe(TAGS_TOPIC, TARGET_RESULTS, move |fact: TargetResults| {
                    let service = Arc::clone(&service);
                    async move { service.on_target_results(fact).await }
                })
                .await?,
        );

        let service = Arc::clone(self);
        subscriptions.push(
            self.queues
                .subscribe(DELETE_TAGS_OF_TARGET_QUEUE, move |fact: DeleteTagsOfTarget| {
                    let service = Arc::clone(&service);
                    async move { service.on_delete_tags_of_target(fact).await }
                })
                .await?,
        );

        Ok(())
    }
}
