//! Queue, topic and routing-key names shared by every service.

/// New targets for the target store.
pub const TARGETS_QUEUE: &str = "targets";
/// New targets for the owner's target list.
pub const USER_TARGETS_QUEUE: &str = "userTargets";
/// Target removals for the owner's target list.
pub const DELETE_USER_TARGET_QUEUE: &str = "deleteUserTarget";
/// Target removals for the tag store.
pub const DELETE_TAGS_OF_TARGET_QUEUE: &str = "deleteTagsOfTarget";

/// Direct exchange carrying the tag saga.
pub const TAGS_TOPIC: &str = "tags";
/// Pending tag, for the tag store.
pub const TAG_CREATE: &str = "tag_create";
/// Tag claims a target, for the target store.
pub const TAG_TARGET: &str = "tag_target";
/// Linked target ready for scoring, for the tag store.
pub const TARGET_RESULTS: &str = "target_results";
