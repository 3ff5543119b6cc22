use super::*;
use crate::bus::{FabricSettings, InMemoryBroker, DEFAULT_EXCHANGE};
use crate::model::ImageUpload;
use crate::storage::InMemoryStore;
use crate::test_utils::{eventually, memory_fabric};

struct Harness {
    broker: InMemoryBroker,
    store: Arc<InMemoryStore<TargetRecord>>,
    service: Arc<TargetService>,
}

async fn harness_with(deletion: DeletionConfig) -> Harness {
    let (broker, fabric) = memory_fabric(FabricSettings::default()).await;
    let store: Arc<InMemoryStore<TargetRecord>> = Arc::new(InMemoryStore::new());
    let service = Arc::new(TargetService::new(store.clone(), &fabric, &deletion));
    Harness {
        broker,
        store,
        service,
    }
}

async fn harness() -> Harness {
    harness_with(DeletionConfig::default()).await
}

fn new_target(name: &str) -> NewTarget {
    NewTarget {
        targetname: name.to_string(),
        description: "full moon over the bay".to_string(),
        placename: "harbour".to_string(),
        username: "devon".to_string(),
        image: Some(ImageUpload::new(format!("uploads/{}.png", name), "image/png")),
    }
}

fn record(name: &str, place: &str) -> TargetRecord {
    TargetRecord {
        targetname: name.to_string(),
        description: "d".to_string(),
        placename: place.to_string(),
        image: format!("uploads/{}.png", name),
        username: "devon".to_string(),
        tags: Vec::new(),
    }
}

// ============================================================================
// create_target
// ============================================================================

#[tokio::test]
async fn test_create_publishes_to_both_queues() {
    let h = harness().await;

    let created = h.service.create_target(new_target("moon")).await.unwrap();

    assert!(created.tags.is_empty());
    assert_eq!(created.image, "uploads/moon.png");
    let to_store: Vec<TargetRecord> = h.broker.published_facts(DEFAULT_EXCHANGE, TARGETS_QUEUE);
    let to_owner: Vec<TargetRecord> = h.broker.published_facts(DEFAULT_EXCHANGE, USER_TARGETS_QUEUE);
    assert_eq!(to_store, vec![created.clone()]);
    assert_eq!(to_owner, vec![created]);
    // Persisting is the consumer's job.
    assert!(h.store.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_create_validates_fields_in_order() {
    let h = harness().await;

    let mut request = new_target("");
    request.description.clear();
    assert!(matches!(
        h.service.create_target(request).await,
        Err(ServiceError::Validation("targetname"))
    ));

    let mut request = new_target("moon");
    request.description.clear();
    request.placename.clear();
    assert!(matches!(
        h.service.create_target(request).await,
        Err(ServiceError::Validation("description"))
    ));

    let mut request = new_target("moon");
    request.placename.clear();
    assert!(matches!(
        h.service.create_target(request).await,
        Err(ServiceError::Validation("placename"))
    ));

    let mut request = new_target("moon");
    request.username.clear();
    assert!(matches!(
        h.service.create_target(request).await,
        Err(ServiceError::Validation("username"))
    ));

    let mut request = new_target("moon");
    request.image = None;
    assert!(matches!(
        h.service.create_target(request).await,
        Err(ServiceError::Validation("image"))
    ));

    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn test_create_rejects_unsupported_image() {
    let h = harness().await;
    let mut request = new_target("moon");
    request.image = Some(ImageUpload::new("uploads/moon.gif", "image/gif"));

    let err = h.service.create_target(request).await.unwrap_err();

    assert_eq!(err.status_code(), 400);
    assert!(matches!(err, ServiceError::UnsupportedMediaType(_)));
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn test_duplicate_name_conflicts_before_media_check() {
    let h = harness().await;
    h.store.insert(record("moon", "harbour")).await.unwrap();
    let mut request = new_target("moon");
    request.image = Some(ImageUpload::new("uploads/moon.gif", "image/gif"));

    let err = h.service.create_target(request).await.unwrap_err();

    assert_eq!(err.status_code(), 409);
}

// ============================================================================
// Consumers
// ============================================================================

#[tokio::test]
async fn test_target_created_is_idempotent() {
    let h = harness().await;
    let original = record("moon", "harbour");
    let mut replay = original.clone();
    replay.description = "changed".to_string();

    h.service.on_target_created(original.clone()).await.unwrap();
    h.service.on_target_created(replay).await.unwrap();

    assert_eq!(h.store.snapshot().await, vec![original]);
}

#[tokio::test]
async fn test_tag_link_updates_target_and_announces_result() {
    let h = harness().await;
    h.store.insert(record("moon", "harbour")).await.unwrap();

    h.service
        .on_tag_linked(TagLink {
            tagname: "t1".to_string(),
            targetname: "moon".to_string(),
        })
        .await
        .unwrap();

    let stored = h.store.find("moon").await.unwrap().unwrap();
    assert_eq!(stored.tags, vec!["t1".to_string()]);

    let results: Vec<TargetResults> = h.broker.published_facts(TAGS_TOPIC, TARGET_RESULTS);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tagname, "t1");
    assert_eq!(results[0].target.as_ref(), Some(&stored));
}

#[tokio::test]
async fn test_repeated_tag_link_keeps_tags_unique() {
    let h = harness().await;
    h.store.insert(record("moon", "harbour")).await.unwrap();
    let link = TagLink {
        tagname: "t1".to_string(),
        targetname: "moon".to_string(),
    };

    h.service.on_tag_linked(link.clone()).await.unwrap();
    h.service.on_tag_linked(link).await.unwrap();

    let stored = h.store.find("moon").await.unwrap().unwrap();
    assert_eq!(stored.tags, vec!["t1".to_string()]);
}

#[tokio::test]
async fn test_tag_link_for_missing_target_is_not_found() {
    let h = harness().await;

    let result = h
        .service
        .on_tag_linked(TagLink {
            tagname: "t1".to_string(),
            targetname: "ghost".to_string(),
        })
        .await;

    assert!(matches!(result, Err(HandlerError::NotFound { entity: "target", .. })));
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn test_start_wires_consumers() {
    let h = harness().await;
    let subscriptions = h.service.start().await.unwrap();
    assert_eq!(subscriptions.len(), 2);

    h.service.create_target(new_target("moon")).await.unwrap();

    assert!(eventually(|| async { h.store.find("moon").await.unwrap().is_some() }).await);
}

// ============================================================================
// delete_target
// ============================================================================

#[tokio::test]
async fn test_delete_emits_cascade_in_order() {
    let h = harness().await;
    h.store.insert(record("moon", "harbour")).await.unwrap();

    let deleted = h.service.delete_target("moon", "devon").await.unwrap();

    assert_eq!(deleted, Some(record("moon", "harbour")));
    assert!(h.store.find("moon").await.unwrap().is_none());

    let routed: Vec<String> = h
        .broker
        .published()
        .into_iter()
        .map(|m| m.routing_key)
        .collect();
    assert_eq!(
        routed,
        vec![
            DELETE_USER_TARGET_QUEUE.to_string(),
            DELETE_TAGS_OF_TARGET_QUEUE.to_string(),
            DELETE_USER_TARGET_QUEUE.to_string(),
        ]
    );

    let cascade: Vec<DeleteTagsOfTarget> =
        h.broker.published_facts(DEFAULT_EXCHANGE, DELETE_TAGS_OF_TARGET_QUEUE);
    assert_eq!(cascade[0].target, Some(record("moon", "harbour")));
}

#[tokio::test]
async fn test_delete_without_duplicate_owner_removal() {
    let h = harness_with(DeletionConfig {
        duplicate_owner_removal: false,
    })
    .await;
    h.store.insert(record("moon", "harbour")).await.unwrap();

    h.service.delete_target("moon", "devon").await.unwrap();

    let removals: Vec<DeleteUserTarget> =
        h.broker.published_facts(DEFAULT_EXCHANGE, DELETE_USER_TARGET_QUEUE);
    assert_eq!(removals.len(), 1);
}

#[tokio::test]
async fn test_delete_requires_ownership() {
    let h = harness().await;
    h.store.insert(record("moon", "harbour")).await.unwrap();

    let err = h.service.delete_target("moon", "mallory").await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    let err = h.service.delete_target("ghost", "devon").await.unwrap_err();
    assert_eq!(err.status_code(), 404);

    assert!(h.store.find("moon").await.unwrap().is_some());
    assert!(h.broker.published().is_empty());
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_list_targets_pagination_defaults() {
    let h = harness().await;
    for i in 0..12 {
        h.store
            .insert(record(&format!("t{:02}", i), "harbour"))
            .await
            .unwrap();
    }

    let first = h.service.list_targets(0, 0).await.unwrap();
    assert_eq!(first.count, 10);
    assert_eq!(first.data[0].targetname, "t00");
    assert_eq!((first.page, first.size), (0, 0));

    let second = h.service.list_targets(2, 5).await.unwrap();
    let names: Vec<_> = second.data.iter().map(|t| t.targetname.as_str()).collect();
    assert_eq!(names, vec!["t05", "t06", "t07", "t08", "t09"]);

    let past_end = h.service.list_targets(4, 5).await.unwrap();
    assert_eq!(past_end.count, 0);
}

#[tokio::test]
async fn test_targets_by_place() {
    let h = harness().await;
    h.store.insert(record("moon", "harbour")).await.unwrap();
    h.store.insert(record("sun", "beach")).await.unwrap();
    h.store.insert(record("tide", "harbour")).await.unwrap();

    let found = h.service.targets_by_place("harbour").await.unwrap();
    let names: Vec<_> = found.iter().map(|t| t.targetname.as_str()).collect();
    assert_eq!(names, vec!["moon", "tide"]);
    assert!(h.service.targets_by_place("desert").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_find_target_and_field() {
    let h = harness().await;
    h.store.insert(record("moon", "harbour")).await.unwrap();

    assert_eq!(h.service.find_target("moon").await.unwrap().placename, "harbour");
    assert_eq!(h.service.find_target("ghost").await.unwrap_err().status_code(), 404);

    assert_eq!(
        h.service.target_field("moon", "placename").await.unwrap(),
        serde_json::json!("harbour")
    );
    assert_eq!(
        h.service.target_field("moon", "nonsense").await.unwrap_err().status_code(),
        404
    );
    assert_eq!(h.service.target_field("moon", "").await.unwrap_err().status_code(), 400);
}
