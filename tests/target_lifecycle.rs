//! Target creation and deletion cascade across the user, target and tag services.

mod common;

use common::{eventually, settle, start, start_with, tag, target, user, Fixture};
use photohunt::bus::DEFAULT_EXCHANGE;
use photohunt::config::Config;
use photohunt::model::{DeleteTagsOfTarget, DeleteUserTarget, TagStatus, TargetRecord};
use photohunt::topology::{DELETE_TAGS_OF_TARGET_QUEUE, DELETE_USER_TARGET_QUEUE, TARGETS_QUEUE, USER_TARGETS_QUEUE};

async fn owner_targets(fixture: &Fixture, username: &str) -> Vec<String> {
    fixture
        .users()
        .find_user(username)
        .await
        .map(|u| u.targets)
        .unwrap_or_default()
}

async fn wait_for_target(fixture: &Fixture, targetname: &str) -> bool {
    let targets = fixture.targets().clone();
    let targetname = targetname.to_string();
    eventually(|| {
        let targets = targets.clone();
        let targetname = targetname.clone();
        async move { targets.find_target(&targetname).await.is_ok() }
    })
    .await
}

async fn wait_for_owner(fixture: &Fixture, username: &str, expected: Vec<String>) -> bool {
    let users = fixture.users().clone();
    let username = username.to_string();
    eventually(|| {
        let users = users.clone();
        let username = username.clone();
        let expected = expected.clone();
        async move {
            users
                .find_user(&username)
                .await
                .map(|u| u.targets == expected)
                .unwrap_or(false)
        }
    })
    .await
}

#[tokio::test]
async fn test_created_target_is_stored_and_listed_under_owner() {
    let fixture = start(4.0).await;
    fixture.users().register_user(user("devon")).await.unwrap();

    let created = fixture.targets().create_target(target("moon", "devon")).await.unwrap();
    assert!(created.tags.is_empty());

    assert!(wait_for_target(&fixture, "moon").await);
    assert!(wait_for_owner(&fixture, "devon", vec!["moon".to_string()]).await);
    assert_eq!(fixture.targets().find_target("moon").await.unwrap(), created);
}

#[tokio::test]
async fn test_delete_cascades_to_owner_and_tags() {
    let fixture = start(4.0).await;
    fixture.users().register_user(user("devon")).await.unwrap();
    fixture.targets().create_target(target("moon", "devon")).await.unwrap();
    assert!(wait_for_owner(&fixture, "devon", vec!["moon".to_string()]).await);
    fixture.tags().create_tag(tag("t1", "moon", "devon")).await.unwrap();

    let tags = fixture.tags().clone();
    assert!(
        eventually(|| {
            let tags = tags.clone();
            async move {
                tags.find_tag("t1")
                    .await
                    .map(|t| t.status() == TagStatus::Scored(20.0))
                    .unwrap_or(false)
            }
        })
        .await
    );

    let deleted = fixture.targets().delete_target("moon", "devon").await.unwrap();
    assert_eq!(deleted.as_ref().map(|t| t.tags.clone()), Some(vec!["t1".to_string()]));

    assert!(wait_for_owner(&fixture, "devon", Vec::new()).await);
    let tags = fixture.tags().clone();
    assert!(
        eventually(|| {
            let tags = tags.clone();
            async move { tags.find_tag("t1").await.is_err() }
        })
        .await,
        "tags of the deleted target should be removed"
    );
    assert_eq!(fixture.targets().find_target("moon").await.unwrap_err().status_code(), 404);

    let cascade: Vec<DeleteTagsOfTarget> = fixture
        .broker
        .published_facts(DEFAULT_EXCHANGE, DELETE_TAGS_OF_TARGET_QUEUE);
    assert_eq!(cascade, vec![DeleteTagsOfTarget { target: deleted }]);
}

#[tokio::test]
async fn test_owner_removal_is_sent_twice_and_applied_once() {
    let fixture = start(4.0).await;
    fixture.users().register_user(user("devon")).await.unwrap();
    fixture.targets().create_target(target("moon", "devon")).await.unwrap();
    fixture.targets().create_target(target("sun", "devon")).await.unwrap();
    assert!(
        wait_for_owner(&fixture, "devon", vec!["moon".to_string(), "sun".to_string()]).await
    );

    fixture.targets().delete_target("moon", "devon").await.unwrap();
    assert!(wait_for_owner(&fixture, "devon", vec!["sun".to_string()]).await);
    settle().await;

    let removals: Vec<DeleteUserTarget> = fixture
        .broker
        .published_facts(DEFAULT_EXCHANGE, DELETE_USER_TARGET_QUEUE);
    let expected = DeleteUserTarget {
        targetname: "moon".to_string(),
        username: "devon".to_string(),
    };
    assert_eq!(removals, vec![expected.clone(), expected]);
    assert_eq!(owner_targets(&fixture, "devon").await, vec!["sun".to_string()]);
}

#[tokio::test]
async fn test_owner_removal_sent_once_when_repeat_disabled() {
    let mut config = Config::for_test();
    config.deletion.duplicate_owner_removal = false;
    let fixture = start_with(config, 4.0).await;
    fixture.users().register_user(user("devon")).await.unwrap();
    fixture.targets().create_target(target("moon", "devon")).await.unwrap();
    assert!(wait_for_target(&fixture, "moon").await);

    fixture.targets().delete_target("moon", "devon").await.unwrap();
    assert!(wait_for_owner(&fixture, "devon", Vec::new()).await);

    let removals: Vec<DeleteUserTarget> = fixture
        .broker
        .published_facts(DEFAULT_EXCHANGE, DELETE_USER_TARGET_QUEUE);
    assert_eq!(removals.len(), 1);
}

#[tokio::test]
async fn test_only_owner_can_delete() {
    let fixture = start(4.0).await;
    fixture.users().register_user(user("devon")).await.unwrap();
    fixture.targets().create_target(target("moon", "devon")).await.unwrap();
    assert!(wait_for_target(&fixture, "moon").await);

    let err = fixture.targets().delete_target("moon", "sam").await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(fixture.targets().find_target("moon").await.is_ok());

    let removals: Vec<DeleteUserTarget> = fixture
        .broker
        .published_facts(DEFAULT_EXCHANGE, DELETE_USER_TARGET_QUEUE);
    assert!(removals.is_empty());
}

#[tokio::test]
async fn test_target_of_unknown_owner_is_stored_without_owner_entry() {
    let fixture = start(4.0).await;

    fixture.targets().create_target(target("moon", "ghost")).await.unwrap();
    assert!(wait_for_target(&fixture, "moon").await);
    settle().await;

    // The owner-list fact is consumed and dropped, not redelivered.
    let announced: Vec<TargetRecord> = fixture.broker.published_facts(DEFAULT_EXCHANGE, USER_TARGETS_QUEUE);
    assert_eq!(announced.len(), 1);
    fixture.users().register_user(user("ghost")).await.unwrap();
    settle().await;
    assert!(owner_targets(&fixture, "ghost").await.is_empty());
}

#[tokio::test]
async fn test_targets_are_stored_in_publish_order() {
    let fixture = start(4.0).await;
    fixture.users().register_user(user("devon")).await.unwrap();
    for name in ["a", "b", "c"] {
        fixture.targets().create_target(target(name, "devon")).await.unwrap();
    }

    let order: Vec<String> = fixture
        .broker
        .published_facts::<TargetRecord>(DEFAULT_EXCHANGE, TARGETS_QUEUE)
        .into_iter()
        .map(|t| t.targetname)
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    assert!(
        wait_for_owner(
            &fixture,
            "devon",
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        )
        .await
    );
    assert!(wait_for_target(&fixture, "c").await);

    let page = fixture.targets().list_targets(2, 2).await.unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.data[0].targetname, "c");
}

#[tokio::test]
async fn test_duplicate_target_name_is_rejected_once_stored() {
    let fixture = start(4.0).await;
    fixture.users().register_user(user("devon")).await.unwrap();
    fixture.targets().create_target(target("moon", "devon")).await.unwrap();
    assert!(wait_for_target(&fixture, "moon").await);

    let again = fixture.targets().create_target(target("moon", "devon")).await;
    assert_eq!(again.unwrap_err().status_code(), 409);
}
