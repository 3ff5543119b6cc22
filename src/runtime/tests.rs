use super::*;
use crate::bus::{ConnectionState, InMemoryBroker, QueueOptions, DEFAULT_EXCHANGE};
use crate::model::TargetRecord;
use crate::topology::{DELETE_TAGS_OF_TARGET_QUEUE, TARGETS_QUEUE};
use crate::test_utils::FixedDistance;

async fn host(config: &Config, broker: &InMemoryBroker) -> ServiceHost {
    ServiceHost::start_with(
        config,
        Arc::new(broker.clone()),
        Stores::in_memory(),
        Arc::new(FixedDistance::new(4.0)),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_all_roles_subscribe_every_queue() {
    let broker = InMemoryBroker::new();
    let host = host(&Config::for_test(), &broker).await;

    let mut queues = host.consumed_queues();
    queues.sort();
    assert_eq!(
        queues,
        vec![
            "deleteTagsOfTarget",
            "deleteUserTarget",
            "tag_create",
            "tag_target",
            "target_results",
            "targets",
            "userTargets",
        ]
    );
    assert!(host.targets().is_some() && host.users().is_some() && host.tags().is_some());
    assert_eq!(broker.open_count(), 1);
}

#[tokio::test]
async fn test_single_role() {
    let broker = InMemoryBroker::new();
    let config = Config {
        services: vec![ServiceRole::User],
        ..Config::for_test()
    };
    let host = host(&config, &broker).await;

    let mut queues = host.consumed_queues();
    queues.sort();
    assert_eq!(queues, vec!["deleteUserTarget", "userTargets"]);
    assert!(host.tags().is_none());
}

#[tokio::test]
async fn test_unreachable_broker_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.set_unreachable(true);

    let result = ServiceHost::start_with(
        &Config::for_test(),
        Arc::new(broker),
        Stores::in_memory(),
        Arc::new(FixedDistance::new(4.0)),
    )
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_shutdown_closes_connection() {
    let broker = InMemoryBroker::new();
    let host = host(&Config::for_test(), &broker).await;
    let connection = Arc::clone(host.fabric().connection());

    host.shutdown().await.unwrap();

    assert_eq!(connection.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_start_from_config_with_memory_broker() {
    let host = ServiceHost::start(&Config::for_test()).await.unwrap();
    assert_eq!(host.consumed_queues().len(), 7);
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_start_stops_consumers_and_closes_connection() {
    let broker = InMemoryBroker::new();
    let channel = broker.open().await.unwrap().create_channel().await.unwrap();
    let conflicting = QueueOptions {
        durable: true,
        exclusive: true,
    };
    channel.declare_queue(DELETE_TAGS_OF_TARGET_QUEUE, conflicting).await.unwrap();
    let stores = Stores::in_memory();

    let result = ServiceHost::start_with(
        &Config::for_test(),
        Arc::new(broker.clone()),
        stores.clone(),
        Arc::new(FixedDistance::new(4.0)),
    )
    .await;
    assert!(result.is_err());

    // The target role started before the tag role failed.
    let moon = TargetRecord {
        targetname: "moon".to_string(),
        description: "d".to_string(),
        placename: "harbour".to_string(),
        image: "uploads/moon.png".to_string(),
        username: "devon".to_string(),
        tags: Vec::new(),
    };
    channel
        .publish(DEFAULT_EXCHANGE, TARGETS_QUEUE, &serde_json::to_vec(&moon).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert!(stores.targets.find("moon").await.unwrap().is_none());
    assert_eq!(broker.open_count(), 2);
}

#[tokio::test]
async fn test_start_without_tag_role_skips_similarity_client() {
    let mut config = Config {
        services: vec![ServiceRole::Target, ServiceRole::User],
        ..Config::for_test()
    };
    config.similarity.url = String::new();

    let host = ServiceHost::start(&config).await.unwrap();

    assert!(host.tags().is_none());
    assert_eq!(host.consumed_queues().len(), 4);
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_with_tag_role_requires_similarity_url() {
    let mut config = Config::for_test();
    config.similarity.url = String::new();

    assert!(ServiceHost::start(&config).await.is_err());
}
