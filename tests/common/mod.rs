//! Shared utilities for integration tests.
//!
//! Runs every role of one process over the in-memory broker and stores.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use photohunt::bus::InMemoryBroker;
use photohunt::config::Config;
use photohunt::model::ImageUpload;
use photohunt::runtime::ServiceHost;
use photohunt::scoring::{SimilarityError, SimilarityScorer};
use photohunt::services::{NewTag, NewTarget, NewUser, TagService, TargetService, UserService};
use photohunt::storage::Stores;

/// Scorer answering one fixed distance, recording each (target, tag) image pair.
pub struct StubScorer {
    distance: f64,
    calls: Mutex<Vec<(String, String)>>,
}

impl StubScorer {
    pub fn new(distance: f64) -> Self {
        Self {
            distance,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SimilarityScorer for StubScorer {
    async fn distance(&self, target_image: &str, tag_image: &str) -> Result<f64, SimilarityError> {
        self.calls
            .lock()
            .await
            .push((target_image.to_string(), tag_image.to_string()));
        Ok(self.distance)
    }
}

/// A running process plus handles to inspect it.
pub struct Fixture {
    pub broker: InMemoryBroker,
    pub scorer: Arc<StubScorer>,
    pub host: ServiceHost,
}

impl Fixture {
    pub fn targets(&self) -> &Arc<TargetService> {
        self.host.targets().expect("target role running")
    }

    pub fn users(&self) -> &Arc<UserService> {
        self.host.users().expect("user role running")
    }

    pub fn tags(&self) -> &Arc<TagService> {
        self.host.tags().expect("tag role running")
    }
}

/// Start all roles with the scorer answering `distance`.
pub async fn start(distance: f64) -> Fixture {
    start_with(Config::for_test(), distance).await
}

pub async fn start_with(config: Config, distance: f64) -> Fixture {
    let broker = InMemoryBroker::recording();
    let scorer = Arc::new(StubScorer::new(distance));
    let host = ServiceHost::start_with(
        &config,
        Arc::new(broker.clone()),
        Stores::in_memory(),
        scorer.clone(),
    )
    .await
    .expect("host should start");

    Fixture {
        broker,
        scorer,
        host,
    }
}

/// Poll `check` until it returns true or two seconds elapse.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let in-flight consumers drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

pub fn user(username: &str) -> NewUser {
    NewUser {
        username: username.to_string(),
        email: format!("{}@example.org", username),
        role: "player".to_string(),
    }
}

pub fn target(targetname: &str, username: &str) -> NewTarget {
    NewTarget {
        targetname: targetname.to_string(),
        description: "the old lighthouse at dusk".to_string(),
        placename: "harbour".to_string(),
        username: username.to_string(),
        image: Some(ImageUpload::new(format!("uploads/{}.png", targetname), "image/png")),
    }
}

pub fn tag(tagname: &str, targetname: &str, username: &str) -> NewTag {
    NewTag {
        tagname: tagname.to_string(),
        targetname: targetname.to_string(),
        username: username.to_string(),
        image: Some(ImageUpload::new(format!("uploads/{}.jpg", tagname), "image/jpeg")),
    }
}
