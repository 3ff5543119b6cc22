//! Test utilities shared by unit tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::bus::{BrokerConnection, Fabric, FabricSettings, InMemoryBroker};
use crate::scoring::{SimilarityError, SimilarityScorer};

/// Connected fabric over a fresh in-memory broker.
pub async fn memory_fabric(settings: FabricSettings) -> (InMemoryBroker, Fabric) {
    let broker = InMemoryBroker::recording();
    let connection = Arc::new(BrokerConnection::new(Arc::new(broker.clone())));
    connection.connect().await.expect("in-memory connect");
    (broker, Fabric::new(connection, settings))
}

/// Poll `check` until it returns true or a second elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
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

/// Scorer returning a fixed distance and recording the image pairs it saw.
#[derive(Default)]
pub struct FixedDistance {
    distance: f64,
    calls: Mutex<Vec<(String, String)>>,
}

impl FixedDistance {
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
impl SimilarityScorer for FixedDistance {
    async fn distance(&self, target_image: &str, tag_image: &str) -> Result<f64, SimilarityError> {
        self.calls
            .lock()
            .await
            .push((target_image.to_string(), tag_image.to_string()));
        Ok(self.distance)
    }
}
