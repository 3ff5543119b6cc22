//! Point-to-point channel: durable named queues with competing consumers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::consumer::{self, Subscription};
use super::{BrokerConnection, FabricSettings, FactHandler, QueueOptions, Result, DEFAULT_EXCHANGE};
use crate::utils::retry::publish_with_retry;

/// Publishes facts to, and consumes facts from, named durable queues.
#[derive(Clone)]
pub struct PointToPoint {
    connection: Arc<BrokerConnection>,
    settings: FabricSettings,
}

impl PointToPoint {
    pub fn new(connection: Arc<BrokerConnection>, settings: FabricSettings) -> Self {
        Self {
            connection,
            settings,
        }
    }

    /// Declare `queue` (durable, idempotent) and hand `fact` to the broker.
    ///
    /// Returns once the broker has accepted the message. Whether a consumer
    /// ever persists it is outside this guarantee.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(queue = %queue))]
    pub async fn publish<F: Serialize>(&self, queue: &str, fact: &F) -> Result<()> {
        let payload = serde_json::to_vec(fact)?;
        let bytes = payload.as_slice();

        publish_with_retry(self.settings.publish_retries, move || async move {
            let channel = self.connection.open_channel().await?;
            channel.declare_queue(queue, QueueOptions::default()).await?;
            channel.publish(DEFAULT_EXCHANGE, queue, bytes).await
        })
        .await?;

        debug!(queue = %queue, bytes = payload.len(), "Published fact");
        Ok(())
    }

    /// Declare `queue` and run `handler` for every delivered fact.
    ///
    /// Deliveries are handled one at a time in delivery order. Several
    /// subscriptions on one queue split its stream between them.
    pub async fn subscribe<F, H>(&self, queue: &str, handler: H) -> Result<Subscription>
    where
        F: DeserializeOwned + Send + 'static,
        H: FactHandler<F>,
    {
        let channel = self.connection.open_channel().await?;
        channel.declare_queue(queue, QueueOptions::default()).await?;

        let policy = self.settings.ack_policy;
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let deliveries = channel
            .consume(queue, &consumer_tag, policy.auto_ack())
            .await?;

        if policy.auto_ack() {
            warn!(
                queue = %queue,
                "Auto-ack enabled: facts are acknowledged before handling and lost if the handler fails"
            );
        }

        Ok(consumer::spawn::<F, H>(
            queue.to_string(),
            channel,
            deliveries,
            policy,
            Arc::new(handler),
        ))
    }
}
