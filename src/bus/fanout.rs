//! Fan-out channel: one topic modelled as a durable direct exchange.
//!
//! Facts are routed to every queue bound under the exact routing key. Which
//! queues a key reaches depends on the `QueueNaming` policy:
//! - `RoutingKey`: the queue is named after the routing key. Every service
//!   subscribing to that key shares the queue and they compete for facts.
//! - `PerService`: each subscribing service gets its own queue
//!   (`{routing_key}.{service}`), so each receives every fact.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::consumer::{self, Subscription};
use super::{BrokerConnection, FabricSettings, FactHandler, QueueOptions, Result};
use crate::utils::retry::publish_with_retry;

/// How subscriber queues are named for a routing key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueNaming {
    /// Queue name equals the routing key (competing consumers across services).
    #[default]
    RoutingKey,
    /// One queue per subscribing service (true multicast).
    PerService,
}

impl QueueNaming {
    pub fn queue_name(self, routing_key: &str, service: &str) -> String {
        match self {
            QueueNaming::RoutingKey => routing_key.to_string(),
            QueueNaming::PerService => format!("{}.{}", routing_key, service),
        }
    }
}

#[derive(Debug, Default)]
struct Binding {
    queues: BTreeSet<String>,
    services: BTreeSet<String>,
}

/// Registry of which queues and services each `(topic, routing_key)` reaches.
///
/// Only covers subscriptions made through this process.
#[derive(Debug, Default)]
pub struct Topology {
    bindings: RwLock<BTreeMap<(String, String), Binding>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription. Returns the services that already shared `queue`.
    fn record(&self, topic: &str, routing_key: &str, queue: &str, service: &str) -> Vec<String> {
        let mut bindings = self
            .bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let binding = bindings
            .entry((topic.to_string(), routing_key.to_string()))
            .or_default();

        let shared = if binding.queues.contains(queue) {
            binding
                .services
                .iter()
                .filter(|s| s.as_str() != service)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        binding.queues.insert(queue.to_string());
        binding.services.insert(service.to_string());
        shared
    }

    /// Queues bound under `routing_key` on `topic`.
    pub fn queues_for(&self, topic: &str, routing_key: &str) -> BTreeSet<String> {
        self.bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(topic.to_string(), routing_key.to_string()))
            .map(|b| b.queues.clone())
            .unwrap_or_default()
    }

    /// Services subscribed under `routing_key` on `topic`.
    pub fn services_for(&self, topic: &str, routing_key: &str) -> BTreeSet<String> {
        self.bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(topic.to_string(), routing_key.to_string()))
            .map(|b| b.services.clone())
            .unwrap_or_default()
    }
}

/// Publishes to and subscribes on direct-exchange topics for one service.
#[derive(Clone)]
pub struct FanoutChannel {
    connection: Arc<BrokerConnection>,
    topology: Arc<Topology>,
    settings: FabricSettings,
    service: String,
}

impl FanoutChannel {
    pub fn new(
        connection: Arc<BrokerConnection>,
        topology: Arc<Topology>,
        settings: FabricSettings,
        service: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            topology,
            settings,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Assert the exchange and route `fact` to every queue bound with `routing_key`.
    ///
    /// A routing key with no bound queue silently discards the fact.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic, routing_key = %routing_key))]
    pub async fn publish<F: Serialize>(&self, topic: &str, routing_key: &str, fact: &F) -> Result<()> {
        let payload = serde_json::to_vec(fact)?;
        let bytes = payload.as_slice();

        publish_with_retry(self.settings.publish_retries, move || async move {
            let channel = self.connection.open_channel().await?;
            channel.declare_direct_exchange(topic).await?;
            channel.publish(topic, routing_key, bytes).await
        })
        .await?;

        debug!(
            topic = %topic,
            routing_key = %routing_key,
            bytes = payload.len(),
            "Published fact"
        );
        Ok(())
    }

    /// Assert a durable, non-exclusive queue for `routing_key`, bind it to
    /// `topic` and run `handler` for every delivered fact.
    pub async fn subscribe<F, H>(&self, topic: &str, routing_key: &str, handler: H) -> Result<Subscription>
    where
        F: DeserializeOwned + Send + 'static,
        H: FactHandler<F>,
    {
        let queue = self
            .settings
            .queue_naming
            .queue_name(routing_key, &self.service);

        let channel = self.connection.open_channel().await?;
        channel.declare_queue(&queue, QueueOptions::default()).await?;
        channel.declare_direct_exchange(topic).await?;
        channel.bind_queue(&queue, topic, routing_key).await?;

        let shared_with = self
            .topology
            .record(topic, routing_key, &queue, &self.service);
        if !shared_with.is_empty() {
            warn!(
                topic = %topic,
                routing_key = %routing_key,
                queue = %queue,
                service = %self.service,
                shared_with = ?shared_with,
                "Routing key queue is shared; services will compete for facts instead of each receiving them"
            );
        }

        info!(
            topic = %topic,
            routing_key = %routing_key,
            queue = %queue,
            service = %self.service,
            "Bound queue to exchange"
        );

        let policy = self.settings.ack_policy;
        let consumer_tag = format!("{}-{}", self.service, Uuid::new_v4());
        let deliveries = channel
            .consume(&queue, &consumer_tag, policy.auto_ack())
            .await?;

        Ok(consumer::spawn::<F, H>(
            queue,
            channel,
            deliveries,
            policy,
            Arc::new(handler),
        ))
    }
}
