//! Message fabric for fact delivery.
//!
//! This module contains:
//! - Transport traits: `ConnectionFactory`, `Connection`, `Channel`
//! - `BrokerConnection`: the owned, lazily opened broker connection
//! - `PointToPoint` and `FanoutChannel`: the two messaging primitives
//! - `Fabric`: bundles the connection, topology registry and settings
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Deserialize;

pub mod connection;
mod consumer;
pub mod fabric;
pub mod fanout;
pub mod memory;
pub mod point_to_point;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use connection::{BrokerConnection, ConnectionState};
pub use consumer::{cancel_all, Subscription};
pub use fabric::{Fabric, FabricSettings};
pub use fanout::{FanoutChannel, QueueNaming, Topology};
pub use memory::InMemoryBroker;
pub use point_to_point::PointToPoint;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnectionFactory;

/// Default exchange. Publishing to it with a queue name as routing key
/// delivers straight to that queue.
pub const DEFAULT_EXCHANGE: &str = "";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker connection is not established")]
    NotConnected,

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Fact serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Whether a fresh channel might let the operation succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Publish(_) | BusError::Topology(_))
    }
}

/// Errors raised by a consumer while processing a delivered fact.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A referenced entity was missing when the consumer tried to update it.
    /// Logged and dropped; never retried.
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error("Malformed fact: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Republish failed: {0}")]
    Bus(#[from] BusError),

    #[error("Handler failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        HandlerError::NotFound {
            entity,
            key: key.into(),
        }
    }
}

// ============================================================================
// Transport traits
// ============================================================================

/// Opens connections to a broker endpoint.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Human-readable endpoint for logging.
    fn endpoint(&self) -> String;

    /// Open a new connection.
    async fn open(&self) -> Result<Arc<dyn Connection>>;
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Create a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Whether the underlying connection is still usable.
    fn is_open(&self) -> bool;

    /// Close the connection. Open consumers stop receiving.
    async fn close(&self) -> Result<()>;
}

/// Queue declaration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
        }
    }
}

/// A session over a connection, used to declare topology and move messages.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue. Idempotent for matching options.
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()>;

    /// Declare a durable direct exchange. Idempotent.
    async fn declare_direct_exchange(&self, exchange: &str) -> Result<()>;

    /// Bind `queue` to `exchange` under an exact routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Hand a payload to the broker.
    ///
    /// Returns once the broker has accepted the message; does not wait for
    /// any consumer.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Start consuming a queue.
    ///
    /// With `auto_ack` the broker considers each message acknowledged as soon
    /// as it is delivered.
    async fn consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool)
        -> Result<DeliveryStream>;
}

/// Stream of deliveries from one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A single message received from a queue.
pub struct Delivery {
    pub data: Vec<u8>,
    pub routing_key: String,
    /// Set when the broker delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        data: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            data,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// When a delivered fact is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge at delivery time, before the handler runs.
    ///
    /// A handler failure or a crash mid-handler loses the fact: there is no
    /// redelivery and no dead-lettering.
    #[default]
    Auto,
    /// Acknowledge after the handler succeeds. A failed fact is requeued once;
    /// a second failure drops it.
    AfterSuccess,
}

impl AckPolicy {
    pub fn auto_ack(self) -> bool {
        matches!(self, AckPolicy::Auto)
    }
}

/// Processes decoded facts of type `F`.
pub trait FactHandler<F>: Send + Sync + 'static {
    fn handle(&self, fact: F) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fun, Fut> FactHandler<F> for Fun
where
    Fun: Fn(F) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, fact: F) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin((self)(fact))
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build the connection factory for the configured broker.
pub fn init_connection_factory(
    config: &crate::config::BrokerConfig,
) -> std::result::Result<Arc<dyn ConnectionFactory>, Box<dyn std::error::Error>> {
    use crate::config::BrokerType;

    match config.broker_type {
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                Ok(Arc::new(AmqpConnectionFactory::new(&config.url)))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
        BrokerType::Memory => Ok(Arc::new(InMemoryBroker::new())),
    }
}
