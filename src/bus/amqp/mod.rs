//! AMQP (RabbitMQ) transport.
//!
//! Point-to-point facts go through the default exchange; topics are durable
//! direct exchanges. Publishing channels run in confirm mode so a publish only
//! returns once the broker has taken responsibility for the message.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::{
    Acker, BusError, Channel, Connection, ConnectionFactory, Delivery, DeliveryStream,
    QueueOptions, Result,
};

/// Reply code sent when closing a connection normally.
const REPLY_SUCCESS: u16 = 200;

/// Opens AMQP connections to one broker URL.
#[derive(Clone, Debug)]
pub struct AmqpConnectionFactory {
    url: String,
}

impl AmqpConnectionFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Strip credentials from an AMQP URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}{}", &url[..scheme + 3], &url[at + 1..]),
        _ => url.to_string(),
    }
}

#[async_trait]
impl ConnectionFactory for AmqpConnectionFactory {
    fn endpoint(&self) -> String {
        redact(&self.url)
    }

    async fn open(&self) -> Result<Arc<dyn Connection>> {
        let conn = lapin::Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;
        Ok(Arc::new(AmqpConnection { conn }))
    }
}

struct AmqpConnection {
    conn: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        Ok(Arc::new(AmqpChannel {
            channel,
            confirming: tokio::sync::OnceCell::new(),
        }))
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.conn
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
    confirming: tokio::sync::OnceCell<()>,
}

impl AmqpChannel {
    async fn ensure_confirms(&self) -> Result<()> {
        self.confirming
            .get_or_try_init(|| async {
                self.channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(|e| BusError::Publish(format!("Failed to enable confirms: {}", e)))
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare queue '{}': {}", queue, e)))?;
        Ok(())
    }

    async fn declare_direct_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Topology(format!("Failed to declare exchange '{}': {}", exchange, e))
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to bind queue '{}': {}", queue, e)))?;

        info!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Bound queue");
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_confirms().await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        match confirm {
            Confirmation::Nack(_) => Err(BusError::Publish("Broker rejected message".to_string())),
            _ => {
                debug!(exchange = %exchange, routing_key = %routing_key, "Broker confirmed publish");
                Ok(())
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| {
                        Delivery::new(
                            d.data,
                            d.routing_key.as_str(),
                            d.redelivered,
                            Box::new(AmqpAcker(d.acker)),
                        )
                    })
                    .map_err(|e| BusError::Consume(e.to_string()))
            })
            .boxed())
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Consume(format!("Failed to nack: {}", e)))
    }
}
