//! Broker and messaging configuration types.

use serde::Deserialize;

use crate::bus::{AckPolicy, FabricSettings, QueueNaming};

/// Default broker URL when neither config nor `RABBIT_MQ` names one.
pub const DEFAULT_BROKER_URL: &str = "amqp://127.0.0.1:5672";

/// Broker type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// AMQP/RabbitMQ broker.
    #[default]
    Amqp,
    /// In-process broker (no external dependency).
    Memory,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// AMQP connection URL.
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Amqp,
            url: DEFAULT_BROKER_URL.to_string(),
        }
    }
}

/// Delivery semantics shared by every channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// When consumed facts are acknowledged.
    pub ack_policy: AckPolicy,
    /// How fan-out subscriber queues are named.
    pub queue_naming: QueueNaming,
    /// Publish attempts after the first before giving up.
    pub publish_retries: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        let settings = FabricSettings::default();
        Self {
            ack_policy: settings.ack_policy,
            queue_naming: settings.queue_naming,
            publish_retries: settings.publish_retries,
        }
    }
}

impl From<&MessagingConfig> for FabricSettings {
    fn from(config: &MessagingConfig) -> Self {
        Self {
            ack_policy: config.ack_policy,
            queue_naming: config.queue_naming,
            publish_retries: config.publish_retries,
        }
    }
}
