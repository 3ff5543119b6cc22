//! Shared handle over the broker connection.

use std::sync::Arc;

use super::{AckPolicy, BrokerConnection, FanoutChannel, PointToPoint, QueueNaming, Topology};

/// Delivery settings applied to every channel created from a `Fabric`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricSettings {
    pub ack_policy: AckPolicy,
    pub queue_naming: QueueNaming,
    /// Retries after the first failed publish attempt.
    pub publish_retries: usize,
}

impl Default for FabricSettings {
    fn default() -> Self {
        Self {
            ack_policy: AckPolicy::Auto,
            queue_naming: QueueNaming::RoutingKey,
            publish_retries: 3,
        }
    }
}

/// Bundles the owned connection, the topology registry and delivery settings.
///
/// Cheap to clone; every service in a process shares one.
#[derive(Clone)]
pub struct Fabric {
    connection: Arc<BrokerConnection>,
    topology: Arc<Topology>,
    settings: FabricSettings,
}

impl Fabric {
    pub fn new(connection: Arc<BrokerConnection>, settings: FabricSettings) -> Self {
        Self {
            connection,
            topology: Arc::new(Topology::new()),
            settings,
        }
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn settings(&self) -> FabricSettings {
        self.settings
    }

    pub fn queues(&self) -> PointToPoint {
        PointToPoint::new(Arc::clone(&self.connection), self.settings)
    }

    /// Fan-out channel subscribing on behalf of `service`.
    pub fn topic(&self, service: &str) -> FanoutChannel {
        FanoutChannel::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.topology),
            self.settings,
            service,
        )
    }
}
