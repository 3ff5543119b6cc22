//! Process host: wires stores, services and subscriptions for the
//! configured roles over one broker connection.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bus::{
    cancel_all, init_connection_factory, BrokerConnection, BusError, ConnectionFactory, Fabric, Subscription,
};
use crate::config::{Config, ServiceRole};
use crate::scoring::{HttpSimilarityClient, SimilarityScorer};
use crate::services::{TagService, TargetService, UserService};
use crate::storage::{init_stores, Stores};

/// Running services of one process.
pub struct ServiceHost {
    fabric: Fabric,
    subscriptions: Vec<Subscription>,
    targets: Option<Arc<TargetService>>,
    users: Option<Arc<UserService>>,
    tags: Option<Arc<TagService>>,
}

impl ServiceHost {
    /// Build every collaborator from `config` and start the configured roles.
    ///
    /// The similarity client is only built when the tag role runs.
    pub async fn start(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let factory = init_connection_factory(&config.broker)?;
        let stores = init_stores(&config.storage).await?;
        let scorer = if config.runs(ServiceRole::Tag) {
            let client: Arc<dyn SimilarityScorer> = Arc::new(HttpSimilarityClient::new(config.similarity.clone())?);
            Some(client)
        } else {
            None
        };

        Self::launch(config, factory, stores, scorer).await
    }

    /// Start the configured roles over the given collaborators.
    ///
    /// Fails if the broker cannot be reached; there is no reconnection.
    pub async fn start_with(
        config: &Config,
        factory: Arc<dyn ConnectionFactory>,
        stores: Stores,
        scorer: Arc<dyn SimilarityScorer>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        Self::launch(config, factory, stores, Some(scorer)).await
    }

    async fn launch(
        config: &Config,
        factory: Arc<dyn ConnectionFactory>,
        stores: Stores,
        scorer: Option<Arc<dyn SimilarityScorer>>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        info!(endpoint = %factory.endpoint(), roles = ?config.services, "Starting photohunt");

        let connection = Arc::new(BrokerConnection::new(factory));
        connection.connect().await?;
        let fabric = Fabric::new(connection, config.fabric_settings());

        let mut subscriptions = Vec::new();
        let roles = start_roles(config, &fabric, &stores, scorer, &mut subscriptions).await;
        let (targets, users, tags) = match roles {
            Ok(roles) => roles,
            Err(e) => {
                error!(error = %e, "Failed to start services; stopping started consumers");
                cancel_all(subscriptions);
                if let Err(close) = fabric.connection().close().await {
                    warn!(error = %close, "Failed to close broker connection");
                }
                return Err(e);
            }
        };

        info!(subscriptions = subscriptions.len(), "photohunt started");

        Ok(Self {
            fabric,
            subscriptions,
            targets,
            users,
            tags,
        })
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn targets(&self) -> Option<&Arc<TargetService>> {
        self.targets.as_ref()
    }

    pub fn users(&self) -> Option<&Arc<UserService>> {
        self.users.as_ref()
    }

    pub fn tags(&self) -> Option<&Arc<TagService>> {
        self.tags.as_ref()
    }

    /// Queues this process consumes.
    pub fn consumed_queues(&self) -> Vec<&str> {
        self.subscriptions.iter().map(Subscription::queue).collect()
    }

    /// Stop every consumer and close the broker connection.
    pub async fn shutdown(self) -> Result<(), BusError> {
        for subscription in self.subscriptions {
            if subscription.is_finished() {
                warn!(queue = %subscription.queue(), "Consumer had already stopped");
            }
            subscription.cancel();
        }
        self.fabric.connection().close().await?;
        info!("photohunt stopped");
        Ok(())
    }
}

type Roles = (Option<Arc<TargetService>>, Option<Arc<UserService>>, Option<Arc<TagService>>);

async fn start_roles(
    config: &Config,
    fabric: &Fabric,
    stores: &Stores,
    scorer: Option<Arc<dyn SimilarityScorer>>,
    subscriptions: &mut Vec<Subscription>,
) -> Result<Roles, Box<dyn std::error::Error>> {
    let targets = if config.runs(ServiceRole::Target) {
        let service = Arc::new(TargetService::new(stores.targets.clone(), fabric, &config.deletion));
        subscriptions.extend(service.start().await?);
        Some(service)
    } else {
        None
    };

    let users = if config.runs(ServiceRole::User) {
        let service = Arc::new(UserService::new(stores.users.clone(), fabric));
        subscriptions.extend(service.start().await?);
        Some(service)
    } else {
        None
    };

    let tags = if config.runs(ServiceRole::Tag) {
        let scorer = scorer.ok_or("tag role requires a similarity scorer")?;
        let service = Arc::new(TagService::new(stores.tags.clone(), scorer, fabric));
        subscriptions.extend(service.start().await?);
        Some(service)
    } else {
        None
    };

    Ok((targets, users, tags))
}

#[cfg(test)]
mod tests;
