//! User service: owns the user store and each owner's target list.
//!
//! The target list is a projection kept in sync purely from facts:
//! `userTargets` adds a target, `deleteUserTarget` removes it.

use std::sync::Arc;

use tracing::{debug, info};

use super::{require, ServiceError};
use crate::bus::{cancel_all, BusError, Fabric, HandlerError, PointToPoint, Subscription};
use crate::model::{DeleteUserTarget, TargetRecord, UserRecord};
use crate::storage::DocumentStore;
use crate::topology::{DELETE_USER_TARGET_QUEUE, USER_TARGETS_QUEUE};

/// A user submitted for registration.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub role: String,
}

pub struct UserService {
    users: Arc<dyn DocumentStore<UserRecord>>,
    queues: PointToPoint,
}

impl UserService {
    pub fn new(users: Arc<dyn DocumentStore<UserRecord>>, fabric: &Fabric) -> Self {
        Self {
            users,
            queues: fabric.queues(),
        }
    }

    /// Register a user with an empty target list.
    pub async fn register_user(&self, request: NewUser) -> Result<UserRecord, ServiceError> {
        require("username", &request.username)?;
        require("email", &request.email)?;
        require("role", &request.role)?;

        let user = UserRecord {
            username: request.username,
            email: request.email,
            role: request.role,
            targets: Vec::new(),
        };

        if !self.users.insert(user.clone()).await? {
            return Err(ServiceError::Conflict("Username is already in use".to_string()));
        }

        info!(username = %user.username, "User registered");
        Ok(user)
    }

    pub async fn find_user(&self, username: &str) -> Result<UserRecord, ServiceError> {
        self.users
            .find(username)
            .await?
            .ok_or_else(|| ServiceError::NotFound("user not found".to_string()))
    }

    /// `userTargets`: add a new target to its owner's list.
    pub async fn on_user_target(&self, target: TargetRecord) -> Result<(), HandlerError> {
        let targetname = target.targetname.clone();
        let updated = self
            .users
            .update(
                &target.username,
                Box::new(move |user: &mut UserRecord| {
                    if !user.targets.contains(&targetname) {
                        user.targets.push(targetname);
                    }
                }),
            )
            .await?;

        match updated {
            Some(_) => {
                debug!(username = %target.username, targetname = %target.targetname, "Added target to owner");
                Ok(())
            }
            None => Err(HandlerError::not_found("user", target.username)),
        }
    }

    /// `deleteUserTarget`: remove a target from its owner's list. Repeats are no-ops.
    pub async fn on_delete_user_target(&self, fact: DeleteUserTarget) -> Result<(), HandlerError> {
        let targetname = fact.targetname.clone();
        let updated = self
            .users
            .update(
                &fact.username,
                Box::new(move |user: &mut UserRecord| {
                    user.targets.retain(|t| *t != targetname);
                }),
            )
            .await?;

        match updated {
            Some(_) => {
                debug!(username = %fact.username, targetname = %fact.targetname, "Removed target from owner");
                Ok(())
            }
            None => Err(HandlerError::not_found("user", fact.username)),
        }
    }

    /// Subscribe the consumers this service owns.
    ///
    /// On failure the consumers already started are cancelled.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<Subscription>, BusError> {
        let mut subscriptions = Vec::new();
        match self.subscribe_consumers(&mut subscriptions).await {
            Ok(()) => Ok(subscriptions),
            Err(e) => {
                cancel_all(subscriptions);
                Err(e)
            }
        }
    }

    async fn subscribe_consumers(self: &Arc<Self>, subscriptions: &mut Vec<Subscription>) -> Result<(), BusError> {
        let service = Arc::clone(self);
        subscriptions.push(
            self.queues
                .subscribe(USER_TARGETS_QUEUE, move |target: TargetRecord| {
                    let service = Arc::clone(&service);
                    async move { service.on_user_target(target).await }
                })
                .await?,
        );

        let service = Arc::clone(self);
        subscriptions.push(
            self.queues
                .subscribe(DELETE_USER_TARGET_QUEUE, move |fact: DeleteUserTarget| {
                    let service = Arc::clone(&service);
                    async move { service.on_delete_user_target(fact).await }
                })
                .await?,
        );

        Ok(())
    }
}
