//! Consumer loop shared by both messaging primitives.
//!
//! Each subscription owns one task that drains its delivery stream serially,
//! so a handler is never re-entered for the same subscription.

use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::{AckPolicy, Channel, Delivery, DeliveryStream, FactHandler, HandlerError};

/// Handle to a running consumer task.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the consumer stream has ended or the task was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop consuming. An in-flight handler is dropped at its next await point.
    pub fn cancel(self) {
        self.task.abort();
        debug!(queue = %self.queue, "Subscription cancelled");
    }
}

/// Cancel every subscription, e.g. after a later one failed to start.
pub fn cancel_all(subscriptions: impl IntoIterator<Item = Subscription>) {
    for subscription in subscriptions {
        subscription.cancel();
    }
}

/// Outcome of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Handled,
    Dropped,
    Malformed,
    Failed,
}

pub(crate) fn spawn<F, H>(
    queue: String,
    channel: Arc<dyn Channel>,
    deliveries: DeliveryStream,
    policy: AckPolicy,
    handler: Arc<H>,
) -> Subscription
where
    F: DeserializeOwned + Send + 'static,
    H: FactHandler<F> + ?Sized,
{
    let task_queue = queue.clone();
    let task = tokio::spawn(async move {
        // The channel must outlive its consumer.
        let _channel = channel;
        run::<F, H>(task_queue, deliveries, policy, handler).await;
    });
    Subscription { queue, task }
}

async fn run<F, H>(queue: String, mut deliveries: DeliveryStream, policy: AckPolicy, handler: Arc<H>)
where
    F: DeserializeOwned + Send + 'static,
    H: FactHandler<F> + ?Sized,
{
    info!(queue = %queue, ack_policy = ?policy, "Consumer started");

    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(queue = %queue, error = %e, "Consumer delivery error, stopping");
                break;
            }
        };

        let span = tracing::info_span!(
            "bus.consume",
            queue = %queue,
            routing_key = %delivery.routing_key
        );
        let outcome = process::<F, H>(&queue, &delivery, handler.as_ref())
            .instrument(span)
            .await;
        settle(&queue, policy, &delivery, outcome).await;
    }

    info!(queue = %queue, "Consumer stream ended");
}

async fn process<F, H>(queue: &str, delivery: &Delivery, handler: &H) -> Outcome
where
    F: DeserializeOwned + Send + 'static,
    H: FactHandler<F> + ?Sized,
{
    let fact: F = match serde_json::from_slice(&delivery.data) {
        Ok(fact) => fact,
        Err(e) => {
            error!(queue = %queue, error = %e, "Failed to decode fact");
            return Outcome::Malformed;
        }
    };

    match handler.handle(fact).await {
        Ok(()) => {
            debug!(queue = %queue, "Fact handled");
            Outcome::Handled
        }
        Err(e @ HandlerError::NotFound { .. }) => {
            warn!(queue = %queue, error = %e, "Referenced entity missing, fact dropped");
            Outcome::Dropped
        }
        Err(HandlerError::Malformed(e)) => {
            error!(queue = %queue, error = %e, "Fact rejected by handler as malformed");
            Outcome::Malformed
        }
        Err(e) => {
            error!(queue = %queue, error = %e, "Handler failed");
            Outcome::Failed
        }
    }
}

async fn settle(queue: &str, policy: AckPolicy, delivery: &Delivery, outcome: Outcome) {
    let result = match (policy, outcome) {
        (AckPolicy::Auto, Outcome::Failed) => {
            // Acknowledged at delivery; nothing can bring it back.
            warn!(queue = %queue, "Fact was auto-acknowledged before failure and is lost");
            Ok(())
        }
        (AckPolicy::Auto, _) => Ok(()),
        (AckPolicy::AfterSuccess, Outcome::Handled | Outcome::Dropped) => delivery.ack().await,
        (AckPolicy::AfterSuccess, Outcome::Malformed) => delivery.nack(false).await,
        (AckPolicy::AfterSuccess, Outcome::Failed) => {
            let requeue = !delivery.redelivered;
            if !requeue {
                warn!(queue = %queue, "Fact failed after redelivery, dropping");
            }
            delivery.nack(requeue).await
        }
    };

    if let Err(e) = result {
        error!(queue = %queue, error = %e, "Failed to settle delivery");
    }
}
