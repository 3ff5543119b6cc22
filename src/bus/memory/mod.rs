//! In-memory broker for standalone mode and tests.
//!
//! Mirrors the subset of AMQP semantics the fabric relies on:
//! - the default exchange (`""`) delivers to the queue named by the routing key
//! - direct exchanges deliver to every queue bound under the exact key
//! - unroutable messages are discarded
//! - consumers on one queue compete; each message goes to exactly one of them
//!
//! Requeued messages go to the back of the queue rather than their original
//! position.
//!
//! Published messages are only kept for inspection on a broker built with
//! `InMemoryBroker::recording()`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{
    Acker, BusError, Channel, Connection, ConnectionFactory, Delivery, DeliveryStream,
    QueueOptions, Result, DEFAULT_EXCHANGE,
};

const ENDPOINT: &str = "memory://local";

/// A message as handed to the broker, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Message {
    data: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

struct MemoryQueue {
    options: QueueOptions,
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl MemoryQueue {
    fn new(options: QueueOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            options,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn push(&self, message: Message) {
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.tx.send(message);
    }
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    /// exchange -> routing key -> bound queues
    exchanges: Mutex<HashMap<String, HashMap<String, BTreeSet<String>>>>,
    published: Mutex<Vec<PublishedMessage>>,
    recording: AtomicBool,
    opens: AtomicUsize,
    unreachable: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerState {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.queues).get(name).cloned()
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<MemoryQueue>>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self.queue(routing_key).into_iter().collect());
        }

        let names: Vec<String> = {
            let exchanges = lock(&self.exchanges);
            let bindings = exchanges.get(exchange).ok_or_else(|| {
                BusError::Publish(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            bindings
                .get(routing_key)
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default()
        };

        Ok(names.iter().filter_map(|name| self.queue(name)).collect())
    }
}

/// In-process broker. Clones share the same queues and exchanges.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that keeps every published message for `published()`.
    ///
    /// Memory grows with every publish; meant for tests and inspection.
    pub fn recording() -> Self {
        let broker = Self::new();
        broker.state.recording.store(true, Ordering::SeqCst);
        broker
    }

    /// Make subsequent `open()` calls fail, as if the broker were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of connections opened so far.
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Every message handed to the broker, in publish order. Empty unless
    /// the broker is recording.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state.published).clone()
    }

    /// Decoded payloads published to `exchange` under `routing_key`.
    pub fn published_facts<F: DeserializeOwned>(&self, exchange: &str, routing_key: &str) -> Vec<F> {
        lock(&self.state.published)
            .iter()
            .filter(|m| m.exchange == exchange && m.routing_key == routing_key)
            .filter_map(|m| serde_json::from_slice(&m.data).ok())
            .collect()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state.queues).contains_key(queue)
    }

    /// Queues bound to `exchange` under `routing_key`.
    pub fn bindings(&self, exchange: &str, routing_key: &str) -> BTreeSet<String> {
        lock(&self.state.exchanges)
            .get(exchange)
            .and_then(|bindings| bindings.get(routing_key))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    fn endpoint(&self) -> String {
        ENDPOINT.to_string()
    }

    async fn open(&self) -> Result<Arc<dyn Connection>> {
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(BusError::Connection(format!("{} is unreachable", ENDPOINT)));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(InMemoryConnection {
            state: Arc::clone(&self.state),
            closed: Arc::new(closed),
        }))
    }
}

struct InMemoryConnection {
    state: Arc<BrokerState>,
    // Shared with every channel so consumers outlive the connection handle.
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_open() {
            return Err(BusError::Connection("connection is closed".to_string()));
        }
        Ok(Arc::new(InMemoryChannel {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
        }))
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        info!(endpoint = ENDPOINT, "In-memory connection closed");
        Ok(())
    }
}

struct InMemoryChannel {
    state: Arc<BrokerState>,
    closed: Arc<watch::Sender<bool>>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(BusError::Connection("connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        self.ensure_open()?;
        let mut queues = lock(&self.state.queues);
        match queues.get(queue) {
            Some(existing) if existing.options != options => Err(BusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                queue
            ))),
            Some(_) => Ok(()),
            None => {
                queues.insert(queue.to_string(), Arc::new(MemoryQueue::new(options)));
                debug!(queue = %queue, "Declared queue");
                Ok(())
            }
        }
    }

    async fn declare_direct_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        if exchange == DEFAULT_EXCHANGE {
            return Err(BusError::Topology(
                "ACCESS_REFUSED - the default exchange cannot be redeclared".to_string(),
            ));
        }
        lock(&self.state.exchanges)
            .entry(exchange.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        if self.state.queue(queue).is_none() {
            return Err(BusError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let mut exchanges = lock(&self.state.exchanges);
        let bindings = exchanges.get_mut(exchange).ok_or_else(|| {
            BusError::Topology(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        bindings
            .entry(routing_key.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let targets = self.state.route(exchange, routing_key)?;

        if self.state.recording.load(Ordering::SeqCst) {
            lock(&self.state.published).push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                data: payload.to_vec(),
            });
        }

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message discarded");
        }
        for queue in targets {
            queue.push(Message {
                data: payload.to_vec(),
                routing_key: routing_key.to_string(),
                redelivered: false,
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let queue_ref = self
            .state
            .queue(queue)
            .ok_or_else(|| BusError::Consume(format!("NOT_FOUND - no queue '{}'", queue)))?;
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");
        Ok(delivery_stream(queue_ref, self.closed.subscribe(), auto_ack))
    }
}

fn delivery_stream(
    queue: Arc<MemoryQueue>,
    closed: watch::Receiver<bool>,
    auto_ack: bool,
) -> DeliveryStream {
    stream::unfold((queue, closed), move |(queue, mut closed)| async move {
        if *closed.borrow_and_update() {
            return None;
        }

        let message = {
            let mut rx = queue.rx.lock().await;
            tokio::select! {
                message = rx.recv() => message,
                Ok(()) = closed.changed() => None,
            }
        }?;

        let acker = MemoryAcker {
            queue: Arc::clone(&queue),
            message: message.clone(),
            auto_ack,
        };
        let delivery = Delivery::new(
            message.data,
            message.routing_key,
            message.redelivered,
            Box::new(acker),
        );
        Some((Ok(delivery), (queue, closed)))
    })
    .boxed()
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    message: Message,
    auto_ack: bool,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if self.auto_ack {
            return Err(BusError::Consume(
                "PRECONDITION_FAILED - delivery was auto-acknowledged".to_string(),
            ));
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if self.auto_ack {
            return Err(BusError::Consume(
                "PRECONDITION_FAILED - delivery was auto-acknowledged".to_string(),
            ));
        }
        if requeue {
            self.queue.push(Message {
                redelivered: true,
                ..self.message.clone()
            });
        }
        Ok(())
    }
}
