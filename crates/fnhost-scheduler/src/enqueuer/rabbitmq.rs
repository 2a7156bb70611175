// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message broker trigger.
//!
//! Each delivery becomes one event per target bound to its queue. The
//! delivery is acked once every event succeeded and nacked without requeue
//! otherwise, so poison messages go to the broker's dead-letter handling
//! instead of looping.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use fnhost_core::queue::RabbitMqQueue;
use fnhost_core::{EventQueue, QueueService};
use fnhost_protocol::messages::{BrokerMessage, Event, EventType, Header, Target};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Completions, Enqueuer, EnqueuerContext, Outcome, Trigger, enqueue_event};
use crate::error::EnqueuerError;

/// A message handed out by a broker, settled by its tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub message: BrokerMessage,
}

/// Connection to a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Start consuming `queue`. Deliveries stay unacked until settled.
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, EnqueuerError>;

    async fn ack(&self, tag: u64) -> Result<(), EnqueuerError>;

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), EnqueuerError>;
}

/// In-process broker. Used when no external broker is configured and in tests.
#[derive(Default)]
pub struct MemoryBroker {
    next_tag: AtomicU64,
    consumers: DashMap<String, mpsc::UnboundedSender<Delivery>>,
    /// Messages published before anyone consumed their queue.
    pending: DashMap<String, VecDeque<Delivery>>,
    unacked: DashMap<u64, Delivery>,
    acked: Mutex<Vec<Delivery>>,
    dead_lettered: Mutex<Vec<Delivery>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `content` to `queue`. Returns the delivery tag.
    pub fn publish(&self, queue: &str, content: impl Into<Vec<u8>>, headers: Vec<(String, String)>) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            tag,
            message: BrokerMessage {
                id: tag.to_string(),
                queue: queue.to_string(),
                exchange: String::new(),
                routing_key: queue.to_string(),
                content: content.into(),
                headers: headers
                    .into_iter()
                    .map(|(key, value)| Header { key, value })
                    .collect(),
                redelivered: false,
            },
        };
        self.deliver(delivery);
        tag
    }

    fn deliver(&self, delivery: Delivery) {
        let queue = delivery.message.queue.clone();
        let delivery = match self.consumers.get(&queue) {
            Some(consumer) => {
                self.unacked.insert(delivery.tag, delivery.clone());
                match consumer.send(delivery) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(delivery)) => {
                        self.unacked.remove(&delivery.tag);
                        delivery
                    }
                }
            }
            None => delivery,
        };
        self.pending.entry(queue).or_default().push_back(delivery);
    }

    pub async fn acked(&self) -> Vec<Delivery> {
        self.acked.lock().await.clone()
    }

    pub async fn dead_lettered(&self) -> Vec<Delivery> {
        self.dead_lettered.lock().await.clone()
    }

    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    fn settle(&self, tag: u64) -> Result<Delivery, EnqueuerError> {
        self.unacked
            .remove(&tag)
            .map(|(_, delivery)| delivery)
            .ok_or_else(|| EnqueuerError::Broker(format!("unknown delivery tag {}", tag)))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, EnqueuerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.consumers.insert(queue.to_string(), sender);
        if let Some((_, backlog)) = self.pending.remove(queue) {
            for delivery in backlog {
                self.deliver(delivery);
            }
        }
        Ok(receiver)
    }

    async fn ack(&self, tag: u64) -> Result<(), EnqueuerError> {
        let delivery = self.settle(tag)?;
        self.acked.lock().await.push(delivery);
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), EnqueuerError> {
        let mut delivery = self.settle(tag)?;
        if requeue {
            delivery.message.redelivered = true;
            self.deliver(delivery);
        } else {
            self.dead_lettered.lock().await.push(delivery);
        }
        Ok(())
    }
}

struct Shared {
    event_queue: Arc<EventQueue>,
    queue: Arc<RabbitMqQueue>,
    broker: Arc<dyn Broker>,
    completions: Completions,
    /// Broker queue name to bound targets.
    bindings: RwLock<HashMap<String, Vec<Target>>>,
}

impl Shared {
    async fn handle(&self, delivery: Delivery) {
        let targets = self
            .bindings
            .read()
            .await
            .get(&delivery.message.queue)
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            warn!(queue = %delivery.message.queue, tag = delivery.tag, "No target bound, dead-lettering");
            self.settle(delivery.tag, false).await;
            return;
        }

        let outcomes: Vec<_> = targets
            .iter()
            .map(|target| {
                let id = uuid::Uuid::new_v4().to_string();
                self.queue.enqueue(&id, delivery.message.clone());
                let outcome = self.completions.register(&id);
                enqueue_event(&self.event_queue, EventType::Rabbitmq, &id, target);
                outcome
            })
            .collect();

        let succeeded = futures::future::join_all(outcomes)
            .await
            .into_iter()
            .all(|outcome| matches!(outcome, Ok(Outcome::Succeeded)));
        self.settle(delivery.tag, succeeded).await;
    }

    async fn settle(&self, tag: u64, succeeded: bool) {
        let result = if succeeded {
            self.broker.ack(tag).await
        } else {
            self.broker.nack(tag, false).await
        };
        match result {
            Ok(()) => debug!(tag, succeeded, "Delivery settled"),
            Err(e) => warn!(tag, error = %e, "Failed to settle delivery"),
        }
    }
}

pub struct RabbitMqEnqueuer {
    shared: Arc<Shared>,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RabbitMqEnqueuer {
    pub fn new(event_queue: Arc<EventQueue>, broker: Arc<dyn Broker>) -> Self {
        Self {
            shared: Arc::new(Shared {
                event_queue,
                queue: Arc::new(RabbitMqQueue::new()),
                broker,
                completions: Completions::new(),
                bindings: RwLock::new(HashMap::new()),
            }),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn factory(ctx: &EnqueuerContext) -> Arc<dyn Enqueuer> {
        Arc::new(Self::new(ctx.event_queue.clone(), ctx.broker.clone()))
    }

    pub fn queue(&self) -> &Arc<RabbitMqQueue> {
        &self.shared.queue
    }
}

#[async_trait]
impl Enqueuer for RabbitMqEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Rabbitmq
    }

    fn service(&self) -> Option<Arc<dyn QueueService>> {
        Some(self.shared.queue.clone() as Arc<dyn QueueService>)
    }

    async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError> {
        let kind = trigger.kind();
        let Trigger::Rabbitmq { queue } = trigger else {
            return Err(EnqueuerError::Unsupported(kind));
        };

        info!(target = %target.id, queue = %queue, "Broker queue bound");
        self.shared
            .bindings
            .write()
            .await
            .entry(queue.clone())
            .or_default()
            .push(target);

        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(&queue) {
            return Ok(());
        }
        let mut deliveries = self.shared.broker.consume(&queue).await?;
        let shared = self.shared.clone();
        consumers.insert(
            queue,
            tokio::spawn(async move {
                while let Some(delivery) = deliveries.recv().await {
                    let shared = shared.clone();
                    tokio::spawn(async move { shared.handle(delivery).await });
                }
            }),
        );
        Ok(())
    }

    async fn unsubscribe(&self, target_id: &str) -> bool {
        let mut bindings = self.shared.bindings.write().await;
        let mut removed = false;
        let mut emptied = Vec::new();
        for (queue, targets) in bindings.iter_mut() {
            let before = targets.len();
            targets.retain(|t| t.id != target_id);
            removed |= targets.len() != before;
            if targets.is_empty() {
                emptied.push(queue.clone());
            }
        }

        let mut consumers = self.consumers.lock().await;
        for queue in emptied {
            bindings.remove(&queue);
            if let Some(consumer) = consumers.remove(&queue) {
                consumer.abort();
            }
        }
        removed
    }

    fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        self.shared.completions.resolve(&event.id, outcome);
    }

    async fn on_events_are_drained(&self) {
        self.shared.completions.drained().await;
    }

    async fn stop(&self) {
        for (_, consumer) in self.consumers.lock().await.drain() {
            consumer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnhost_core::QueueNotice;
    use fnhost_protocol::RpcServerConfig;
    use fnhost_protocol::messages::Pop;
    use std::time::Duration;

    fn target(id: &str) -> Target {
        Target {
            id: id.into(),
            ..Default::default()
        }
    }

    async fn enqueued(notices: &mut mpsc::UnboundedReceiver<QueueNotice>) -> Event {
        match tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap()
        {
            QueueNotice::Enqueued(event) => event,
            other => panic!("unexpected notice: {:?}", other),
        }
    }

    async fn settled(broker: &MemoryBroker) {
        for _ in 0..100 {
            if broker.unacked() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("delivery was never settled");
    }

    #[tokio::test]
    async fn test_ack_after_every_target_succeeded() {
        let broker = Arc::new(MemoryBroker::new());
        let (event_queue, mut notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = RabbitMqEnqueuer::new(event_queue, broker.clone());
        enqueuer
            .subscribe(target("a"), Trigger::Rabbitmq { queue: "orders".into() })
            .await
            .unwrap();
        enqueuer
            .subscribe(target("b"), Trigger::Rabbitmq { queue: "orders".into() })
            .await
            .unwrap();

        let tag = broker.publish("orders", b"{\"id\":1}".to_vec(), vec![]);
        let first = enqueued(&mut notices).await;
        let second = enqueued(&mut notices).await;

        let message = enqueuer.queue().pop(&Pop { id: first.id.clone() }).unwrap();
        assert_eq!(message.content, b"{\"id\":1}");
        assert_eq!(message.queue, "orders");

        enqueuer.on_event_completed(&first, Outcome::Succeeded);
        tokio::task::yield_now().await;
        assert_eq!(broker.unacked(), 1);

        enqueuer.on_event_completed(&second, Outcome::Succeeded);
        settled(&broker).await;
        let acked = broker.acked().await;
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].tag, tag);
        assert!(broker.dead_lettered().await.is_empty());
    }

    #[tokio::test]
    async fn test_nack_when_any_target_fails() {
        let broker = Arc::new(MemoryBroker::new());
        let (event_queue, mut notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = RabbitMqEnqueuer::new(event_queue, broker.clone());
        enqueuer
            .subscribe(target("a"), Trigger::Rabbitmq { queue: "orders".into() })
            .await
            .unwrap();

        broker.publish("orders", b"x".to_vec(), vec![]);
        let event = enqueued(&mut notices).await;
        enqueuer.on_event_completed(&event, Outcome::TimedOut);

        settled(&broker).await;
        assert!(broker.acked().await.is_empty());
        assert_eq!(broker.dead_lettered().await.len(), 1);
    }

    #[tokio::test]
    async fn test_messages_wait_for_a_consumer() {
        let broker = Arc::new(MemoryBroker::new());
        broker.publish("early", b"1".to_vec(), vec![("x-k".into(), "v".into())]);

        let (event_queue, mut notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = RabbitMqEnqueuer::new(event_queue, broker.clone());
        enqueuer
            .subscribe(target("a"), Trigger::Rabbitmq { queue: "early".into() })
            .await
            .unwrap();

        let event = enqueued(&mut notices).await;
        let message = enqueuer.queue().pop(&Pop { id: event.id }).unwrap();
        assert_eq!(message.headers[0].key, "x-k");
        assert!(enqueuer.unsubscribe("a").await);
    }

    #[tokio::test]
    async fn test_requeue_marks_redelivered() {
        let broker = MemoryBroker::new();
        let mut deliveries = broker.consume("q").await.unwrap();
        let tag = broker.publish("q", b"1".to_vec(), vec![]);

        let first = deliveries.recv().await.unwrap();
        assert!(!first.message.redelivered);
        broker.nack(tag, true).await.unwrap();

        let again = deliveries.recv().await.unwrap();
        assert_eq!(again.tag, tag);
        assert!(again.message.redelivered);
        assert!(broker.ack(999).await.is_err());
    }
}
