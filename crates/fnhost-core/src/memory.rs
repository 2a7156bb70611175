// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-replica publish/subscribe over the shared message log.
//!
//! A subscription records the log head *before* `subscribe` returns, so any
//! message published after that point reaches it, no matter which replica
//! published it or how late the subscriber's poll task starts running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::persistence::Persistence;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Append `payload` to `topic`. Returns its position in the log.
    async fn publish(&self, topic: &str, payload: &Value) -> Result<i64, CoreError>;

    /// Receive every message published to `topic` from now on, in log order.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, CoreError>;
}

/// Live feed of one topic. Dropping it stops the feed.
pub struct Subscription {
    receiver: mpsc::Receiver<Value>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Value>, task: JoinHandle<()>) -> Self {
        Self { receiver, task }
    }

    /// Next message, `None` once the feed has stopped.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub poll_interval: Duration,
    /// Rows fetched per poll.
    pub batch_size: i64,
    /// Buffered messages per subscription before the poller waits.
    pub buffer: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            batch_size: 256,
            buffer: 1024,
        }
    }
}

/// [`Transport`] backed by the `memory_messages` log.
pub struct Memory {
    persistence: Arc<dyn Persistence>,
    config: MemoryConfig,
}

impl Memory {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_config(persistence, MemoryConfig::default())
    }

    pub fn with_config(persistence: Arc<dyn Persistence>, config: MemoryConfig) -> Self {
        Self {
            persistence,
            config,
        }
    }
}

#[async_trait]
impl Transport for Memory {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<i64, CoreError> {
        let encoded = serde_json::to_string(payload)?;
        let seq = self
            .persistence
            .append_message(topic, &encoded)
            .await
            .map_err(|e| CoreError::Transport {
                details: e.to_string(),
            })?;
        debug!(topic, seq, "published message");
        Ok(seq)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, CoreError> {
        let mut cursor = self
            .persistence
            .latest_message_seq(topic)
            .await
            .map_err(|e| CoreError::Transport {
                details: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(self.config.buffer);
        let persistence = self.persistence.clone();
        let config = self.config.clone();
        let topic = topic.to_string();

        let task = tokio::spawn(async move {
            loop {
                match persistence
                    .messages_after(&topic, cursor, config.batch_size)
                    .await
                {
                    Ok(rows) => {
                        let full_batch = rows.len() as i64 == config.batch_size;
                        for row in rows {
                            cursor = row.seq;
                            match serde_json::from_str::<Value>(&row.payload) {
                                Ok(value) => {
                                    if tx.send(value).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(topic = %topic, seq = row.seq, error = %e, "skipping undecodable message")
                                }
                            }
                        }
                        if full_batch {
                            continue;
                        }
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "failed to poll message log"),
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(config.poll_interval).await;
            }
        });

        Ok(Subscription::new(rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use serde_json::json;

    async fn memory() -> (Arc<dyn Persistence>, Memory) {
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let memory = Memory::with_config(
            persistence.clone(),
            MemoryConfig {
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
        );
        (persistence, memory)
    }

    async fn next(sub: &mut Subscription) -> Value {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn test_subscriber_receives_messages_published_after_subscribe() {
        let (_, memory) = memory().await;

        memory.publish("topic", &json!({"n": 0})).await.unwrap();
        let mut sub = memory.subscribe("topic").await.unwrap();
        memory.publish("topic", &json!({"n": 1})).await.unwrap();
        memory.publish("topic", &json!({"n": 2})).await.unwrap();

        assert_eq!(next(&mut sub).await, json!({"n": 1}));
        assert_eq!(next(&mut sub).await, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let (_, memory) = memory().await;

        let mut sub = memory.subscribe("a").await.unwrap();
        memory.publish("b", &json!("ignored")).await.unwrap();
        memory.publish("a", &json!("wanted")).await.unwrap();

        assert_eq!(next(&mut sub).await, json!("wanted"));
    }

    #[tokio::test]
    async fn test_two_instances_share_the_log() {
        let (persistence, first) = memory().await;
        let second = Memory::with_config(
            persistence,
            MemoryConfig {
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
        );

        let mut sub = second.subscribe("commands").await.unwrap();
        first.publish("commands", &json!({"op": "set"})).await.unwrap();

        assert_eq!(next(&mut sub).await, json!({"op": "set"}));
    }

    #[tokio::test]
    async fn test_small_batches_are_drained_in_order() {
        let (persistence, _) = memory().await;
        let memory = Memory::with_config(
            persistence,
            MemoryConfig {
                poll_interval: Duration::from_millis(5),
                batch_size: 2,
                buffer: 16,
            },
        );

        let mut sub = memory.subscribe("t").await.unwrap();
        for i in 0..5 {
            memory.publish("t", &json!(i)).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(next(&mut sub).await, json!(i));
        }
    }
}
