// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AMQP 0.9.1 broker (RabbitMQ) over `lapin`.
//!
//! All queues are consumed on one channel, so delivery tags are unique and
//! can be settled without knowing which queue they came from.

use std::collections::HashMap;

use async_trait::async_trait;
use fnhost_protocol::messages::{BrokerMessage, Header};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rabbitmq::{Broker, Delivery};
use crate::error::EnqueuerError;

pub struct AmqpBroker {
    // Dropping the connection closes the channel.
    _connection: Connection,
    channel: Channel,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AmqpBroker {
    /// Connect to `url` and open the consuming channel. `prefetch` caps the
    /// unacked deliveries the broker hands out at once.
    pub async fn connect(url: &str, prefetch: u16) -> Result<Self, EnqueuerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| EnqueuerError::Broker(format!("connect: {}", e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| EnqueuerError::Broker(format!("create channel: {}", e)))?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| EnqueuerError::Broker(format!("qos: {}", e)))?;

        info!(prefetch, "Connected to AMQP broker");
        Ok(Self {
            _connection: connection,
            channel,
            consumers: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, EnqueuerError> {
        let consumer_tag = format!("fnhost-{}", uuid::Uuid::new_v4().simple());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| EnqueuerError::Broker(format!("consume {}: {}", queue, e)))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = self.channel.clone();
        let queue_name = queue.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(queue = %queue_name, error = %e, "AMQP consumer failed");
                        break;
                    }
                };
                let message = broker_message(
                    &queue_name,
                    delivery.delivery_tag,
                    delivery.exchange.as_str(),
                    delivery.routing_key.as_str(),
                    delivery.redelivered,
                    &delivery.properties,
                    delivery.data,
                );
                let forwarded = Delivery {
                    tag: delivery.delivery_tag,
                    message,
                };
                if sender.send(forwarded).is_err() {
                    break;
                }
            }
            if let Err(e) = channel
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await
            {
                debug!(queue = %queue_name, error = %e, "AMQP consumer cancel failed");
            }
        });

        if let Some(previous) = self.consumers.lock().await.insert(queue.to_string(), task) {
            previous.abort();
        }
        debug!(queue = %queue, "AMQP consumer started");
        Ok(receiver)
    }

    async fn ack(&self, tag: u64) -> Result<(), EnqueuerError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| EnqueuerError::Broker(format!("ack {}: {}", tag, e)))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), EnqueuerError> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| EnqueuerError::Broker(format!("nack {}: {}", tag, e)))
    }
}

/// Message id falls back to the delivery tag when the publisher set none.
fn broker_message(
    queue: &str,
    tag: u64,
    exchange: &str,
    routing_key: &str,
    redelivered: bool,
    properties: &BasicProperties,
    content: Vec<u8>,
) -> BrokerMessage {
    let id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| tag.to_string());
    let headers = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| Header {
                    key: key.as_str().to_string(),
                    value: header_value(value),
                })
                .collect()
        })
        .unwrap_or_default();

    BrokerMessage {
        id,
        queue: queue.to_string(),
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        content,
        headers,
        redelivered,
    }
}

fn header_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::LongInt(n) => n.to_string(),
        AMQPValue::LongLongInt(n) => n.to_string(),
        other => format!("{:?}", other),
    }
}
