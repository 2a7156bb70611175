// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use fnhost_protocol::messages::{BrokerMessage, Pop};
use fnhost_protocol::rpc::{methods, services};
use prost::Message;

use super::Mailbox;
use crate::error::{CoreError, Result};
use crate::service::{QueueService, decode, unknown_method};

/// Broker deliveries waiting for their worker. Acknowledgement happens on
/// the host once the event completes, not through this queue.
#[derive(Debug, Default)]
pub struct RabbitMqQueue {
    messages: Mailbox<BrokerMessage>,
}

impl RabbitMqQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, id: impl Into<String>, message: BrokerMessage) {
        self.messages.insert(id, message);
    }

    pub fn pop(&self, pop: &Pop) -> Result<BrokerMessage> {
        self.messages
            .take(&pop.id)
            .ok_or_else(|| CoreError::NoItem { id: pop.id.clone() })
    }

    pub fn size(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl QueueService for RabbitMqQueue {
    fn service_name(&self) -> &'static str {
        services::RABBITMQ_QUEUE
    }

    async fn handle(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match method {
            methods::POP => Ok(self.pop(&decode(payload)?)?.encode_to_vec()),
            _ => Err(unknown_method(self.service_name(), method)),
        }
    }

    fn discard(&self, id: &str) {
        self.messages.discard(id);
    }
}
