// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Realtime socket messages.
//!
//! Besides the usual mailbox, the queue keeps the outbound channel of every
//! connected client so workers can reply to the client that produced an
//! event (`send`) or to everyone (`sendAll`).

use async_trait::async_trait;
use dashmap::DashMap;
use fnhost_protocol::messages::{Empty, FirehoseMessage, FirehoseSend, Pop};
use fnhost_protocol::rpc::{methods, services};
use prost::Message;
use tokio::sync::mpsc;
use tracing::debug;

use super::Mailbox;
use crate::error::{CoreError, Result};
use crate::service::{QueueService, decode, unknown_method};

/// A named message pushed to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct FirehoseQueue {
    messages: Mailbox<FirehoseMessage>,
    clients: DashMap<String, mpsc::UnboundedSender<Outbound>>,
    /// Event id to the client that produced it.
    origins: DashMap<String, String>,
}

impl FirehoseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected client and return its outbound feed.
    pub fn connect(&self, client_id: impl Into<String>) -> mpsc::UnboundedReceiver<Outbound> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.clients.insert(client_id.into(), sender);
        receiver
    }

    pub fn disconnect(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn pool_size(&self) -> usize {
        self.clients.len()
    }

    pub fn enqueue(&self, id: impl Into<String>, message: FirehoseMessage) {
        let id = id.into();
        if let Some(client) = &message.client {
            self.origins.insert(id.clone(), client.id.clone());
        }
        self.messages.insert(id, message);
    }

    pub fn pop(&self, pop: &Pop) -> Result<FirehoseMessage> {
        self.messages
            .take(&pop.id)
            .ok_or_else(|| CoreError::NoItem { id: pop.id.clone() })
    }

    /// Reply to the client that produced event `message.id`.
    pub fn send(&self, message: FirehoseSend) -> Result<()> {
        let client_id = self
            .origins
            .get(&message.id)
            .map(|origin| origin.value().clone())
            .ok_or_else(|| CoreError::NoItem {
                id: message.id.clone(),
            })?;

        match self.clients.get(&client_id) {
            Some(client) => {
                if client
                    .send(Outbound {
                        name: message.name,
                        data: message.data,
                    })
                    .is_err()
                {
                    debug!(client = %client_id, "client feed closed");
                }
                Ok(())
            }
            None => Err(CoreError::Unavailable {
                reason: format!("client {} disconnected", client_id),
            }),
        }
    }

    /// Push to every connected client.
    pub fn send_all(&self, message: FirehoseSend) -> Result<()> {
        for client in self.clients.iter() {
            let _ = client.send(Outbound {
                name: message.name.clone(),
                data: message.data.clone(),
            });
        }
        Ok(())
    }

    /// Forget which client produced `id`. Called once the event settles.
    pub fn release(&self, id: &str) {
        self.origins.remove(id);
    }

    pub fn size(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl QueueService for FirehoseQueue {
    fn service_name(&self) -> &'static str {
        services::FIREHOSE_QUEUE
    }

    async fn handle(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match method {
            methods::POP => Ok(self.pop(&decode(payload)?)?.encode_to_vec()),
            methods::SEND => {
                self.send(decode(payload)?)?;
                Ok(Empty {}.encode_to_vec())
            }
            methods::SEND_ALL => {
                self.send_all(decode(payload)?)?;
                Ok(Empty {}.encode_to_vec())
            }
            _ => Err(unknown_method(self.service_name(), method)),
        }
    }

    fn discard(&self, id: &str) {
        self.messages.discard(id);
        self.origins.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnhost_protocol::messages::FirehoseClient;

    fn message(client: &str) -> FirehoseMessage {
        FirehoseMessage {
            id: "e-1".into(),
            client: Some(FirehoseClient {
                id: client.into(),
                remote_address: "127.0.0.1".into(),
            }),
            pool_size: 2,
            name: "ping".into(),
            data: "{}".into(),
        }
    }

    fn reply(id: &str) -> FirehoseSend {
        FirehoseSend {
            id: id.into(),
            name: "pong".into(),
            data: "1".into(),
        }
    }

    #[tokio::test]
    async fn test_send_reaches_origin_only() {
        let queue = FirehoseQueue::new();
        let mut alice = queue.connect("alice");
        let mut bob = queue.connect("bob");

        queue.enqueue("e-1", message("alice"));
        queue.pop(&Pop { id: "e-1".into() }).unwrap();
        queue.send(reply("e-1")).unwrap();

        assert_eq!(alice.recv().await.unwrap().name, "pong");
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_all() {
        let queue = FirehoseQueue::new();
        let mut alice = queue.connect("alice");
        let mut bob = queue.connect("bob");
        assert_eq!(queue.pool_size(), 2);

        queue.send_all(reply("e-1")).unwrap();

        assert_eq!(alice.recv().await.unwrap().data, "1");
        assert_eq!(bob.recv().await.unwrap().data, "1");
    }

    #[test]
    fn test_send_after_release() {
        let queue = FirehoseQueue::new();
        let _alice = queue.connect("alice");
        queue.enqueue("e-1", message("alice"));
        queue.release("e-1");

        assert!(matches!(
            queue.send(reply("e-1")),
            Err(CoreError::NoItem { .. })
        ));
    }

    #[test]
    fn test_send_to_disconnected_client() {
        let queue = FirehoseQueue::new();
        let _alice = queue.connect("alice");
        queue.enqueue("e-1", message("alice"));
        queue.disconnect("alice");

        assert!(matches!(
            queue.send(reply("e-1")),
            Err(CoreError::Unavailable { .. })
        ));
    }
}
