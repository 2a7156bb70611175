// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command exchange between replicas.

use std::sync::Arc;

use tracing::{debug, warn};

use super::message::CommandMessage;
use crate::error::CoreError;
use crate::memory::{Subscription, Transport};

/// Default topic for replicated commands.
pub const COMMAND_TOPIC: &str = "commands";

/// Returns `true` to keep a message.
pub type CommandFilter = Arc<dyn Fn(&CommandMessage) -> bool + Send + Sync>;

/// Drops messages this replica published itself.
pub fn reject_own(replica_id: &str) -> CommandFilter {
    let replica_id = replica_id.to_string();
    Arc::new(move |msg| msg.source.id != replica_id)
}

/// Drops messages addressed to some other replica.
pub fn accept_addressed(replica_id: &str) -> CommandFilter {
    let replica_id = replica_id.to_string();
    Arc::new(move |msg| msg.target.id.as_deref().is_none_or(|id| id == replica_id))
}

pub struct CommandMessenger {
    transport: Arc<dyn Transport>,
    replica_id: String,
    topic: String,
    filters: Vec<CommandFilter>,
}

impl CommandMessenger {
    pub fn new(transport: Arc<dyn Transport>, replica_id: impl Into<String>) -> Self {
        let replica_id = replica_id.into();
        Self {
            transport,
            filters: vec![reject_own(&replica_id), accept_addressed(&replica_id)],
            replica_id,
            topic: COMMAND_TOPIC.to_string(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Append a filter to the chain. All filters must keep a message.
    pub fn add_filter(&mut self, filter: CommandFilter) {
        self.filters.push(filter);
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Stamp the origin replica and publish.
    pub async fn publish(&self, mut msg: CommandMessage) -> Result<(), CoreError> {
        msg.source.id = self.replica_id.clone();
        let value = serde_json::to_value(&msg)?;
        self.transport.publish(&self.topic, &value).await?;
        debug!(id = %msg.id, class = %msg.source.command.class, "published command");
        Ok(())
    }

    pub async fn subscribe(&self) -> Result<CommandStream, CoreError> {
        Ok(CommandStream {
            subscription: self.transport.subscribe(&self.topic).await?,
            filters: self.filters.clone(),
        })
    }
}

/// Filtered feed of commands from other replicas.
pub struct CommandStream {
    subscription: Subscription,
    filters: Vec<CommandFilter>,
}

impl CommandStream {
    /// Next message that passes every filter. `None` once the feed stops.
    pub async fn next(&mut self) -> Option<CommandMessage> {
        loop {
            let value = self.subscription.recv().await?;
            let msg: CommandMessage = match serde_json::from_value(value) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "dropping malformed command message");
                    continue;
                }
            };
            if self.filters.iter().all(|keep| keep(&msg)) {
                return Some(msg);
            }
        }
    }
}
