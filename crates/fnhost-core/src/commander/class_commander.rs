// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatches replicated commands to locally registered instances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::CommandError;
use super::message::{Command, CommandMessage, Operation};
use super::messenger::CommandMessenger;

/// An object whose operations can be replayed from other replicas.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Stable name shared by every replica's instance.
    fn class_name(&self) -> &str;

    /// Reject an operation before anything is applied.
    fn validate(&self, op: &Operation) -> Result<(), CommandError>;

    /// Apply an operation to the local instance without re-emitting it.
    async fn apply(&self, op: Operation) -> Result<(), CommandError>;
}

pub struct ClassCommander {
    messenger: CommandMessenger,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ClassCommander {
    pub fn new(messenger: CommandMessenger) -> Arc<Self> {
        Arc::new(Self {
            messenger,
            handlers: RwLock::new(HashMap::new()),
            listener: Mutex::new(None),
        })
    }

    pub fn replica_id(&self) -> &str {
        self.messenger.replica_id()
    }

    /// Associate `handler` with its class name, replacing any previous one.
    pub async fn register(&self, handler: Arc<dyn CommandHandler>) {
        let class = handler.class_name().to_string();
        debug!(class = %class, "registered command handler");
        self.handlers.write().await.insert(class, handler);
    }

    pub async fn unregister(&self, class: &str) {
        self.handlers.write().await.remove(class);
    }

    /// Instruct every other replica (and this one when `include_self`) to
    /// replay `command`.
    pub async fn emit(&self, command: Command, include_self: bool) -> Result<(), CommandError> {
        if include_self {
            self.dispatch(&command).await?;
        }
        self.messenger
            .publish(CommandMessage::broadcast(command))
            .await
            .map_err(CommandError::Transport)
    }

    /// Replay one command on the local instance of its class.
    pub async fn dispatch(&self, command: &Command) -> Result<(), CommandError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&command.class)
            .cloned()
            .ok_or_else(|| CommandError::UnknownClass {
                class: command.class.clone(),
            })?;

        handler.validate(&command.op)?;
        handler.apply(command.op.clone()).await
    }

    /// Start replaying commands from other replicas.
    pub async fn start(self: &Arc<Self>) -> Result<(), CommandError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let mut stream = self
            .messenger
            .subscribe()
            .await
            .map_err(CommandError::Transport)?;
        let commander = Arc::downgrade(self);

        *listener = Some(tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Some(commander) = commander.upgrade() else {
                    break;
                };
                for command in &msg.target.commands {
                    if let Err(e) = commander.dispatch(command).await {
                        warn!(
                            id = %msg.id,
                            source = %msg.source.id,
                            class = %command.class,
                            op = command.op.name(),
                            error = %e,
                            "failed to replay command"
                        );
                    }
                }
            }
        }));

        info!(replica_id = %self.replica_id(), "class commander started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
    }
}
