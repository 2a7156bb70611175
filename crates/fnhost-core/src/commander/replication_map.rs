// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Eventually consistent map shared by all replicas.
//!
//! Each mutation is applied locally and then emitted as a command, so every
//! replica's copy converges to the same contents. There is no conflict
//! resolution beyond transport order: concurrent writes to one key from two
//! replicas may leave the replicas disagreeing until the next write.
//! Writes from one replica are published in the order they were applied.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock};

use super::class_commander::{ClassCommander, CommandHandler};
use super::message::{Command, Operation};
use super::CommandError;
use crate::error::CoreError;

pub struct ReplicationMap<V> {
    name: String,
    entries: RwLock<HashMap<String, V>>,
    /// Held across a local write and its publish.
    writes: Mutex<()>,
    commander: Arc<ClassCommander>,
}

impl<V> ReplicationMap<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create the map and register it under `name` with `commander`.
    ///
    /// Every replica must use the same name for its copy.
    pub async fn new(name: impl Into<String>, commander: Arc<ClassCommander>) -> Arc<Self> {
        let map = Arc::new(Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            writes: Mutex::new(()),
            commander: commander.clone(),
        });
        commander.register(map.clone()).await;
        map
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> HashMap<String, V> {
        self.entries.read().await.clone()
    }

    /// Insert locally, then replicate. The local write stands even if
    /// replication fails.
    pub async fn set(&self, key: impl Into<String>, value: V) -> Result<(), CommandError> {
        let key = key.into();
        let encoded = serde_json::to_value(&value)
            .map_err(|e| CommandError::Transport(CoreError::from(e)))?;
        let _order = self.writes.lock().await;
        self.entries.write().await.insert(key.clone(), value);
        self.replicate(Operation::MapSet {
            key,
            value: encoded,
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CommandError> {
        let _order = self.writes.lock().await;
        let existed = self.entries.write().await.remove(key).is_some();
        self.replicate(Operation::MapDelete {
            key: key.to_string(),
        })
        .await?;
        Ok(existed)
    }

    pub async fn clear(&self) -> Result<(), CommandError> {
        let _order = self.writes.lock().await;
        self.entries.write().await.clear();
        self.replicate(Operation::MapClear).await
    }

    async fn replicate(&self, op: Operation) -> Result<(), CommandError> {
        self.commander
            .emit(Command::new(self.name.clone(), op), false)
            .await
    }
}

#[async_trait]
impl<V> CommandHandler for ReplicationMap<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn class_name(&self) -> &str {
        &self.name
    }

    fn validate(&self, op: &Operation) -> Result<(), CommandError> {
        if let Operation::MapSet { value, .. } = op {
            serde_json::from_value::<V>(value.clone()).map_err(|e| CommandError::Rejected {
                class: self.name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    async fn apply(&self, op: Operation) -> Result<(), CommandError> {
        let mut entries = self.entries.write().await;
        match op {
            Operation::MapSet { key, value } => {
                let value = serde_json::from_value::<V>(value).map_err(|e| {
                    CommandError::Rejected {
                        class: self.name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                entries.insert(key, value);
            }
            Operation::MapDelete { key } => {
                entries.remove(&key);
            }
            Operation::MapClear => entries.clear(),
        }
        Ok(())
    }
}
