// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use fnhost_protocol::messages::{Change, Pop};
use fnhost_protocol::rpc::{methods, services};
use prost::Message;

use super::Mailbox;
use crate::error::{CoreError, Result};
use crate::service::{QueueService, decode, unknown_method};

/// Collection changes waiting for their worker.
#[derive(Debug, Default)]
pub struct DatabaseQueue {
    changes: Mailbox<Change>,
}

impl DatabaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, id: impl Into<String>, change: Change) {
        self.changes.insert(id, change);
    }

    pub fn pop(&self, pop: &Pop) -> Result<Change> {
        self.changes
            .take(&pop.id)
            .ok_or_else(|| CoreError::NoItem { id: pop.id.clone() })
    }

    pub fn size(&self) -> usize {
        self.changes.len()
    }
}

#[async_trait]
impl QueueService for DatabaseQueue {
    fn service_name(&self) -> &'static str {
        services::DATABASE_QUEUE
    }

    async fn handle(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match method {
            methods::POP => Ok(self.pop(&decode(payload)?)?.encode_to_vec()),
            _ => Err(unknown_method(self.service_name(), method)),
        }
    }

    fn discard(&self, id: &str) {
        self.changes.discard(id);
    }
}
