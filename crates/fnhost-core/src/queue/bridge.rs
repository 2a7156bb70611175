// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/response bridge between a waiting host-side caller and a worker.

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::Mailbox;
use crate::error::{CoreError, Result};

/// Each enqueued request has a caller waiting on the matching oneshot.
///
/// Dropping the pending sender (through [`Bridge::discard`]) resolves the
/// caller with a receive error, which callers treat as a failed call.
#[derive(Debug)]
pub struct Bridge<Req, Resp> {
    requests: Mailbox<Req>,
    pending: DashMap<String, oneshot::Sender<Resp>>,
}

impl<Req, Resp> Default for Bridge<Req, Resp> {
    fn default() -> Self {
        Self {
            requests: Mailbox::new(),
            pending: DashMap::new(),
        }
    }
}

impl<Req, Resp> Bridge<Req, Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, id: impl Into<String>, request: Req) -> oneshot::Receiver<Resp> {
        let id = id.into();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id.clone(), sender);
        self.requests.insert(id, request);
        receiver
    }

    pub fn pop(&self, id: &str) -> Result<Req> {
        self.requests
            .take(id)
            .ok_or_else(|| CoreError::NoItem { id: id.to_string() })
    }

    /// Resolve the caller waiting on `id`. Each call resolves at most once.
    pub fn respond(&self, id: &str, response: Resp) -> Result<()> {
        let (_, sender) = self
            .pending
            .remove(id)
            .ok_or_else(|| CoreError::NoItem { id: id.to_string() })?;
        // A caller that stopped waiting is not the worker's problem.
        let _ = sender.send(response);
        Ok(())
    }

    pub fn discard(&self, id: &str) {
        self.requests.discard(id);
        self.pending.remove(id);
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let bridge: Bridge<&str, u32> = Bridge::new();
        let reply = bridge.enqueue("1", "question");

        assert_eq!(bridge.pop("1").unwrap(), "question");
        bridge.respond("1", 42).unwrap();

        assert_eq!(reply.await.unwrap(), 42);
        assert!(!bridge.is_pending("1"));
    }

    #[test]
    fn test_respond_twice() {
        let bridge: Bridge<(), u32> = Bridge::new();
        let _reply = bridge.enqueue("1", ());

        bridge.respond("1", 1).unwrap();
        assert!(matches!(bridge.respond("1", 2), Err(CoreError::NoItem { .. })));
    }

    #[tokio::test]
    async fn test_discard_fails_caller() {
        let bridge: Bridge<(), u32> = Bridge::new();
        let reply = bridge.enqueue("1", ());

        bridge.discard("1");

        assert!(reply.await.is_err());
        assert_eq!(bridge.size(), 0);
    }
}
