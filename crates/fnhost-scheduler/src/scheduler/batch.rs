// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batching windows.
//!
//! A batch lets one warm worker take further invocations of the target it is
//! already running, up to `limit` per handler and until `deadline`.

use std::collections::HashMap;
use std::time::Duration;

use fnhost_protocol::messages;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Batch {
    pub target: String,
    pub worker_id: String,
    pub started_at: Instant,
    pub deadline: Instant,
    limit: u64,
    remaining: HashMap<String, u64>,
    last_enqueued_at: HashMap<String, Instant>,
}

impl Batch {
    /// Open a window for `worker_id`, counting the invocation that opened it.
    ///
    /// Returns `None` when the settings do not allow more than one invocation.
    pub fn open(
        target: &str,
        worker_id: &str,
        handler: &str,
        settings: &messages::Batch,
        now: Instant,
    ) -> Option<Self> {
        if settings.limit <= 1 || settings.deadline_secs == 0 {
            return None;
        }
        let mut batch = Self {
            target: target.to_string(),
            worker_id: worker_id.to_string(),
            started_at: now,
            deadline: now + Duration::from_secs(settings.deadline_secs),
            limit: settings.limit,
            remaining: HashMap::new(),
            last_enqueued_at: HashMap::new(),
        };
        batch.try_admit(handler, now);
        Some(batch)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Take one slot of the window for `handler`.
    pub fn try_admit(&mut self, handler: &str, now: Instant) -> bool {
        if self.is_expired(now) {
            return false;
        }
        let remaining = self
            .remaining
            .entry(handler.to_string())
            .or_insert(self.limit);
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        self.last_enqueued_at.insert(handler.to_string(), now);
        true
    }

    pub fn remaining(&self, handler: &str) -> u64 {
        self.remaining.get(handler).copied().unwrap_or(self.limit)
    }

    pub fn last_enqueued_at(&self, handler: &str) -> Option<Instant> {
        self.last_enqueued_at.get(handler).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(limit: u64, deadline_secs: u64) -> messages::Batch {
        messages::Batch {
            limit,
            deadline_secs,
        }
    }

    #[test]
    fn test_open_counts_first_invocation() {
        let now = Instant::now();
        let batch = Batch::open("fn-1", "w0-1", "default", &settings(3, 10), now).unwrap();

        assert_eq!(batch.remaining("default"), 2);
        assert_eq!(batch.remaining("other"), 3);
        assert_eq!(batch.last_enqueued_at("default"), Some(now));
        assert_eq!(batch.deadline, now + Duration::from_secs(10));
    }

    #[test]
    fn test_no_window_for_single_invocation() {
        let now = Instant::now();
        assert!(Batch::open("fn-1", "w0-1", "default", &settings(1, 10), now).is_none());
        assert!(Batch::open("fn-1", "w0-1", "default", &settings(5, 0), now).is_none());
    }

    #[test]
    fn test_limit_is_per_handler() {
        let now = Instant::now();
        let mut batch = Batch::open("fn-1", "w0-1", "a", &settings(2, 10), now).unwrap();

        assert!(batch.try_admit("a", now));
        assert!(!batch.try_admit("a", now));
        assert!(batch.try_admit("b", now));
        assert!(batch.try_admit("b", now));
        assert!(!batch.try_admit("b", now));
    }

    #[test]
    fn test_deadline_closes_window() {
        let now = Instant::now();
        let mut batch = Batch::open("fn-1", "w0-1", "a", &settings(10, 5), now).unwrap();

        assert!(batch.try_admit("a", now + Duration::from_secs(4)));
        assert!(batch.is_expired(now + Duration::from_secs(5)));
        assert!(!batch.try_admit("a", now + Duration::from_secs(5)));
    }
}
