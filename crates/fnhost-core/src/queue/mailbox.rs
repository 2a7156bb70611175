// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Owned arena of queued payloads keyed by event id.

use dashmap::DashMap;

/// Removal-on-read store. An item can be taken at most once.
#[derive(Debug)]
pub struct Mailbox<T> {
    items: DashMap<String, T>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self {
            items: DashMap::new(),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `item` under `id`, returning whatever was stored there before.
    pub fn insert(&self, id: impl Into<String>, item: T) -> Option<T> {
        self.items.insert(id.into(), item)
    }

    /// Remove and return the item under `id`.
    pub fn take(&self, id: &str) -> Option<T> {
        self.items.remove(id).map(|(_, item)| item)
    }

    /// Drop the item under `id`. Returns whether one was there.
    pub fn discard(&self, id: &str) -> bool {
        self.items.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
