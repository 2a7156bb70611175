// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-replica command replication.
//!
//! - [`CommandMessenger`] stamps and filters [`CommandMessage`]s on the shared transport
//! - [`ClassCommander`] replays received commands on registered local instances
//! - [`ReplicationMap`] is a map whose mutations are replayed on every replica

pub mod class_commander;
pub mod message;
pub mod messenger;
pub mod replication_map;

pub use class_commander::{ClassCommander, CommandHandler};
pub use message::{Command, CommandMessage, CommandSource, CommandTarget, Operation};
pub use messenger::{CommandFilter, CommandMessenger, CommandStream};
pub use replication_map::ReplicationMap;

use thiserror::Error;

use crate::error::CoreError;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no instance registered for class '{class}'")]
    UnknownClass { class: String },

    #[error("class '{class}' rejected command: {reason}")]
    Rejected { class: String, reason: String },

    #[error("command transport failed: {0}")]
    Transport(#[source] CoreError),
}
