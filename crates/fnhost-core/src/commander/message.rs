// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format of replicated commands.
//!
//! ```json
//! {
//!   "_id": "6f0c…",
//!   "source": {"id": "replica-a", "command": {"class": "warm-workers", "op": {"handler": "map_set", "args": {"key": "fn-1", "value": 3}}}},
//!   "target": {"commands": [ … ]}
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A replicated method call descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub source: CommandSource,
    pub target: CommandTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSource {
    /// Publishing replica, stamped by the messenger.
    #[serde(default)]
    pub id: String,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTarget {
    /// Only this replica should replay the commands. `None` means everyone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub commands: Vec<Command>,
}

/// One operation addressed to a registered class instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub class: String,
    pub op: Operation,
}

/// Every operation a replica is willing to replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handler", content = "args", rename_all = "snake_case")]
pub enum Operation {
    MapSet { key: String, value: Value },
    MapDelete { key: String },
    MapClear,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::MapSet { .. } => "map_set",
            Operation::MapDelete { .. } => "map_delete",
            Operation::MapClear => "map_clear",
        }
    }
}

impl Command {
    pub fn new(class: impl Into<String>, op: Operation) -> Self {
        Self {
            class: class.into(),
            op,
        }
    }
}

impl CommandMessage {
    /// Message broadcasting `command` to every replica.
    pub fn broadcast(command: Command) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: CommandSource {
                id: String::new(),
                command: command.clone(),
            },
            target: CommandTarget {
                id: None,
                commands: vec![command],
            },
        }
    }

    /// Message addressed to a single replica.
    pub fn directed(command: Command, replica_id: impl Into<String>) -> Self {
        let mut msg = Self::broadcast(command);
        msg.target.id = Some(replica_id.into());
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_wire_shape() {
        let command = Command::new(
            "warm-workers",
            Operation::MapSet {
                key: "fn-1".into(),
                value: json!({"worker": "w-3"}),
            },
        );

        let encoded = serde_json::to_value(&command).unwrap();
        assert_eq!(
            encoded,
            json!({
                "class": "warm-workers",
                "op": {"handler": "map_set", "args": {"key": "fn-1", "value": {"worker": "w-3"}}}
            })
        );
    }

    #[test]
    fn test_unit_operation_round_trip() {
        let command = Command::new("m", Operation::MapClear);
        let encoded = serde_json::to_string(&command).unwrap();
        let decoded: Command = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.op, Operation::MapClear);
    }

    #[test]
    fn test_unknown_handler_is_rejected() {
        let raw = json!({"class": "m", "op": {"handler": "drop_table", "args": {}}});
        assert!(serde_json::from_value::<Command>(raw).is_err());
    }

    #[test]
    fn test_message_constructors() {
        let command = Command::new("m", Operation::MapDelete { key: "k".into() });

        let broadcast = CommandMessage::broadcast(command.clone());
        assert!(broadcast.target.id.is_none());
        assert_eq!(broadcast.target.commands, vec![command.clone()]);
        assert!(broadcast.source.id.is_empty());

        let directed = CommandMessage::directed(command, "replica-b");
        assert_eq!(directed.target.id.as_deref(), Some("replica-b"));
        assert_ne!(directed.id, broadcast.id);

        let encoded = serde_json::to_value(&directed).unwrap();
        assert!(encoded.get("_id").is_some());
    }
}
