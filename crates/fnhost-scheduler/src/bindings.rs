// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger bindings loaded at startup.
//!
//! The file is a JSON array:
//!
//! ```json
//! [
//!   {
//!     "target": { "id": "books", "cwd": "/srv/fn/books", "timeout_ms": 5000 },
//!     "triggers": [
//!       { "type": "http", "method": "GET", "path": "/books/:id" },
//!       { "type": "database", "collection": "books", "operations": ["insert"] }
//!     ]
//!   }
//! ]
//! ```

use std::collections::HashMap;
use std::path::Path;

use fnhost_protocol::messages::{Batch, Target, TargetContext};
use serde::Deserialize;

use crate::enqueuer::Trigger;
use crate::error::EnqueuerError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchSpec {
    pub limit: u64,
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetSpec {
    pub id: String,
    pub cwd: String,
    #[serde(default = "default_handler")]
    pub handler: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Zero uses the host default.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub batch: Option<BatchSpec>,
}

fn default_handler() -> String {
    "default".to_string()
}

impl TargetSpec {
    pub fn into_target(self) -> Target {
        Target {
            id: self.id,
            cwd: self.cwd,
            handler: self.handler,
            context: Some(TargetContext {
                env: self.env,
                timeout_ms: self.timeout_ms,
                batch: self.batch.map(|b| Batch {
                    limit: b.limit,
                    deadline_secs: b.deadline_secs,
                }),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Binding {
    pub target: TargetSpec,
    pub triggers: Vec<Trigger>,
}

pub fn parse_bindings(json: &str) -> Result<Vec<Binding>, EnqueuerError> {
    Ok(serde_json::from_str(json)?)
}

pub fn load_bindings(path: impl AsRef<Path>) -> Result<Vec<Binding>, EnqueuerError> {
    let json = std::fs::read_to_string(path)?;
    parse_bindings(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bindings() {
        let bindings = parse_bindings(
            r#"[{
                "target": {"id": "books", "cwd": "/srv/books", "batch": {"limit": 5, "deadline_secs": 2}},
                "triggers": [
                    {"type": "http", "path": "/books/:id"},
                    {"type": "rabbitmq", "queue": "orders"}
                ]
            }]"#,
        )
        .unwrap();

        assert_eq!(bindings.len(), 1);
        assert_eq!(
            bindings[0].triggers[0],
            Trigger::Http {
                method: "*".into(),
                path: "/books/:id".into()
            }
        );

        let target = bindings[0].target.clone().into_target();
        assert_eq!(target.handler, "default");
        let context = target.context.unwrap();
        assert_eq!(context.timeout_ms, 0);
        assert_eq!(context.batch.unwrap().limit, 5);
    }

    #[test]
    fn test_load_bindings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triggers.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(load_bindings(&path).unwrap().is_empty());

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_bindings(&path), Err(EnqueuerError::Json(_))));
        assert!(matches!(
            load_bindings(dir.path().join("missing.json")),
            Err(EnqueuerError::Io(_))
        ));
    }
}
