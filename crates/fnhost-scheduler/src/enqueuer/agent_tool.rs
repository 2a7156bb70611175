// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent tool trigger.
//!
//! Targets register as named tools with a JSON schema. An agent calls a
//! tool through [`AgentToolEnqueuer::call_tool`], which waits until the
//! worker answers with `respond` or the event settles without an answer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fnhost_core::queue::{AgentToolQueue, tool_outcome};
use fnhost_core::{EventQueue, QueueService};
use fnhost_protocol::messages::{Event, EventType, Target, ToolCall};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    Completions, DequeueOnDrop, Enqueuer, EnqueuerContext, Outcome, Trigger, enqueue_event,
};
use crate::error::EnqueuerError;

/// What an agent sees of a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub struct AgentToolEnqueuer {
    event_queue: Arc<EventQueue>,
    queue: Arc<AgentToolQueue>,
    completions: Completions,
    tools: RwLock<HashMap<String, (Target, ToolSpec)>>,
}

impl AgentToolEnqueuer {
    pub fn new(event_queue: Arc<EventQueue>) -> Self {
        Self {
            event_queue,
            queue: Arc::new(AgentToolQueue::new()),
            completions: Completions::new(),
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(ctx: &EnqueuerContext) -> Arc<dyn Enqueuer> {
        Arc::new(Self::new(ctx.event_queue.clone()))
    }

    /// Registered tools, sorted by name.
    pub async fn tools(&self) -> Vec<ToolSpec> {
        let mut tools: Vec<ToolSpec> = self
            .tools
            .read()
            .await
            .values()
            .map(|(_, spec)| spec.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Run tool `name` and wait for its result.
    ///
    /// Dropping the returned future cancels the call if no worker picked it up.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, EnqueuerError> {
        let target = self
            .tools
            .read()
            .await
            .get(name)
            .map(|(target, _)| target.clone())
            .ok_or_else(|| EnqueuerError::UnknownTool(name.to_string()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let response = self.queue.enqueue(
            &id,
            ToolCall {
                id: id.clone(),
                tool: name.to_string(),
                arguments: arguments.to_string(),
            },
        );
        let _ = self.completions.register(&id);
        enqueue_event(&self.event_queue, EventType::AgentTool, &id, &target);
        let guard = DequeueOnDrop::new(self.event_queue.clone(), &id);

        let response = response.await;
        guard.disarm();
        match response {
            Ok(response) => match tool_outcome(response) {
                Ok(result) => Ok(serde_json::from_str(&result).unwrap_or(Value::String(result))),
                Err(error) => Err(EnqueuerError::Handler(error)),
            },
            Err(_) => {
                debug!(event_id = %id, tool = %name, "Tool call settled without a response");
                Err(EnqueuerError::NoResponse(id))
            }
        }
    }
}

#[async_trait]
impl Enqueuer for AgentToolEnqueuer {
    fn kind(&self) -> EventType {
        EventType::AgentTool
    }

    fn service(&self) -> Option<Arc<dyn QueueService>> {
        Some(self.queue.clone() as Arc<dyn QueueService>)
    }

    async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError> {
        let kind = trigger.kind();
        let Trigger::AgentTool {
            name,
            description,
            input_schema,
        } = trigger
        else {
            return Err(EnqueuerError::Unsupported(kind));
        };

        info!(target = %target.id, tool = %name, "Agent tool registered");
        let spec = ToolSpec {
            name: name.clone(),
            description,
            input_schema,
        };
        self.tools.write().await.insert(name, (target, spec));
        Ok(())
    }

    async fn unsubscribe(&self, target_id: &str) -> bool {
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|_, (target, _)| target.id != target_id);
        tools.len() != before
    }

    // The pending call is dropped by the registry's discard, which makes a
    // caller without a response see `NoResponse`.
    fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        self.completions.resolve(&event.id, outcome);
    }

    async fn on_events_are_drained(&self) {
        self.completions.drained().await;
    }

    async fn stop(&self) {
        self.tools.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnhost_core::QueueNotice;
    use fnhost_protocol::RpcServerConfig;
    use fnhost_protocol::messages::{Pop, ToolResponse, tool_response};
    use serde_json::json;

    async fn enqueuer_with_lookup() -> (
        Arc<AgentToolEnqueuer>,
        tokio::sync::mpsc::UnboundedReceiver<QueueNotice>,
    ) {
        let (event_queue, notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = Arc::new(AgentToolEnqueuer::new(event_queue));
        enqueuer
            .subscribe(
                Target {
                    id: "lookup-fn".into(),
                    ..Default::default()
                },
                Trigger::AgentTool {
                    name: "lookup".into(),
                    description: "Find a book".into(),
                    input_schema: json!({"type": "object"}),
                },
            )
            .await
            .unwrap();
        (enqueuer, notices)
    }

    async fn next_event(notices: &mut tokio::sync::mpsc::UnboundedReceiver<QueueNotice>) -> Event {
        match notices.recv().await.unwrap() {
            QueueNotice::Enqueued(event) => event,
            other => panic!("unexpected notice: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (enqueuer, mut notices) = enqueuer_with_lookup().await;
        assert_eq!(enqueuer.tools().await[0].name, "lookup");

        let call = {
            let enqueuer = enqueuer.clone();
            tokio::spawn(async move { enqueuer.call_tool("lookup", json!({"isbn": "42"})).await })
        };

        let event = next_event(&mut notices).await;
        let request = enqueuer.queue.pop(&Pop { id: event.id.clone() }).unwrap();
        assert_eq!(request.tool, "lookup");
        assert_eq!(
            serde_json::from_str::<Value>(&request.arguments).unwrap(),
            json!({"isbn": "42"})
        );

        enqueuer
            .queue
            .respond(ToolResponse {
                id: event.id.clone(),
                outcome: Some(tool_response::Outcome::Result("{\"title\":\"Dune\"}".into())),
            })
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!({"title": "Dune"}));
    }

    #[tokio::test]
    async fn test_settled_without_response() {
        let (enqueuer, mut notices) = enqueuer_with_lookup().await;
        let call = {
            let enqueuer = enqueuer.clone();
            tokio::spawn(async move { enqueuer.call_tool("lookup", Value::Null).await })
        };

        let event = next_event(&mut notices).await;
        enqueuer.on_event_completed(&event, Outcome::Succeeded);
        QueueService::discard(&*enqueuer.queue, &event.id);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, EnqueuerError::NoResponse(id) if id == event.id));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_handler_error() {
        let (enqueuer, mut notices) = enqueuer_with_lookup().await;
        assert!(matches!(
            enqueuer.call_tool("missing", Value::Null).await,
            Err(EnqueuerError::UnknownTool(_))
        ));

        let call = {
            let enqueuer = enqueuer.clone();
            tokio::spawn(async move { enqueuer.call_tool("lookup", Value::Null).await })
        };
        let event = next_event(&mut notices).await;
        enqueuer
            .queue
            .respond(ToolResponse {
                id: event.id,
                outcome: Some(tool_response::Outcome::Error("not found".into())),
            })
            .unwrap();
        assert!(matches!(
            call.await.unwrap(),
            Err(EnqueuerError::Handler(message)) if message == "not found"
        ));
    }
}
