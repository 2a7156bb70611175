// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use fnhost_protocol::messages::{Empty, Pop, ToolCall, ToolResponse, tool_response};
use fnhost_protocol::rpc::{methods, services};
use prost::Message;
use tokio::sync::oneshot;

use super::Bridge;
use crate::error::{CoreError, Result};
use crate::service::{QueueService, decode, unknown_method};

/// Tool calls from an agent, answered by the worker through `respond`.
#[derive(Debug, Default)]
pub struct AgentToolQueue {
    bridge: Bridge<ToolCall, ToolResponse>,
}

impl AgentToolQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, id: impl Into<String>, call: ToolCall) -> oneshot::Receiver<ToolResponse> {
        self.bridge.enqueue(id, call)
    }

    pub fn pop(&self, pop: &Pop) -> Result<ToolCall> {
        self.bridge.pop(&pop.id)
    }

    pub fn respond(&self, response: ToolResponse) -> Result<()> {
        if response.outcome.is_none() {
            return Err(CoreError::InvalidRequest {
                message: "tool response carries neither result nor error".to_string(),
            });
        }
        let id = response.id.clone();
        self.bridge.respond(&id, response)
    }

    pub fn size(&self) -> usize {
        self.bridge.size()
    }
}

/// Outcome of a tool response as a plain result.
pub fn tool_outcome(response: ToolResponse) -> std::result::Result<String, String> {
    match response.outcome {
        Some(tool_response::Outcome::Result(result)) => Ok(result),
        Some(tool_response::Outcome::Error(error)) => Err(error),
        None => Err("empty tool response".to_string()),
    }
}

#[async_trait]
impl QueueService for AgentToolQueue {
    fn service_name(&self) -> &'static str {
        services::AGENT_TOOL_QUEUE
    }

    async fn handle(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match method {
            methods::POP => Ok(self.pop(&decode(payload)?)?.encode_to_vec()),
            methods::RESPOND => {
                self.respond(decode(payload)?)?;
                Ok(Empty {}.encode_to_vec())
            }
            _ => Err(unknown_method(self.service_name(), method)),
        }
    }

    fn discard(&self, id: &str) {
        self.bridge.discard(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_and_respond() {
        let queue = AgentToolQueue::new();
        let reply = queue.enqueue(
            "t-1",
            ToolCall {
                id: "t-1".into(),
                tool: "lookup".into(),
                arguments: r#"{"q":"x"}"#.into(),
            },
        );

        let call = queue.pop(&Pop { id: "t-1".into() }).unwrap();
        assert_eq!(call.tool, "lookup");

        queue
            .respond(ToolResponse {
                id: "t-1".into(),
                outcome: Some(tool_response::Outcome::Error("boom".into())),
            })
            .unwrap();

        assert_eq!(tool_outcome(reply.await.unwrap()), Err("boom".to_string()));
    }

    #[test]
    fn test_empty_response_rejected() {
        let queue = AgentToolQueue::new();
        let _reply = queue.enqueue("t-1", ToolCall::default());

        let err = queue
            .respond(ToolResponse {
                id: "t-1".into(),
                outcome: None,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));
    }
}
