// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged between the host and its workers.
//!
//! These are maintained by hand with `prost` derives, there is no `.proto`
//! compilation step. Tags are part of the wire contract and must not be reused.

use std::collections::HashMap;

/// Trigger kind that produced an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    Http = 0,
    Database = 1,
    Schedule = 2,
    Firehose = 3,
    Rabbitmq = 4,
    AgentTool = 5,
    Grpc = 6,
}

impl EventType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            EventType::Http => "HTTP",
            EventType::Database => "DATABASE",
            EventType::Schedule => "SCHEDULE",
            EventType::Firehose => "FIREHOSE",
            EventType::Rabbitmq => "RABBITMQ",
            EventType::AgentTool => "AGENT_TOOL",
            EventType::Grpc => "GRPC",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "HTTP" => Some(EventType::Http),
            "DATABASE" => Some(EventType::Database),
            "SCHEDULE" => Some(EventType::Schedule),
            "FIREHOSE" => Some(EventType::Firehose),
            "RABBITMQ" => Some(EventType::Rabbitmq),
            "AGENT_TOOL" => Some(EventType::AgentTool),
            "GRPC" => Some(EventType::Grpc),
            _ => None,
        }
    }
}

/// A scheduled unit of work.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "EventType", tag = "2")]
    pub r#type: i32,
    #[prost(message, optional, tag = "3")]
    pub target: Option<Target>,
}

impl Event {
    pub fn new(kind: EventType, target: Target) -> Self {
        Self {
            id: String::new(),
            r#type: kind as i32,
            target: Some(target),
        }
    }

    /// Decoded event type, `None` for values this build does not know.
    pub fn kind(&self) -> Option<EventType> {
        EventType::try_from(self.r#type).ok()
    }

    pub fn target_id(&self) -> &str {
        self.target.as_ref().map(|t| t.id.as_str()).unwrap_or("")
    }
}

/// Which compiled function and exported handler to run.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Target {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub cwd: String,
    #[prost(string, tag = "3")]
    pub handler: String,
    #[prost(message, optional, tag = "4")]
    pub context: Option<TargetContext>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TargetContext {
    #[prost(map = "string, string", tag = "1")]
    pub env: HashMap<String, String>,
    /// Zero means "use the host default".
    #[prost(uint64, tag = "2")]
    pub timeout_ms: u64,
    #[prost(message, optional, tag = "3")]
    pub batch: Option<Batch>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Batch {
    #[prost(uint64, tag = "1")]
    pub limit: u64,
    #[prost(uint64, tag = "2")]
    pub deadline_secs: u64,
}

// ============================================================================
// EventQueue service
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerPopRequest {
    /// Worker id assigned by the host at spawn time.
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Complete {
    /// Event id.
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, tag = "2")]
    pub succeeded: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompleteResult {
    /// False when the host had already settled the event (timeout, crash).
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}

/// Worker request for the payload queued under an event id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pop {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

// ============================================================================
// Database
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChangeKind {
    Insert = 0,
    Update = 1,
    Replace = 2,
    Delete = 3,
}

impl ChangeKind {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Replace => "REPLACE",
            ChangeKind::Delete => "DELETE",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "REPLACE" => Some(ChangeKind::Replace),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// One entry of a collection change stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Change {
    #[prost(enumeration = "ChangeKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub collection: String,
    #[prost(string, tag = "3")]
    pub document_key: String,
    /// Full document as JSON, empty for deletes.
    #[prost(string, tag = "4")]
    pub document: String,
    /// Position in the change log.
    #[prost(int64, tag = "5")]
    pub seq: i64,
}

// ============================================================================
// Http
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(string, tag = "3")]
    pub url: String,
    #[prost(string, tag = "4")]
    pub path: String,
    #[prost(string, tag = "5")]
    pub query: String,
    #[prost(message, repeated, tag = "6")]
    pub headers: Vec<Header>,
    /// Route parameters captured from the path pattern.
    #[prost(message, repeated, tag = "7")]
    pub params: Vec<Header>,
    #[prost(bytes = "vec", tag = "8")]
    pub body: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpWriteHead {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint32, tag = "2")]
    pub status_code: u32,
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<Header>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpWrite {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

// ============================================================================
// RabbitMQ
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BrokerMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub queue: String,
    #[prost(string, tag = "3")]
    pub exchange: String,
    #[prost(string, tag = "4")]
    pub routing_key: String,
    #[prost(bytes = "vec", tag = "5")]
    pub content: Vec<u8>,
    #[prost(message, repeated, tag = "6")]
    pub headers: Vec<Header>,
    #[prost(bool, tag = "7")]
    pub redelivered: bool,
}

// ============================================================================
// Firehose
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FirehoseClient {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub remote_address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FirehoseMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub client: Option<FirehoseClient>,
    /// Number of connected clients when the event was produced.
    #[prost(uint32, tag = "3")]
    pub pool_size: u32,
    #[prost(string, tag = "4")]
    pub name: String,
    /// JSON payload.
    #[prost(string, tag = "5")]
    pub data: String,
}

/// Worker reply pushed to one client (`send`) or every client (`sendAll`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FirehoseSend {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub data: String,
}

// ============================================================================
// AgentTool and gRPC bridges
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToolCall {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub tool: String,
    /// JSON arguments.
    #[prost(string, tag = "3")]
    pub arguments: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToolResponse {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "tool_response::Outcome", tags = "2, 3")]
    pub outcome: Option<tool_response::Outcome>,
}

pub mod tool_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        /// JSON result.
        #[prost(string, tag = "2")]
        Result(String),
        #[prost(string, tag = "3")]
        Error(String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GrpcCall {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub service: String,
    #[prost(string, tag = "3")]
    pub method: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GrpcResponse {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "grpc_response::Outcome", tags = "2, 3")]
    pub outcome: Option<grpc_response::Outcome>,
}

pub mod grpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(bytes = "vec", tag = "2")]
        Payload(Vec<u8>),
        #[prost(string, tag = "3")]
        Error(String),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_event_type_names() {
        for kind in [
            EventType::Http,
            EventType::Database,
            EventType::Schedule,
            EventType::Firehose,
            EventType::Rabbitmq,
            EventType::AgentTool,
            EventType::Grpc,
        ] {
            assert_eq!(EventType::from_str_name(kind.as_str_name()), Some(kind));
        }
        assert_eq!(EventType::from_str_name("SMTP"), None);
    }

    #[test]
    fn test_event_kind_unknown_value() {
        let event = Event {
            id: "e".into(),
            r#type: 99,
            target: None,
        };
        assert_eq!(event.kind(), None);
        assert_eq!(event.target_id(), "");
    }

    #[test]
    fn test_event_carries_target_context() {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "abc".to_string());
        let target = Target {
            id: "fn-1".into(),
            cwd: "/functions/fn-1".into(),
            handler: "default".into(),
            context: Some(TargetContext {
                env,
                timeout_ms: 5_000,
                batch: Some(Batch {
                    limit: 3,
                    deadline_secs: 10,
                }),
            }),
        };
        let event = Event::new(EventType::Schedule, target.clone());

        let decoded = Event::decode(event.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.kind(), Some(EventType::Schedule));
        assert_eq!(decoded.target, Some(target));
    }

    #[test]
    fn test_change_kind_parsing_is_case_insensitive() {
        assert_eq!(ChangeKind::from_str_name("insert"), Some(ChangeKind::Insert));
        assert_eq!(ChangeKind::from_str_name("Delete"), Some(ChangeKind::Delete));
        assert_eq!(ChangeKind::from_str_name("upsert"), None);
    }
}
