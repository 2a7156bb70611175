// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC envelope shared by every queue service.
//!
//! A request names the service and method it targets and carries the encoded
//! method argument. The response carries either the encoded method result or
//! an [`RpcError`] with a gRPC-style status name.

use prost::Message;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

impl RpcRequest {
    pub fn new<M: Message>(service: &str, method: &str, argument: &M) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            payload: argument.encode_to_vec(),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Outcome", tags = "1, 2")]
    pub outcome: Option<rpc_response::Outcome>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(bytes = "vec", tag = "1")]
        Payload(Vec<u8>),
        #[prost(message, tag = "2")]
        Error(super::RpcError),
    }
}

impl RpcResponse {
    pub fn payload(payload: Vec<u8>) -> Self {
        Self {
            outcome: Some(rpc_response::Outcome::Payload(payload)),
        }
    }

    pub fn error(error: RpcError) -> Self {
        Self {
            outcome: Some(rpc_response::Outcome::Error(error)),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    /// One of the constants in [`status`].
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Status names carried in [`RpcError::code`].
pub mod status {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const UNIMPLEMENTED: &str = "UNIMPLEMENTED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const FAILED_PRECONDITION: &str = "FAILED_PRECONDITION";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Service names on the shared endpoint.
pub mod services {
    pub const EVENT_QUEUE: &str = "EventQueue";
    pub const DATABASE_QUEUE: &str = "DatabaseQueue";
    pub const HTTP_QUEUE: &str = "HttpQueue";
    pub const RABBITMQ_QUEUE: &str = "RabbitMQQueue";
    pub const FIREHOSE_QUEUE: &str = "FirehoseQueue";
    pub const AGENT_TOOL_QUEUE: &str = "AgentToolQueue";
    pub const GRPC_QUEUE: &str = "GrpcQueue";
}

/// Method names. Not every service implements every method.
pub mod methods {
    pub const POP: &str = "pop";
    pub const COMPLETE: &str = "complete";
    pub const RESPOND: &str = "respond";
    pub const WRITE_HEAD: &str = "writeHead";
    pub const WRITE: &str = "write";
    pub const END: &str = "end";
    pub const SEND: &str = "send";
    pub const SEND_ALL: &str = "sendAll";
}
