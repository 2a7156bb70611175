// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use fnhost_protocol::messages::{Empty, GrpcCall, GrpcResponse, Pop};
use fnhost_protocol::rpc::{methods, services};
use prost::Message;
use tokio::sync::oneshot;

use super::Bridge;
use crate::error::Result;
use crate::service::{QueueService, decode, unknown_method};

/// Unary gRPC calls forwarded to a worker.
#[derive(Debug, Default)]
pub struct GrpcQueue {
    bridge: Bridge<GrpcCall, GrpcResponse>,
}

impl GrpcQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, id: impl Into<String>, call: GrpcCall) -> oneshot::Receiver<GrpcResponse> {
        self.bridge.enqueue(id, call)
    }

    pub fn pop(&self, pop: &Pop) -> Result<GrpcCall> {
        self.bridge.pop(&pop.id)
    }

    pub fn respond(&self, response: GrpcResponse) -> Result<()> {
        let id = response.id.clone();
        self.bridge.respond(&id, response)
    }

    pub fn size(&self) -> usize {
        self.bridge.size()
    }
}

#[async_trait]
impl QueueService for GrpcQueue {
    fn service_name(&self) -> &'static str {
        services::GRPC_QUEUE
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
