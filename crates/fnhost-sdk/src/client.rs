// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed calls against the host's event queue and domain queues.

use fnhost_protocol::messages::{
    BrokerMessage, Change, Complete, CompleteResult, Empty, Event, FirehoseMessage, FirehoseSend,
    GrpcCall, GrpcResponse, Header, HttpRequest, HttpWrite, HttpWriteHead, Pop, ToolCall,
    ToolResponse, WorkerPopRequest, grpc_response, tool_response,
};
use fnhost_protocol::rpc::{methods, services, status};
use fnhost_protocol::{ClientError, RpcClient};
use prost::Message;
use tracing::{debug, instrument};

use crate::config::WorkerConfig;
use crate::error::{Result, SdkError};

/// Connection of one worker process to its host.
pub struct WorkerClient {
    rpc: RpcClient,
    config: WorkerConfig,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let rpc = RpcClient::new(config.client_config()).map_err(SdkError::Connection)?;
        Ok(Self { rpc, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(WorkerConfig::from_env()?)
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Wait for the next event assigned to this worker.
    ///
    /// Fails with [`SdkError::NoNextEvent`] when the host is retiring the worker.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn pop_event(&self) -> Result<Event> {
        let request = WorkerPopRequest {
            id: self.config.worker_id.clone(),
        };
        match self
            .rpc
            .call::<_, Event>(services::EVENT_QUEUE, methods::POP, &request)
            .await
        {
            Ok(event) => {
                debug!(event_id = %event.id, target = %event.target_id(), "Event received");
                Ok(event)
            }
            Err(ClientError::Status { code, .. }) if code == status::NOT_FOUND => {
                Err(SdkError::NoNextEvent(self.config.worker_id.clone()))
            }
            Err(e) => Err(SdkError::from_client(e, &self.config.worker_id)),
        }
    }

    /// Report the end of `event_id`. Returns whether the host accepted it,
    /// `false` if the event had already timed out.
    pub async fn complete(&self, event_id: &str, succeeded: bool) -> Result<bool> {
        let result: CompleteResult = self
            .call(
                services::EVENT_QUEUE,
                methods::COMPLETE,
                event_id,
                &Complete {
                    id: event_id.to_string(),
                    succeeded,
                },
            )
            .await?;
        Ok(result.accepted)
    }

    // ========================================================================
    // Payloads
    // ========================================================================

    pub async fn database_change(&self, event_id: &str) -> Result<Change> {
        self.pop_payload(services::DATABASE_QUEUE, event_id).await
    }

    pub async fn http_request(&self, event_id: &str) -> Result<HttpRequest> {
        self.pop_payload(services::HTTP_QUEUE, event_id).await
    }

    pub async fn broker_message(&self, event_id: &str) -> Result<BrokerMessage> {
        self.pop_payload(services::RABBITMQ_QUEUE, event_id).await
    }

    pub async fn firehose_message(&self, event_id: &str) -> Result<FirehoseMessage> {
        self.pop_payload(services::FIREHOSE_QUEUE, event_id).await
    }

    pub async fn tool_call(&self, event_id: &str) -> Result<ToolCall> {
        self.pop_payload(services::AGENT_TOOL_QUEUE, event_id).await
    }

    pub async fn grpc_call(&self, event_id: &str) -> Result<GrpcCall> {
        self.pop_payload(services::GRPC_QUEUE, event_id).await
    }

    // ========================================================================
    // Replies
    // ========================================================================

    pub async fn http_write_head(
        &self,
        event_id: &str,
        status_code: u16,
        headers: &[(&str, &str)],
    ) -> Result<()> {
        let head = HttpWriteHead {
            id: event_id.to_string(),
            status_code: u32::from(status_code),
            headers: headers
                .iter()
                .map(|(key, value)| Header {
                    key: key.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        };
        self.send(services::HTTP_QUEUE, methods::WRITE_HEAD, event_id, &head)
            .await
    }

    pub async fn http_write(&self, event_id: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        let chunk = HttpWrite {
            id: event_id.to_string(),
            data: data.into(),
        };
        self.send(services::HTTP_QUEUE, methods::WRITE, event_id, &chunk)
            .await
    }

    /// Finish the HTTP response. Nothing can be written afterwards.
    pub async fn http_end(&self, event_id: &str) -> Result<()> {
        let pop = Pop {
            id: event_id.to_string(),
        };
        self.send(services::HTTP_QUEUE, methods::END, event_id, &pop)
            .await
    }

    /// Reply to the client that produced `event_id`.
    pub async fn firehose_send(
        &self,
        event_id: &str,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let message = firehose_send(event_id, name, data)?;
        self.send(services::FIREHOSE_QUEUE, methods::SEND, event_id, &message)
            .await
    }

    /// Broadcast to every connected client.
    pub async fn firehose_send_all(
        &self,
        event_id: &str,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let message = firehose_send(event_id, name, data)?;
        self.send(services::FIREHOSE_QUEUE, methods::SEND_ALL, event_id, &message)
            .await
    }

    pub async fn tool_respond(
        &self,
        event_id: &str,
        result: std::result::Result<serde_json::Value, String>,
    ) -> Result<()> {
        let outcome = match result {
            Ok(value) => tool_response::Outcome::Result(serde_json::to_string(&value)?),
            Err(error) => tool_response::Outcome::Error(error),
        };
        let response = ToolResponse {
            id: event_id.to_string(),
            outcome: Some(outcome),
        };
        self.send(services::AGENT_TOOL_QUEUE, methods::RESPOND, event_id, &response)
            .await
    }

    pub async fn grpc_respond(
        &self,
        event_id: &str,
        result: std::result::Result<Vec<u8>, String>,
    ) -> Result<()> {
        let outcome = match result {
            Ok(payload) => grpc_response::Outcome::Payload(payload),
            Err(error) => grpc_response::Outcome::Error(error),
        };
        let response = GrpcResponse {
            id: event_id.to_string(),
            outcome: Some(outcome),
        };
        self.send(services::GRPC_QUEUE, methods::RESPOND, event_id, &response)
            .await
    }

    pub async fn close(&self) {
        self.rpc.close().await;
    }

    async fn pop_payload<Resp: Message + Default>(
        &self,
        service: &str,
        event_id: &str,
    ) -> Result<Resp> {
        let pop = Pop {
            id: event_id.to_string(),
        };
        self.call(service, methods::POP, event_id, &pop).await
    }

    async fn send<Req: Message>(
        &self,
        service: &str,
        method: &str,
        event_id: &str,
        request: &Req,
    ) -> Result<()> {
        let _: Empty = self.call(service, method, event_id, request).await?;
        Ok(())
    }

    async fn call<Req: Message, Resp: Message + Default>(
        &self,
        service: &str,
        method: &str,
        event_id: &str,
        request: &Req,
    ) -> Result<Resp> {
        self.rpc
            .call(service, method, request)
            .await
            .map_err(|e| SdkError::from_client(e, event_id))
    }
}

fn firehose_send(event_id: &str, name: &str, data: &serde_json::Value) -> Result<FirehoseSend> {
    Ok(FirehoseSend {
        id: event_id.to_string(),
        name: name.to_string(),
        data: serde_json::to_string(data)?,
    })
}
