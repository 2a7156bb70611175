// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP invocations.
//!
//! An HTTP call is a multi-step exchange: the worker pops the request, then
//! streams the response back through `writeHead`, `write` and finally `end`.
//! The request entry is removed on pop while the response stream entry lives
//! until `end`, so "request fetched" and "response sent" are tracked apart.

use async_trait::async_trait;
use dashmap::DashMap;
use fnhost_protocol::messages::{Empty, HttpRequest, HttpWrite, HttpWriteHead, Pop};
use fnhost_protocol::rpc::{methods, services};
use prost::Message;
use tokio::sync::mpsc;
use tracing::debug;

use super::Mailbox;
use crate::error::{CoreError, Result};
use crate::service::{QueueService, decode, unknown_method};

/// A piece of the response produced by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Head {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Body(Vec<u8>),
    End,
}

/// Host-side end of a response stream.
pub type ResponseReceiver = mpsc::UnboundedReceiver<ResponsePart>;

#[derive(Debug, Default)]
pub struct HttpQueue {
    requests: Mailbox<HttpRequest>,
    streams: DashMap<String, mpsc::UnboundedSender<ResponsePart>>,
}

impl HttpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `request` and open its response stream.
    pub fn enqueue(&self, id: impl Into<String>, request: HttpRequest) -> ResponseReceiver {
        let id = id.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.streams.insert(id.clone(), sender);
        self.requests.insert(id, request);
        receiver
    }

    pub fn pop(&self, pop: &Pop) -> Result<HttpRequest> {
        match self.requests.take(&pop.id) {
            Some(request) => Ok(request),
            None if self.streams.contains_key(&pop.id) => {
                Err(CoreError::NoItem { id: pop.id.clone() })
            }
            None => Err(CoreError::UnknownRequest { id: pop.id.clone() }),
        }
    }

    pub fn write_head(&self, head: HttpWriteHead) -> Result<()> {
        let status = u16::try_from(head.status_code)
            .ok()
            .filter(|code| (100..=999).contains(code))
            .ok_or_else(|| CoreError::InvalidRequest {
                message: format!("invalid status code {}", head.status_code),
            })?;
        self.push(
            &head.id,
            ResponsePart::Head {
                status,
                headers: head.headers.into_iter().map(|h| (h.key, h.value)).collect(),
            },
        )
    }

    pub fn write(&self, chunk: HttpWrite) -> Result<()> {
        self.push(&chunk.id, ResponsePart::Body(chunk.data))
    }

    /// Finish the response and release the stream entry.
    pub fn end(&self, pop: &Pop) -> Result<()> {
        let (_, stream) = self
            .streams
            .remove(&pop.id)
            .ok_or_else(|| CoreError::UnknownRequest { id: pop.id.clone() })?;
        if stream.send(ResponsePart::End).is_err() {
            debug!(id = %pop.id, "response receiver gone before end");
        }
        Ok(())
    }

    fn push(&self, id: &str, part: ResponsePart) -> Result<()> {
        let stream = self
            .streams
            .get(id)
            .ok_or_else(|| CoreError::UnknownRequest { id: id.to_string() })?;
        if stream.send(part).is_err() {
            debug!(id = %id, "response receiver gone");
        }
        Ok(())
    }

    /// Requests not yet popped.
    pub fn size(&self) -> usize {
        self.requests.len()
    }

    pub fn has_stream(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    /// Drop the request and close its stream without an `End`.
    pub fn abort(&self, id: &str) {
        self.requests.discard(id);
        self.streams.remove(id);
    }
}

#[async_trait]
impl QueueService for HttpQueue {
    fn service_name(&self) -> &'static str {
        services::HTTP_QUEUE
    }

    async fn handle(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match method {
            methods::POP => Ok(self.pop(&decode(payload)?)?.encode_to_vec()),
            methods::WRITE_HEAD => {
                self.write_head(decode(payload)?)?;
                Ok(Empty {}.encode_to_vec())
            }
            methods::WRITE => {
                self.write(decode(payload)?)?;
                Ok(Empty {}.encode_to_vec())
            }
            methods::END => {
                self.end(&decode(payload)?)?;
                Ok(Empty {}.encode_to_vec())
            }
            _ => Err(unknown_method(self.service_name(), method)),
        }
    }

    fn discard(&self, id: &str) {
        self.abort(id);
    }
}
