// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static table of RPC services served on the shared endpoint.
//!
//! The table is assembled once, when the listener starts, from the event
//! queue and every registered domain queue. It never changes afterwards, so
//! the set of reachable `(service, method)` pairs is fixed for the lifetime
//! of a listener.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fnhost_protocol::rpc::{RpcRequest, RpcResponse};
use prost::Message;
use tracing::debug;

use crate::error::{CoreError, Result};

/// A queue reachable over RPC.
#[async_trait]
pub trait QueueService: Send + Sync {
    fn service_name(&self) -> &'static str;

    /// Decode `payload` for `method`, run it and encode the result.
    async fn handle(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Drop host-side state for an event cancelled before a worker popped it.
    fn discard(&self, _id: &str) {}
}

pub struct ServiceTable {
    services: HashMap<&'static str, Arc<dyn QueueService>>,
}

impl std::fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTable")
            .field("services", &self.names())
            .finish()
    }
}

impl ServiceTable {
    pub fn new(services: impl IntoIterator<Item = Arc<dyn QueueService>>) -> Result<Self> {
        let mut table = HashMap::new();
        for service in services {
            let name = service.service_name();
            if table.insert(name, service).is_some() {
                return Err(CoreError::DuplicateService {
                    service: name.to_string(),
                });
            }
        }
        Ok(Self { services: table })
    }

    pub fn get(&self, service: &str) -> Option<&Arc<dyn QueueService>> {
        self.services.get(service)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.services.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let result = match self.services.get(request.service.as_str()) {
            Some(service) => service.handle(&request.method, &request.payload).await,
            None => Err(CoreError::UnknownService {
                service: request.service.clone(),
            }),
        };

        match result {
            Ok(payload) => RpcResponse::payload(payload),
            Err(e) => {
                debug!(
                    service = %request.service,
                    method = %request.method,
                    code = e.status_code(),
                    error = %e,
                    "rpc failed"
                );
                RpcResponse::error(e.to_rpc_error())
            }
        }
    }
}

pub(crate) fn decode<M: Message + Default>(payload: &[u8]) -> Result<M> {
    Ok(M::decode(payload)?)
}

pub(crate) fn unknown_method(service: &str, method: &str) -> CoreError {
    CoreError::UnknownMethod {
        service: service.to_string(),
        method: method.to_string(),
    }
}
