// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unary gRPC trigger. Each `service/method` pair is bound to one target.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fnhost_core::queue::GrpcQueue;
use fnhost_core::{EventQueue, QueueService};
use fnhost_protocol::messages::{Event, EventType, GrpcCall, Target, grpc_response};
use tokio::sync::RwLock;
use tracing::info;

use super::{
    Completions, DequeueOnDrop, Enqueuer, EnqueuerContext, Outcome, Trigger, enqueue_event,
};
use crate::error::EnqueuerError;

pub struct GrpcEnqueuer {
    event_queue: Arc<EventQueue>,
    queue: Arc<GrpcQueue>,
    completions: Completions,
    methods: RwLock<HashMap<(String, String), Target>>,
}

impl GrpcEnqueuer {
    pub fn new(event_queue: Arc<EventQueue>) -> Self {
        Self {
            event_queue,
            queue: Arc::new(GrpcQueue::new()),
            completions: Completions::new(),
            methods: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(ctx: &EnqueuerContext) -> Arc<dyn Enqueuer> {
        Arc::new(Self::new(ctx.event_queue.clone()))
    }

    /// Forward one call and wait for the worker's reply payload.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, EnqueuerError> {
        let target = self
            .methods
            .read()
            .await
            .get(&(service.to_string(), method.to_string()))
            .cloned()
            .ok_or_else(|| EnqueuerError::UnknownMethod {
                service: service.to_string(),
                method: method.to_string(),
            })?;

        let id = uuid::Uuid::new_v4().to_string();
        let response = self.queue.enqueue(
            &id,
            GrpcCall {
                id: id.clone(),
                service: service.to_string(),
                method: method.to_string(),
                payload,
            },
        );
        let _ = self.completions.register(&id);
        enqueue_event(&self.event_queue, EventType::Grpc, &id, &target);
        let guard = DequeueOnDrop::new(self.event_queue.clone(), &id);

        let response = response.await;
        guard.disarm();
        match response.map(|r| r.outcome) {
            Ok(Some(grpc_response::Outcome::Payload(payload))) => Ok(payload),
            Ok(Some(grpc_response::Outcome::Error(error))) => Err(EnqueuerError::Handler(error)),
            Ok(None) => Err(EnqueuerError::Handler("empty response".to_string())),
            Err(_) => Err(EnqueuerError::NoResponse(id)),
        }
    }
}

#[async_trait]
impl Enqueuer for GrpcEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Grpc
    }

    fn service(&self) -> Option<Arc<dyn QueueService>> {
        Some(self.queue.clone() as Arc<dyn QueueService>)
    }

    async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError> {
        let kind = trigger.kind();
        let Trigger::Grpc { service, method } = trigger else {
            return Err(EnqueuerError::Unsupported(kind));
        };
        info!(target = %target.id, service = %service, method = %method, "gRPC method bound");
        self.methods.write().await.insert((service, method), target);
        Ok(())
    }

    async fn unsubscribe(&self, target_id: &str) -> bool {
        let mut methods = self.methods.write().await;
        let before = methods.len();
        methods.retain(|_, target| target.id != target_id);
        methods.len() != before
    }

    fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        self.completions.resolve(&event.id, outcome);
    }

    async fn on_events_are_drained(&self) {
        self.completions.drained().await;
    }

    async fn stop(&self) {
        self.methods.write().await.clear();
    }
}
