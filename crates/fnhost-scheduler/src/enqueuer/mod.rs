// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger enqueuers.
//!
//! An enqueuer watches one external source, turns each occurrence into
//! [`Event`]s for the targets subscribed to it, and settles the triggering
//! party once the scheduler reports the outcome.
//!
//! | Kind | Source | Domain queue | Settles by |
//! |------|--------|--------------|------------|
//! | `HTTP` | `/fn-execute/{*path}` | `HttpQueue` | flushing the response |
//! | `DATABASE` | `collection_changes` log | `DatabaseQueue` | - |
//! | `SCHEDULE` | cron timers | none | - |
//! | `FIREHOSE` | `/firehose` websocket | `FirehoseQueue` | - |
//! | `RABBITMQ` | [`Broker`](rabbitmq::Broker) queues (AMQP or in-process) | `RabbitMQQueue` | ack / nack |
//! | `AGENT_TOOL` | [`call_tool`](agent_tool::AgentToolEnqueuer::call_tool) | `AgentToolQueue` | resolving the caller |
//! | `GRPC` | [`invoke`](grpc::GrpcEnqueuer::invoke) | `GrpcQueue` | resolving the caller |

pub mod agent_tool;
pub mod amqp;
pub mod database;
pub mod firehose;
pub mod grpc;
pub mod http;
pub mod rabbitmq;
pub mod schedule;

pub use agent_tool::{AgentToolEnqueuer, ToolSpec};
pub use amqp::AmqpBroker;
pub use database::DatabaseEnqueuer;
pub use firehose::FirehoseEnqueuer;
pub use grpc::GrpcEnqueuer;
pub use http::HttpEnqueuer;
pub use rabbitmq::{Broker, Delivery, MemoryBroker, RabbitMqEnqueuer};
pub use schedule::ScheduleEnqueuer;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use dashmap::DashMap;
use fnhost_core::{ClassCommander, EventQueue, JobReducer, Persistence, QueueService};
use fnhost_protocol::messages::{Event, EventType, Target};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use crate::error::EnqueuerError;

/// How an event ended, as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// The worker reported failure.
    Failed,
    TimedOut,
    /// The worker process died mid-event.
    Crashed,
    /// Dequeued or dropped at shutdown before any worker ran it.
    Cancelled,
}

impl Outcome {
    pub fn reported(succeeded: bool) -> Self {
        if succeeded {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        }
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Succeeded
    }
}

/// What a target is wired to. One variant per event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Http {
        #[serde(default = "any_method")]
        method: String,
        /// Path below `/fn-execute`, `:name` segments capture parameters.
        path: String,
    },
    Database {
        collection: String,
        /// Change kinds to react to, empty for all.
        #[serde(default)]
        operations: Vec<String>,
    },
    Schedule {
        cron: String,
        #[serde(default = "utc")]
        timezone: String,
    },
    Firehose {
        /// Message name, `**` for every message.
        #[serde(default = "every_message")]
        event: String,
    },
    Rabbitmq {
        queue: String,
    },
    AgentTool {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        input_schema: serde_json::Value,
    },
    Grpc {
        service: String,
        method: String,
    },
}

fn any_method() -> String {
    "*".to_string()
}

fn utc() -> String {
    "UTC".to_string()
}

fn every_message() -> String {
    "**".to_string()
}

impl Trigger {
    pub fn kind(&self) -> EventType {
        match self {
            Trigger::Http { .. } => EventType::Http,
            Trigger::Database { .. } => EventType::Database,
            Trigger::Schedule { .. } => EventType::Schedule,
            Trigger::Firehose { .. } => EventType::Firehose,
            Trigger::Rabbitmq { .. } => EventType::Rabbitmq,
            Trigger::AgentTool { .. } => EventType::AgentTool,
            Trigger::Grpc { .. } => EventType::Grpc,
        }
    }
}

/// Adapter from one external trigger source to events.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    fn kind(&self) -> EventType;

    /// Domain queue workers fetch this enqueuer's payloads from.
    fn service(&self) -> Option<Arc<dyn QueueService>> {
        None
    }

    /// Routes served on the host's HTTP listener.
    fn router(&self) -> Option<Router> {
        None
    }

    /// Begin watching the source.
    async fn start(&self) -> Result<(), EnqueuerError> {
        Ok(())
    }

    async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError>;

    /// Remove every subscription of `target_id`. Returns whether any existed.
    async fn unsubscribe(&self, target_id: &str) -> bool;

    /// Settle the triggering party. Called exactly once per event.
    fn on_event_completed(&self, event: &Event, outcome: Outcome);

    /// Resolves once no event produced by this enqueuer is unsettled.
    async fn on_events_are_drained(&self);

    /// Stop watching the source. Unsettled events still get their outcome.
    async fn stop(&self);
}

/// Everything a factory may wire into an enqueuer.
#[derive(Clone)]
pub struct EnqueuerContext {
    pub event_queue: Arc<EventQueue>,
    pub persistence: Arc<dyn Persistence>,
    pub job_reducer: Option<Arc<JobReducer>>,
    pub commander: Option<Arc<ClassCommander>>,
    pub broker: Arc<dyn Broker>,
    /// Polling interval of log-backed sources.
    pub poll_interval: Duration,
}

pub type EnqueuerFactory = fn(&EnqueuerContext) -> Arc<dyn Enqueuer>;

/// One factory per event type.
pub const STANDARD_FACTORIES: &[EnqueuerFactory] = &[
    HttpEnqueuer::factory,
    DatabaseEnqueuer::factory,
    ScheduleEnqueuer::factory,
    FirehoseEnqueuer::factory,
    RabbitMqEnqueuer::factory,
    AgentToolEnqueuer::factory,
    GrpcEnqueuer::factory,
];

/// Maps each event type to the enqueuer that owns it.
#[derive(Default)]
pub struct EnqueuerRegistry {
    enqueuers: BTreeMap<EventType, Arc<dyn Enqueuer>>,
}

impl EnqueuerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_factories(
        ctx: &EnqueuerContext,
        factories: &[EnqueuerFactory],
    ) -> Result<Self, EnqueuerError> {
        let mut registry = Self::new();
        for factory in factories {
            registry.register(factory(ctx))?;
        }
        Ok(registry)
    }

    /// Registry with every built-in enqueuer.
    pub fn standard(ctx: &EnqueuerContext) -> Result<Self, EnqueuerError> {
        Self::from_factories(ctx, STANDARD_FACTORIES)
    }

    pub fn register(&mut self, enqueuer: Arc<dyn Enqueuer>) -> Result<(), EnqueuerError> {
        let kind = enqueuer.kind();
        if self.enqueuers.contains_key(&kind) {
            return Err(EnqueuerError::Duplicate(kind));
        }
        self.enqueuers.insert(kind, enqueuer);
        Ok(())
    }

    pub fn get(&self, kind: EventType) -> Option<&Arc<dyn Enqueuer>> {
        self.enqueuers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<EventType> {
        self.enqueuers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Enqueuer>> {
        self.enqueuers.values()
    }

    /// Domain queues to register on the event queue.
    pub fn services(&self) -> Vec<Arc<dyn QueueService>> {
        self.iter().filter_map(|e| e.service()).collect()
    }

    /// All enqueuer routes merged, `None` if no enqueuer serves HTTP.
    pub fn router(&self) -> Option<Router> {
        self.iter()
            .filter_map(|e| e.router())
            .reduce(|merged, router| merged.merge(router))
    }

    pub async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError> {
        let kind = trigger.kind();
        let enqueuer = self.get(kind).ok_or(EnqueuerError::Unsupported(kind))?;
        enqueuer.subscribe(target, trigger).await
    }

    pub async fn unsubscribe(&self, target_id: &str) -> bool {
        let mut any = false;
        for enqueuer in self.iter() {
            any |= enqueuer.unsubscribe(target_id).await;
        }
        any
    }

    /// Route an outcome to the enqueuer that produced `event`, then drop
    /// whatever payload the worker did not fetch.
    pub fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        let Some(enqueuer) = event.kind().and_then(|kind| self.get(kind)) else {
            warn!(event_id = %event.id, r#type = event.r#type, "No enqueuer for completed event");
            return;
        };
        enqueuer.on_event_completed(event, outcome);
        if let Some(service) = enqueuer.service() {
            service.discard(&event.id);
        }
    }

    pub async fn start_all(&self) -> Result<(), EnqueuerError> {
        for enqueuer in self.iter() {
            enqueuer.start().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for enqueuer in self.iter() {
            enqueuer.stop().await;
        }
    }

    /// Resolves once every enqueuer has no unsettled event.
    pub async fn drained(&self) {
        futures::future::join_all(self.iter().map(|e| e.on_events_are_drained())).await;
    }
}

/// Unsettled events of one enqueuer and their outcome channels.
#[derive(Debug, Default)]
pub struct Completions {
    pending: DashMap<String, oneshot::Sender<Outcome>>,
    idle: Notify,
}

impl Completions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id`. Register before enqueueing so the outcome cannot be missed.
    pub fn register(&self, id: impl Into<String>) -> oneshot::Receiver<Outcome> {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id.into(), sender);
        receiver
    }

    /// Deliver the outcome of `id`. Returns `false` for unknown ids.
    pub fn resolve(&self, id: &str, outcome: Outcome) -> bool {
        let Some((_, sender)) = self.pending.remove(id) else {
            return false;
        };
        if sender.send(outcome).is_err() {
            debug!(event_id = %id, "Nobody waits for this outcome");
        }
        if self.pending.is_empty() {
            self.idle.notify_waiters();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            if self.pending.is_empty() {
                return;
            }
            idle.await;
        }
    }
}

/// Build the event for `target` and hand it to the event queue.
pub(crate) fn enqueue_event(
    event_queue: &EventQueue,
    kind: EventType,
    id: &str,
    target: &Target,
) -> String {
    event_queue.enqueue(Event {
        id: id.to_string(),
        r#type: kind as i32,
        target: Some(target.clone()),
    })
}

/// Cancels the event if the waiting caller goes away first.
pub(crate) struct DequeueOnDrop {
    event_queue: Arc<EventQueue>,
    id: String,
    armed: bool,
}

impl DequeueOnDrop {
    pub(crate) fn new(event_queue: Arc<EventQueue>, id: impl Into<String>) -> Self {
        Self {
            event_queue,
            id: id.into(),
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DequeueOnDrop {
    fn drop(&mut self) {
        if self.armed {
            debug!(event_id = %self.id, "Caller gone, dequeueing event");
            self.event_queue.dequeue(&self.id);
        }
    }
}
