// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Realtime websocket trigger.
//!
//! Clients connect to `/firehose` and exchange JSON frames `{"name", "data"}`.
//! Every frame, plus the synthetic `connection` and `close` messages, is
//! offered to the targets subscribed to its name. Workers answer the
//! originating client with `send` or everybody with `sendAll`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use fnhost_core::queue::FirehoseQueue;
use fnhost_core::{EventQueue, QueueService};
use fnhost_protocol::messages::{Event, EventType, FirehoseClient, FirehoseMessage, Target};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Completions, Enqueuer, EnqueuerContext, Outcome, Trigger, enqueue_event};
use crate::error::EnqueuerError;

pub const CONNECTION: &str = "connection";
pub const CLOSE: &str = "close";
/// Subscribes to every message name.
pub const ANY_MESSAGE: &str = "**";

/// Wire frame in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Outbound data is JSON text, sent as a value when it parses.
    fn outbound(name: String, data: String) -> Self {
        let data = serde_json::from_str(&data).unwrap_or(Value::String(data));
        Self { name, data }
    }
}

struct Shared {
    event_queue: Arc<EventQueue>,
    queue: Arc<FirehoseQueue>,
    completions: Completions,
    /// Target and the message name it listens to.
    subscriptions: RwLock<Vec<(Target, String)>>,
}

impl Shared {
    async fn publish(&self, client: &FirehoseClient, name: &str, data: &Value) -> Vec<String> {
        let targets: Vec<Target> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|(_, event)| event == ANY_MESSAGE || event == name)
            .map(|(target, _)| target.clone())
            .collect();

        let pool_size = u32::try_from(self.queue.pool_size()).unwrap_or(u32::MAX);
        targets
            .iter()
            .map(|target| {
                let id = uuid::Uuid::new_v4().to_string();
                self.queue.enqueue(
                    &id,
                    FirehoseMessage {
                        id: id.clone(),
                        client: Some(client.clone()),
                        pool_size,
                        name: name.to_string(),
                        data: data.to_string(),
                    },
                );
                let _ = self.completions.register(&id);
                enqueue_event(&self.event_queue, EventType::Firehose, &id, target)
            })
            .collect()
    }
}

pub struct FirehoseEnqueuer {
    shared: Arc<Shared>,
}

impl FirehoseEnqueuer {
    pub fn new(event_queue: Arc<EventQueue>) -> Self {
        Self {
            shared: Arc::new(Shared {
                event_queue,
                queue: Arc::new(FirehoseQueue::new()),
                completions: Completions::new(),
                subscriptions: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn factory(ctx: &EnqueuerContext) -> Arc<dyn Enqueuer> {
        Arc::new(Self::new(ctx.event_queue.clone()))
    }

    pub fn queue(&self) -> &Arc<FirehoseQueue> {
        &self.shared.queue
    }

    /// Offer a message from `client` to the subscribed targets. Returns the
    /// ids of the events created.
    pub async fn publish(&self, client: &FirehoseClient, name: &str, data: &Value) -> Vec<String> {
        self.shared.publish(client, name, data).await
    }
}

#[async_trait]
impl Enqueuer for FirehoseEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Firehose
    }

    fn service(&self) -> Option<Arc<dyn QueueService>> {
        Some(self.shared.queue.clone() as Arc<dyn QueueService>)
    }

    fn router(&self) -> Option<Router> {
        Some(
            Router::new()
                .route("/firehose", get(ws_handler))
                .with_state(self.shared.clone()),
        )
    }

    async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError> {
        let kind = trigger.kind();
        let Trigger::Firehose { event } = trigger else {
            return Err(EnqueuerError::Unsupported(kind));
        };
        info!(target = %target.id, event = %event, "Firehose trigger bound");
        self.shared.subscriptions.write().await.push((target, event));
        Ok(())
    }

    async fn unsubscribe(&self, target_id: &str) -> bool {
        let mut subscriptions = self.shared.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|(target, _)| target.id != target_id);
        subscriptions.len() != before
    }

    fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        self.shared.queue.release(&event.id);
        self.shared.completions.resolve(&event.id, outcome);
    }

    async fn on_events_are_drained(&self) {
        self.shared.completions.drained().await;
    }

    async fn stop(&self) {
        self.shared.subscriptions.write().await.clear();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(shared): State<Arc<Shared>>,
) -> impl IntoResponse {
    let remote_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, shared, remote_address))
}

async fn handle_socket(mut socket: WebSocket, shared: Arc<Shared>, remote_address: String) {
    let client = FirehoseClient {
        id: uuid::Uuid::new_v4().to_string(),
        remote_address,
    };
    let mut outbound = shared.queue.connect(&client.id);
    info!(client = %client.id, pool_size = shared.queue.pool_size(), "Firehose client connected");
    shared.publish(&client, CONNECTION, &Value::Null).await;

    loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                let frame = Frame::outbound(message.name, message.data);
                let Ok(json) = serde_json::to_string(&frame) else {
                    continue;
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    debug!(client = %client.id, "Client went away during send");
                    break;
                }
            }
            result = socket.recv() => match result {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => {
                        shared.publish(&client, &frame.name, &frame.data).await;
                    }
                    Err(e) => warn!(client = %client.id, error = %e, "Ignoring malformed frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(client = %client.id, error = %e, "Firehose socket error");
                    break;
                }
                _ => {}
            },
        }
    }

    shared.queue.disconnect(&client.id);
    shared.publish(&client, CLOSE, &Value::Null).await;
    info!(client = %client.id, "Firehose client disconnected");
}
