// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP trigger.
//!
//! Requests under `/fn-execute` are matched against the subscribed routes,
//! queued for a worker and answered with whatever the worker streams back
//! through `writeHead`, `write` and `end`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use fnhost_core::QueueService;
use fnhost_core::queue::{HttpQueue, ResponsePart, ResponseReceiver};
use fnhost_protocol::messages::{Event, EventType, Header, HttpRequest, Pop, Target};
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};

use super::{
    Completions, DequeueOnDrop, Enqueuer, EnqueuerContext, Outcome, Trigger, enqueue_event,
};
use crate::error::EnqueuerError;

/// Mount point of every function route.
pub const ROUTE_PREFIX: &str = "/fn-execute";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
    /// Trailing `*` or `*name`, matches the rest of the path.
    Rest(String),
}

/// A route path such as `/books/:id` or `/files/*path`.
#[derive(Debug, Clone, PartialEq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(format!("empty parameter name in '{}'", pattern));
                }
                Segment::Param(name.to_string())
            } else if let Some(name) = part.strip_prefix('*') {
                if i + 1 != parts.len() {
                    return Err(format!("wildcard must be the last segment in '{}'", pattern));
                }
                Segment::Rest(if name.is_empty() { "*" } else { name }.to_string())
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    /// Captured parameters when `path` matches.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = Vec::new();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest(name) => {
                    params.push((name.clone(), parts.get(i..)?.join("/")));
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    if parts.get(i)? != literal {
                        return None;
                    }
                }
                Segment::Param(name) => params.push((name.clone(), parts.get(i)?.to_string())),
            }
        }
        (parts.len() == self.segments.len()).then_some(params)
    }
}

#[derive(Debug, Clone)]
struct Route {
    target: Target,
    /// Uppercase method, `*` for any.
    method: String,
    pattern: PathPattern,
}

struct Shared {
    event_queue: Arc<fnhost_core::EventQueue>,
    queue: Arc<HttpQueue>,
    completions: Completions,
    routes: RwLock<Vec<Route>>,
}

impl Shared {
    async fn resolve(&self, method: &str, path: &str) -> Option<(Target, Vec<(String, String)>)> {
        self.routes.read().await.iter().find_map(|route| {
            if route.method != "*" && route.method != method {
                return None;
            }
            let params = route.pattern.matches(path)?;
            Some((route.target.clone(), params))
        })
    }
}

pub struct HttpEnqueuer {
    shared: Arc<Shared>,
}

impl HttpEnqueuer {
    pub fn new(event_queue: Arc<fnhost_core::EventQueue>) -> Self {
        Self {
            shared: Arc::new(Shared {
                event_queue,
                queue: Arc::new(HttpQueue::new()),
                completions: Completions::new(),
                routes: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn factory(ctx: &EnqueuerContext) -> Arc<dyn Enqueuer> {
        Arc::new(Self::new(ctx.event_queue.clone()))
    }

    pub fn queue(&self) -> &Arc<HttpQueue> {
        &self.shared.queue
    }
}

#[async_trait]
impl Enqueuer for HttpEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Http
    }

    fn service(&self) -> Option<Arc<dyn QueueService>> {
        Some(self.shared.queue.clone() as Arc<dyn QueueService>)
    }

    fn router(&self) -> Option<Router> {
        Some(
            Router::new()
                .route(ROUTE_PREFIX, any(execute))
                .route(&format!("{}/{{*path}}", ROUTE_PREFIX), any(execute))
                .with_state(self.shared.clone()),
        )
    }

    async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError> {
        let kind = trigger.kind();
        let Trigger::Http { method, path } = trigger else {
            return Err(EnqueuerError::Unsupported(kind));
        };
        let pattern = PathPattern::parse(&path).map_err(|reason| EnqueuerError::InvalidTrigger {
            target: target.id.clone(),
            reason,
        })?;
        let method = match method.to_ascii_uppercase().as_str() {
            "" | "*" | "ANY" => "*".to_string(),
            other => other.to_string(),
        };
        info!(target = %target.id, method = %method, path = %path, "HTTP route bound");
        self.shared.routes.write().await.push(Route {
            target,
            method,
            pattern,
        });
        Ok(())
    }

    async fn unsubscribe(&self, target_id: &str) -> bool {
        let mut routes = self.shared.routes.write().await;
        let before = routes.len();
        routes.retain(|route| route.target.id != target_id);
        routes.len() != before
    }

    fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        // A worker that succeeded without ending its response still gets it flushed.
        if outcome.is_success() && self.shared.queue.has_stream(&event.id) {
            let _ = self.shared.queue.end(&Pop {
                id: event.id.clone(),
            });
        }
        self.shared.completions.resolve(&event.id, outcome);
    }

    async fn on_events_are_drained(&self) {
        self.shared.completions.drained().await;
    }

    async fn stop(&self) {
        self.shared.routes.write().await.clear();
    }
}

async fn execute(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().strip_prefix(ROUTE_PREFIX).unwrap_or(uri.path());
    let path = if path.is_empty() { "/" } else { path };

    let Some((target, params)) = shared.resolve(method.as_str(), path).await else {
        debug!(method = %method, path = %path, "No route matched");
        return (StatusCode::NOT_FOUND, "No function is bound to this route").into_response();
    };

    let id = uuid::Uuid::new_v4().to_string();
    let request = HttpRequest {
        id: id.clone(),
        method: method.to_string(),
        url: uri.to_string(),
        path: path.to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                Some(Header {
                    key: name.as_str().to_string(),
                    value: value.to_str().ok()?.to_string(),
                })
            })
            .collect(),
        params: params
            .into_iter()
            .map(|(key, value)| Header { key, value })
            .collect(),
        body: body.to_vec(),
    };

    let parts = shared.queue.enqueue(&id, request);
    let outcome = shared.completions.register(&id);
    enqueue_event(&shared.event_queue, EventType::Http, &id, &target);
    let guard = DequeueOnDrop::new(shared.event_queue.clone(), &id);

    let response = collect_response(&id, parts, outcome).await;
    guard.disarm();
    response
}

/// Assemble the worker's response stream into one HTTP response.
async fn collect_response(
    id: &str,
    mut parts: ResponseReceiver,
    mut outcome: oneshot::Receiver<Outcome>,
) -> Response {
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    let mut body = Vec::new();

    while let Some(part) = parts.recv().await {
        match part {
            ResponsePart::Head {
                status: code,
                headers: head,
            } => {
                status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
                for (key, value) in head {
                    match (
                        HeaderName::from_bytes(key.as_bytes()),
                        HeaderValue::from_str(&value),
                    ) {
                        (Ok(name), Ok(value)) => {
                            headers.append(name, value);
                        }
                        _ => warn!(event_id = %id, header = %key, "Dropping invalid response header"),
                    }
                }
            }
            ResponsePart::Body(chunk) => body.extend_from_slice(&chunk),
            ResponsePart::End => {
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                return response;
            }
        }
    }

    // Stream closed without an end: the event failed.
    match outcome.try_recv() {
        Ok(Outcome::TimedOut) => {
            (StatusCode::GATEWAY_TIMEOUT, "Function timed out").into_response()
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Function failed").into_response(),
    }
}
