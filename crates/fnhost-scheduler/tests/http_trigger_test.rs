// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP trigger driven through its axum router.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use fnhost_core::{EventQueue, QueueNotice};
use fnhost_protocol::RpcServerConfig;
use fnhost_protocol::messages::{Event, Header, HttpWrite, HttpWriteHead, Pop, Target};
use fnhost_scheduler::enqueuer::HttpEnqueuer;
use fnhost_scheduler::{Enqueuer, Outcome, Trigger};
use tokio::sync::mpsc::UnboundedReceiver;
use tower::ServiceExt;

async fn books_enqueuer() -> (Arc<HttpEnqueuer>, UnboundedReceiver<QueueNotice>) {
    let (event_queue, notices) = EventQueue::new(RpcServerConfig::default());
    let enqueuer = Arc::new(HttpEnqueuer::new(event_queue));
    enqueuer
        .subscribe(
            Target {
                id: "books".into(),
                ..Default::default()
            },
            Trigger::Http {
                method: "GET".into(),
                path: "/books/:id".into(),
            },
        )
        .await
        .unwrap();
    (enqueuer, notices)
}

async fn enqueued(notices: &mut UnboundedReceiver<QueueNotice>) -> Event {
    match notices.recv().await.unwrap() {
        QueueNotice::Enqueued(event) => event,
        other => panic!("unexpected notice: {:?}", other),
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_request_answered_by_worker() {
    let (enqueuer, mut notices) = books_enqueuer().await;
    let router = enqueuer.router().unwrap();
    let call = tokio::spawn(async move { router.oneshot(get("/fn-execute/books/42?full=1")).await });

    let event = enqueued(&mut notices).await;
    assert_eq!(event.target_id(), "books");
    let request = enqueuer.queue().pop(&Pop { id: event.id.clone() }).unwrap();
    assert_eq!(request.path, "/books/42");
    assert_eq!(request.query, "full=1");
    assert_eq!(
        request.params,
        vec![Header {
            key: "id".into(),
            value: "42".into()
        }]
    );

    let queue = enqueuer.queue();
    queue
        .write_head(HttpWriteHead {
            id: event.id.clone(),
            status_code: 202,
            headers: vec![Header {
                key: "x-book".into(),
                value: "42".into(),
            }],
        })
        .unwrap();
    queue
        .write(HttpWrite {
            id: event.id.clone(),
            data: b"dune".to_vec(),
        })
        .unwrap();
    queue.end(&Pop { id: event.id.clone() }).unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-book"], "42");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"dune");
}

#[tokio::test]
async fn test_unbound_route_is_not_found() {
    let (enqueuer, _notices) = books_enqueuer().await;
    let router = enqueuer.router().unwrap();

    let response = router.clone().oneshot(get("/fn-execute/authors/1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Method mismatch on a bound path.
    let post = Request::builder()
        .method("POST")
        .uri("/fn-execute/books/1")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(post).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_timed_out_event_is_gateway_timeout() {
    let (enqueuer, mut notices) = books_enqueuer().await;
    let router = enqueuer.router().unwrap();
    let call = tokio::spawn(async move { router.oneshot(get("/fn-execute/books/7")).await });

    let event = enqueued(&mut notices).await;
    enqueuer.on_event_completed(&event, Outcome::TimedOut);
    enqueuer.queue().abort(&event.id);

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_unsubscribe_removes_route() {
    let (enqueuer, _notices) = books_enqueuer().await;
    assert!(enqueuer.unsubscribe("books").await);
    assert!(!enqueuer.unsubscribe("books").await);

    let response = enqueuer
        .router()
        .unwrap()
        .oneshot(get("/fn-execute/books/1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
