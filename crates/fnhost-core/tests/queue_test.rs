// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain queue behaviour seen from the host and from the worker side.

use std::sync::Arc;

use fnhost_core::CoreError;
use fnhost_core::queue::{DatabaseQueue, HttpQueue};
use fnhost_protocol::messages::{Change, ChangeKind, HttpRequest, Pop};

fn change(seq: i64) -> Change {
    Change {
        kind: ChangeKind::Update as i32,
        collection: "books".into(),
        document_key: format!("b-{}", seq),
        document: r#"{"title":"Solaris"}"#.into(),
        seq,
    }
}

#[test]
fn test_database_enqueue_then_pop() {
    let queue = DatabaseQueue::new();
    queue.enqueue("2", change(2));
    assert_eq!(queue.size(), 1);

    let popped = queue.pop(&Pop { id: "2".into() }).unwrap();

    assert_eq!(popped, change(2));
    assert_eq!(queue.size(), 0);
}

#[test]
fn test_database_pop_on_empty_queue() {
    let queue = DatabaseQueue::new();

    let err = queue.pop(&Pop { id: "1".into() }).unwrap_err();

    assert!(matches!(err, CoreError::NoItem { .. }));
    assert_eq!(err.to_string(), "Queue has no item with id 1");
    assert_eq!(err.status_code(), "NOT_FOUND");
    assert_eq!(queue.size(), 0);
}

#[test]
fn test_http_end_releases_stream_without_touching_size() {
    let queue = HttpQueue::new();
    let _response = queue.enqueue(
        "h-1",
        HttpRequest {
            id: "h-1".into(),
            method: "POST".into(),
            path: "/orders".into(),
            ..Default::default()
        },
    );
    assert_eq!(queue.size(), 1);
    assert!(queue.has_stream("h-1"));

    queue.end(&Pop { id: "h-1".into() }).unwrap();

    assert!(!queue.has_stream("h-1"));
    assert_eq!(queue.size(), 1);

    queue.pop(&Pop { id: "h-1".into() }).unwrap();
    assert_eq!(queue.size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_pops_deliver_each_item_once() {
    let queue = Arc::new(DatabaseQueue::new());
    for seq in 0..50 {
        queue.enqueue(seq.to_string(), change(seq));
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut delivered = Vec::new();
            for seq in 0..50 {
                if let Ok(change) = queue.pop(&Pop { id: seq.to_string() }) {
                    delivered.push(change.seq);
                }
            }
            delivered
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort_unstable();

    assert_eq!(all, (0..50).collect::<Vec<_>>());
    assert_eq!(queue.size(), 0);
}
