// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database change trigger.
//!
//! Tails the `collection_changes` log from the position it had at start and
//! turns every matching change into one event per subscribed target. With a
//! [`JobReducer`] only one replica runs a given change for a given target.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fnhost_core::persistence::ChangeRecord;
use fnhost_core::queue::DatabaseQueue;
use fnhost_core::{EventQueue, JobReducer, Persistence, QueueService};
use fnhost_protocol::messages::{Change, ChangeKind, Event, EventType, Target};
use serde_json::json;
use tokio::sync::{Mutex, Notify, RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Completions, Enqueuer, EnqueuerContext, Outcome, Trigger, enqueue_event};
use crate::error::EnqueuerError;

/// Changes fetched per poll.
const BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone)]
struct Subscription {
    target: Target,
    collection: String,
    /// Empty means every kind.
    kinds: Vec<ChangeKind>,
}

impl Subscription {
    fn wants(&self, collection: &str, kind: ChangeKind) -> bool {
        self.collection == collection && (self.kinds.is_empty() || self.kinds.contains(&kind))
    }
}

struct Shared {
    event_queue: Arc<EventQueue>,
    queue: Arc<DatabaseQueue>,
    persistence: Arc<dyn Persistence>,
    job_reducer: Option<Arc<JobReducer>>,
    completions: Completions,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Shared {
    fn enqueue(&self, target: &Target, change: Change) -> oneshot::Receiver<Outcome> {
        let id = uuid::Uuid::new_v4().to_string();
        self.queue.enqueue(&id, change);
        let outcome = self.completions.register(&id);
        enqueue_event(&self.event_queue, EventType::Database, &id, target);
        outcome
    }

    async fn dispatch(self: &Arc<Self>, record: ChangeRecord) {
        let Some(kind) = ChangeKind::from_str_name(&record.kind) else {
            warn!(seq = record.seq, kind = %record.kind, "Skipping change of unknown kind");
            return;
        };
        let targets: Vec<Target> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.wants(&record.collection, kind))
            .map(|s| s.target.clone())
            .collect();
        if targets.is_empty() {
            return;
        }

        let change = Change {
            kind: kind as i32,
            collection: record.collection,
            document_key: record.document_key,
            document: record.document.unwrap_or_default(),
            seq: record.seq,
        };
        debug!(seq = change.seq, collection = %change.collection, targets = targets.len(), "Dispatching change");

        for target in targets {
            match self.job_reducer.clone() {
                None => {
                    self.enqueue(&target, change.clone());
                }
                Some(reducer) => self.dispatch_once(reducer, target, change.clone()).await,
            }
        }
    }

    /// Enqueue unless another replica already claimed this change for
    /// `target`. Never waits on the other replica, so the cursor keeps
    /// moving. The claim is held until the event completes.
    async fn dispatch_once(self: &Arc<Self>, reducer: Arc<JobReducer>, target: Target, change: Change) {
        let meta = json!({
            "trigger": "database",
            "target": target.id,
            "handler": target.handler,
            "seq": change.seq,
        });
        let Some(claim) = reducer.try_claim(&meta).await else {
            debug!(seq = change.seq, target = %target.id, "Change claimed elsewhere, skipping");
            return;
        };

        let outcome = self.enqueue(&target, change);
        tokio::spawn(async move {
            let _ = outcome.await;
            claim.finish().await;
        });
    }
}

pub struct DatabaseEnqueuer {
    shared: Arc<Shared>,
    poll_interval: Duration,
    cursor: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl DatabaseEnqueuer {
    pub fn new(
        event_queue: Arc<EventQueue>,
        persistence: Arc<dyn Persistence>,
        job_reducer: Option<Arc<JobReducer>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                event_queue,
                queue: Arc::new(DatabaseQueue::new()),
                persistence,
                job_reducer,
                completions: Completions::new(),
                subscriptions: RwLock::new(Vec::new()),
            }),
            poll_interval,
            cursor: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn factory(ctx: &EnqueuerContext) -> Arc<dyn Enqueuer> {
        Arc::new(Self::new(
            ctx.event_queue.clone(),
            ctx.persistence.clone(),
            ctx.job_reducer.clone(),
            ctx.poll_interval,
        ))
    }

    pub fn queue(&self) -> &Arc<DatabaseQueue> {
        &self.shared.queue
    }
}

#[async_trait]
impl Enqueuer for DatabaseEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Database
    }

    fn service(&self) -> Option<Arc<dyn QueueService>> {
        Some(self.shared.queue.clone() as Arc<dyn QueueService>)
    }

    async fn start(&self) -> Result<(), EnqueuerError> {
        let mut cursor_task = self.cursor.lock().await;
        if cursor_task.is_some() {
            return Ok(());
        }

        let mut cursor = self.shared.persistence.latest_change_seq().await?;
        info!(cursor, "Watching collection changes");

        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let poll_interval = self.poll_interval;
        *cursor_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                match shared.persistence.changes_after(cursor, BATCH_SIZE).await {
                    Ok(records) => {
                        for record in records {
                            cursor = record.seq;
                            shared.dispatch(record).await;
                        }
                    }
                    Err(e) => warn!(error = %e, cursor, "Failed to read collection changes"),
                }
            }
            debug!(cursor, "Change watcher stopped");
        }));
        Ok(())
    }

    async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError> {
        let kind = trigger.kind();
        let Trigger::Database {
            collection,
            operations,
        } = trigger
        else {
            return Err(EnqueuerError::Unsupported(kind));
        };

        let mut kinds = Vec::with_capacity(operations.len());
        for operation in &operations {
            let kind =
                ChangeKind::from_str_name(operation).ok_or_else(|| EnqueuerError::InvalidTrigger {
                    target: target.id.clone(),
                    reason: format!("unknown operation '{}'", operation),
                })?;
            kinds.push(kind);
        }

        info!(target = %target.id, collection = %collection, operations = ?operations, "Database trigger bound");
        self.shared.subscriptions.write().await.push(Subscription {
            target,
            collection,
            kinds,
        });
        Ok(())
    }

    async fn unsubscribe(&self, target_id: &str) -> bool {
        let mut subscriptions = self.shared.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.target.id != target_id);
        subscriptions.len() != before
    }

    fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        self.shared.completions.resolve(&event.id, outcome);
    }

    async fn on_events_are_drained(&self) {
        self.shared.completions.drained().await;
    }

    async fn stop(&self) {
        self.shutdown.notify_one();
        if let Some(task) = self.cursor.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Change watcher panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnhost_core::SqlitePersistence;
    use fnhost_core::QueueNotice;
    use fnhost_protocol::RpcServerConfig;
    use fnhost_protocol::messages::Pop;

    fn target(id: &str) -> Target {
        Target {
            id: id.into(),
            cwd: "/srv/fn".into(),
            handler: "default".into(),
            context: None,
        }
    }

    async fn next_event(
        notices: &mut tokio::sync::mpsc::UnboundedReceiver<QueueNotice>,
    ) -> Event {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
                .await
                .unwrap()
                .unwrap();
            if let QueueNotice::Enqueued(event) = notice {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_matching_changes_become_events() {
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        persistence
            .record_change("books", "insert", "before-start", Some("{}"))
            .await
            .unwrap();

        let (event_queue, mut notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = DatabaseEnqueuer::new(
            event_queue,
            persistence.clone(),
            None,
            Duration::from_millis(10),
        );
        enqueuer
            .subscribe(
                target("on-book"),
                Trigger::Database {
                    collection: "books".into(),
                    operations: vec!["insert".into(), "update".into()],
                },
            )
            .await
            .unwrap();
        enqueuer.start().await.unwrap();

        persistence
            .record_change("authors", "insert", "a-1", Some("{}"))
            .await
            .unwrap();
        persistence
            .record_change("books", "delete", "b-0", None)
            .await
            .unwrap();
        persistence
            .record_change("books", "insert", "b-1", Some(r#"{"title":"Dune"}"#))
            .await
            .unwrap();

        let event = next_event(&mut notices).await;
        assert_eq!(event.kind(), Some(EventType::Database));
        assert_eq!(event.target_id(), "on-book");

        let change = enqueuer.queue().pop(&Pop { id: event.id.clone() }).unwrap();
        assert_eq!(change.document_key, "b-1");
        assert_eq!(change.kind, ChangeKind::Insert as i32);
        assert_eq!(change.document, r#"{"title":"Dune"}"#);

        enqueuer.on_event_completed(&event, Outcome::Succeeded);
        enqueuer.on_events_are_drained().await;
        enqueuer.stop().await;
        assert!(notices.try_recv().is_err());
    }

    fn reducer(owner: &str, persistence: &Arc<dyn Persistence>) -> Option<Arc<JobReducer>> {
        Some(Arc::new(JobReducer::new(persistence.clone(), owner)))
    }

    fn enqueued_count(notices: &mut tokio::sync::mpsc::UnboundedReceiver<QueueNotice>) -> usize {
        let mut count = 0;
        while let Ok(notice) = notices.try_recv() {
            if matches!(notice, QueueNotice::Enqueued(_)) {
                count += 1;
            }
        }
        count
    }

    fn books() -> Trigger {
        Trigger::Database {
            collection: "books".into(),
            operations: vec![],
        }
    }

    #[tokio::test]
    async fn test_change_runs_on_one_replica() {
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let (queue_a, mut notices_a) = EventQueue::new(RpcServerConfig::default());
        let (queue_b, mut notices_b) = EventQueue::new(RpcServerConfig::default());
        let a = DatabaseEnqueuer::new(
            queue_a,
            persistence.clone(),
            reducer("r1", &persistence),
            Duration::from_millis(10),
        );
        let b = DatabaseEnqueuer::new(
            queue_b,
            persistence.clone(),
            reducer("r2", &persistence),
            Duration::from_millis(10),
        );
        for enqueuer in [&a, &b] {
            enqueuer.subscribe(target("on-book"), books()).await.unwrap();
            enqueuer.start().await.unwrap();
        }

        persistence
            .record_change("books", "insert", "b-1", Some("{}"))
            .await
            .unwrap();

        let (winner, event) = tokio::select! {
            event = next_event(&mut notices_a) => (&a, event),
            event = next_event(&mut notices_b) => (&b, event),
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(enqueued_count(&mut notices_a) + enqueued_count(&mut notices_b), 0);

        winner.on_event_completed(&event, Outcome::Succeeded);
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_change_held_elsewhere_does_not_block_cursor() {
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let (event_queue, mut notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = DatabaseEnqueuer::new(
            event_queue,
            persistence.clone(),
            reducer("r2", &persistence),
            Duration::from_millis(10),
        );
        enqueuer.subscribe(target("on-book"), books()).await.unwrap();
        enqueuer
            .subscribe(
                target("on-author"),
                Trigger::Database {
                    collection: "authors".into(),
                    operations: vec![],
                },
            )
            .await
            .unwrap();
        enqueuer.start().await.unwrap();

        // Another replica picks up the next books change and never finishes.
        let other = JobReducer::new(persistence.clone(), "r1");
        let seq = persistence.latest_change_seq().await.unwrap() + 1;
        let held = other
            .try_claim(&json!({
                "trigger": "database",
                "target": "on-book",
                "handler": "default",
                "seq": seq,
            }))
            .await
            .unwrap();

        assert_eq!(
            persistence
                .record_change("books", "insert", "b-1", Some("{}"))
                .await
                .unwrap(),
            seq
        );
        persistence
            .record_change("authors", "insert", "a-1", Some("{}"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), next_event(&mut notices))
            .await
            .expect("authors change must not wait behind the held books change");
        assert_eq!(event.target_id(), "on-author");
        assert_eq!(enqueued_count(&mut notices), 0);

        enqueuer.on_event_completed(&event, Outcome::Succeeded);
        enqueuer.stop().await;
        drop(held);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_rejected() {
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let (event_queue, _notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = DatabaseEnqueuer::new(event_queue, persistence, None, Duration::from_millis(10));

        let err = enqueuer
            .subscribe(
                target("fn"),
                Trigger::Database {
                    collection: "books".into(),
                    operations: vec!["truncate".into()],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueuerError::InvalidTrigger { .. }));
    }
}
