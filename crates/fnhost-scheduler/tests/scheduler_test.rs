// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler decision loop tests.
//!
//! The tests play the worker side directly against the in-process event
//! queue (`pop` / `complete`), with [`MockRunner`] standing in for processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fnhost_core::{CoreError, EventQueue};
use fnhost_protocol::RpcServerConfig;
use fnhost_protocol::messages::{Batch, Complete, Event, EventType, Target, TargetContext};
use fnhost_scheduler::enqueuer::{Enqueuer, EnqueuerRegistry, Outcome, Trigger};
use fnhost_scheduler::error::{EnqueuerError, SchedulerError};
use fnhost_scheduler::runner::{MockRunner, Runner};
use fnhost_scheduler::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

/// Enqueuer that only records outcomes.
struct Recorder {
    outcomes: mpsc::UnboundedSender<(String, Outcome)>,
}

#[async_trait]
impl Enqueuer for Recorder {
    fn kind(&self) -> EventType {
        EventType::Http
    }

    async fn subscribe(&self, _target: Target, _trigger: Trigger) -> Result<(), EnqueuerError> {
        Ok(())
    }

    async fn unsubscribe(&self, _target_id: &str) -> bool {
        false
    }

    fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        let _ = self.outcomes.send((event.id.clone(), outcome));
    }

    async fn on_events_are_drained(&self) {}

    async fn stop(&self) {}
}

struct Harness {
    event_queue: Arc<EventQueue>,
    runner: Arc<MockRunner>,
    handle: SchedulerHandle,
    task: JoinHandle<()>,
    outcomes: mpsc::UnboundedReceiver<(String, Outcome)>,
}

impl Harness {
    async fn start(config: SchedulerConfig, runner: MockRunner) -> Self {
        let (event_queue, notices) = EventQueue::new(RpcServerConfig::default());
        let (tx, outcomes) = mpsc::unbounded_channel();
        let mut registry = EnqueuerRegistry::new();
        registry.register(Arc::new(Recorder { outcomes: tx })).unwrap();

        let runner = Arc::new(runner);
        let (handle, task) = Scheduler::new(
            config,
            event_queue.clone(),
            notices,
            runner.clone() as Arc<dyn Runner>,
            Arc::new(registry),
        )
        .start()
        .await
        .unwrap();

        Self {
            event_queue,
            runner,
            handle,
            task,
            outcomes,
        }
    }

    async fn pop(&self, worker_id: &str) -> Event {
        tokio::time::timeout(WAIT, self.event_queue.pop(worker_id))
            .await
            .expect("pop timed out")
            .unwrap()
    }

    async fn complete(&self, id: &str, succeeded: bool) -> bool {
        self.event_queue
            .complete(Complete {
                id: id.to_string(),
                succeeded,
            })
            .await
            .unwrap()
            .accepted
    }

    async fn outcome(&mut self) -> (String, Outcome) {
        tokio::time::timeout(WAIT, self.outcomes.recv())
            .await
            .expect("no outcome")
            .unwrap()
    }

    async fn wait_for_stats(&self, check: impl Fn(&SchedulerStats) -> bool) -> SchedulerStats {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let stats = self.handle.stats().await.unwrap();
            if check(&stats) {
                return stats;
            }
            assert!(tokio::time::Instant::now() < deadline, "stats never matched: {:?}", stats);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency: workers,
        default_timeout: Duration::from_secs(30),
        kill_grace: Duration::from_millis(100),
        respawn_backoff: Duration::from_millis(50),
        ..SchedulerConfig::default()
    }
}

fn event(id: &str, target: &str) -> Event {
    Event {
        id: id.to_string(),
        r#type: EventType::Http as i32,
        target: Some(Target {
            id: target.to_string(),
            cwd: format!("/srv/{}", target),
            handler: "default".to_string(),
            context: Some(TargetContext {
                env: HashMap::new(),
                timeout_ms: 0,
                batch: None,
            }),
        }),
    }
}

fn with_timeout(mut event: Event, timeout_ms: u64) -> Event {
    if let Some(context) = event.target.as_mut().and_then(|t| t.context.as_mut()) {
        context.timeout_ms = timeout_ms;
    }
    event
}

fn with_batch(mut event: Event, limit: u64, deadline_secs: u64) -> Event {
    if let Some(context) = event.target.as_mut().and_then(|t| t.context.as_mut()) {
        context.batch = Some(Batch {
            limit,
            deadline_secs,
        });
    }
    event
}

#[tokio::test]
async fn test_pool_is_spawned_with_worker_contract() {
    let h = Harness::start(config(2), MockRunner::new()).await;

    let spawned = h.runner.spawned().await;
    let ids: Vec<&str> = spawned.iter().map(|s| s.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["w0-1", "w1-1"]);
    assert_eq!(spawned[0].server_addr, SchedulerConfig::default().server_addr);

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.fresh, 2);
    assert_eq!(stats.starting, 0);
}

#[tokio::test]
async fn test_spawn_failure_at_start_is_an_error() {
    let runner = MockRunner::new();
    runner.set_fail_spawn(true);
    let (event_queue, notices) = EventQueue::new(RpcServerConfig::default());

    let result = Scheduler::new(
        config(1),
        event_queue,
        notices,
        Arc::new(runner),
        Arc::new(EnqueuerRegistry::new()),
    )
    .start()
    .await;
    assert!(matches!(result, Err(SchedulerError::Spawn { .. })));
}

#[tokio::test]
async fn test_assign_and_complete() {
    let mut h = Harness::start(config(1), MockRunner::new()).await;

    h.event_queue.enqueue(event("e-1", "books"));
    let popped = h.pop("w0-1").await;
    assert_eq!(popped.id, "e-1");
    assert_eq!(popped.target_id(), "books");

    assert!(h.complete("e-1", true).await);
    assert_eq!(h.outcome().await, ("e-1".to_string(), Outcome::Succeeded));

    h.event_queue.enqueue(event("e-2", "books"));
    assert_eq!(h.pop("w0-1").await.id, "e-2");
    assert!(h.complete("e-2", false).await);
    assert_eq!(h.outcome().await, ("e-2".to_string(), Outcome::Failed));
}

#[tokio::test]
async fn test_backlog_waits_for_a_free_worker() {
    let mut h = Harness::start(config(1), MockRunner::new()).await;

    h.event_queue.enqueue(event("e-1", "books"));
    h.event_queue.enqueue(event("e-2", "books"));
    assert_eq!(h.pop("w0-1").await.id, "e-1");
    h.wait_for_stats(|s| s.backlog == 1 && s.busy == 1).await;

    assert!(h.complete("e-1", true).await);
    assert_eq!(h.outcome().await.0, "e-1");
    assert_eq!(h.pop("w0-1").await.id, "e-2");
}

#[tokio::test]
async fn test_timeout_replaces_worker_and_rejects_late_completion() {
    let mut h = Harness::start(config(1), MockRunner::new()).await;

    h.event_queue.enqueue(with_timeout(event("e-1", "slow"), 50));
    assert_eq!(h.pop("w0-1").await.id, "e-1");

    assert_eq!(h.outcome().await, ("e-1".to_string(), Outcome::TimedOut));

    // First terminal outcome wins.
    assert!(!h.complete("e-1", true).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.outcomes.try_recv().is_err());
    assert!(h.runner.terminated().await.contains(&"w0-1".to_string()));

    h.event_queue.enqueue(event("e-2", "fast"));
    assert_eq!(h.pop("w0-2").await.id, "e-2");
}

#[tokio::test]
async fn test_stubborn_worker_is_killed_after_grace() {
    let mut h = Harness::start(config(1), MockRunner::stubborn()).await;

    h.event_queue.enqueue(with_timeout(event("e-1", "slow"), 20));
    h.pop("w0-1").await;
    assert_eq!(h.outcome().await.1, Outcome::TimedOut);

    h.event_queue.enqueue(event("e-2", "fast"));
    assert_eq!(h.pop("w0-2").await.id, "e-2");
    assert_eq!(h.runner.terminated().await, vec!["w0-1".to_string()]);
    assert_eq!(h.runner.killed().await, vec!["w0-1".to_string()]);
}

#[tokio::test]
async fn test_crash_settles_event_and_respawns() {
    let mut h = Harness::start(config(1), MockRunner::new()).await;

    h.event_queue.enqueue(event("e-1", "books"));
    h.pop("w0-1").await;
    assert!(h.runner.crash("w0-1"));

    assert_eq!(h.outcome().await, ("e-1".to_string(), Outcome::Crashed));
    assert!(!h.complete("e-1", true).await);

    h.wait_for_stats(|s| s.fresh == 1 && s.in_flight == 0).await;
    assert_eq!(h.runner.live_workers(), vec!["w0-2".to_string()]);
}

#[tokio::test]
async fn test_idle_worker_crash_is_replaced() {
    let h = Harness::start(config(1), MockRunner::new()).await;

    assert!(h.runner.crash("w0-1"));
    h.wait_for_stats(|s| s.fresh == 1).await;
    assert_eq!(h.runner.live_workers(), vec!["w0-2".to_string()]);
}

#[tokio::test]
async fn test_dequeue_cancels_only_unstarted_events() {
    let mut h = Harness::start(config(1), MockRunner::new()).await;

    // Assigned but never popped.
    h.event_queue.enqueue(event("e-1", "books"));
    h.event_queue.dequeue("e-1");
    assert_eq!(h.outcome().await, ("e-1".to_string(), Outcome::Cancelled));

    // Running, then a second event waiting behind it.
    h.event_queue.enqueue(event("e-2", "books"));
    assert_eq!(h.pop("w0-1").await.id, "e-2");
    h.event_queue.enqueue(event("e-3", "books"));
    h.event_queue.dequeue("e-3");
    h.event_queue.dequeue("e-2");
    assert_eq!(h.outcome().await, ("e-3".to_string(), Outcome::Cancelled));

    assert!(h.complete("e-2", true).await);
    assert_eq!(h.outcome().await, ("e-2".to_string(), Outcome::Succeeded));
}

#[tokio::test]
async fn test_invalidate_retires_warm_worker() {
    let mut h = Harness::start(config(1), MockRunner::new()).await;

    h.event_queue.enqueue(event("e-1", "books"));
    h.pop("w0-1").await;
    assert!(h.complete("e-1", true).await);
    h.outcome().await;

    h.handle.invalidate("books").unwrap();
    h.handle.stats().await.unwrap();
    assert_eq!(h.runner.terminated().await, vec!["w0-1".to_string()]);

    h.event_queue.enqueue(event("e-2", "books"));
    assert_eq!(h.pop("w0-2").await.id, "e-2");
}

#[tokio::test]
async fn test_invalidate_lets_running_event_finish() {
    let mut h = Harness::start(config(1), MockRunner::new()).await;

    h.event_queue.enqueue(event("e-1", "books"));
    h.pop("w0-1").await;
    h.handle.invalidate("books").unwrap();
    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.outdated, 1);
    assert!(h.runner.terminated().await.is_empty());

    assert!(h.complete("e-1", true).await);
    assert_eq!(h.outcome().await.1, Outcome::Succeeded);

    h.event_queue.enqueue(event("e-2", "books"));
    assert_eq!(h.pop("w0-2").await.id, "e-2");
    assert_eq!(h.runner.terminated().await, vec!["w0-1".to_string()]);
}

#[tokio::test]
async fn test_invalidate_other_target_is_noop() {
    let mut h = Harness::start(config(1), MockRunner::new()).await;

    h.event_queue.enqueue(event("e-1", "books"));
    h.pop("w0-1").await;
    assert!(h.complete("e-1", true).await);
    h.outcome().await;

    h.handle.invalidate("authors").unwrap();
    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.fresh, 1);
    assert!(h.runner.terminated().await.is_empty());
}

#[tokio::test]
async fn test_batch_keeps_target_on_warm_worker() {
    let mut h = Harness::start(config(2), MockRunner::new()).await;

    h.event_queue.enqueue(with_batch(event("e-1", "books"), 3, 30));
    assert_eq!(h.pop("w0-1").await.id, "e-1");

    // Joins the open batch instead of taking the idle worker.
    h.event_queue.enqueue(with_batch(event("e-2", "books"), 3, 30));
    h.wait_for_stats(|s| s.batched == 1).await;

    // Other targets still use the idle worker.
    h.event_queue.enqueue(event("e-3", "authors"));
    assert_eq!(h.pop("w1-1").await.id, "e-3");

    assert!(h.complete("e-1", true).await);
    assert_eq!(h.outcome().await.0, "e-1");
    assert_eq!(h.pop("w0-1").await.id, "e-2");
}

#[tokio::test]
async fn test_shutdown_cancels_and_stops_workers() {
    let mut h = Harness::start(config(2), MockRunner::new()).await;

    h.event_queue.enqueue(event("e-1", "books"));
    h.pop("w0-1").await;
    let parked = {
        let event_queue = h.event_queue.clone();
        tokio::spawn(async move { event_queue.pop("w1-1").await })
    };
    h.wait_for_stats(|s| s.busy == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.handle.shutdown().await.unwrap();
    assert_eq!(h.outcome().await, ("e-1".to_string(), Outcome::Cancelled));
    assert!(matches!(
        parked.await.unwrap(),
        Err(CoreError::NoNextEvent { .. })
    ));
    assert!(h.runner.live_workers().is_empty());

    h.task.await.unwrap();
    assert!(matches!(h.handle.stats().await, Err(SchedulerError::Stopped)));
}
