// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The worker pool and its decision loop.
//!
//! A single task owns every [`WorkerSlot`]. Everything that can change a
//! slot arrives as a message on one of its channels:
//!
//! - [`QueueNotice`]s from the event queue (enqueue, dequeue, pop, complete)
//! - [`WorkerExit`]s from the runner
//! - control messages from [`SchedulerHandle`]
//! - its own timer, set to the nearest deadline, kill or respawn
//!
//! The first terminal outcome of an event wins. A completion that arrives
//! after a timeout or crash is answered with `accepted = false` and the
//! enqueuer hook is not called again.

pub mod batch;
pub mod worker;

pub use batch::Batch;
pub use worker::{InFlight, WorkerSlot, WorkerState};

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fnhost_core::{EventQueue, QueueNotice, ReplicationMap};
use fnhost_protocol::messages::Event;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::enqueuer::{EnqueuerRegistry, Outcome};
use crate::error::{Result, SchedulerError};
use crate::runner::{Runner, WorkerExit, WorkerHandle, WorkerSpec};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker slots.
    pub max_concurrency: usize,
    /// Timeout for targets without `timeout_ms`.
    pub default_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Delay before retrying a failed respawn.
    pub respawn_backoff: Duration,
    pub invocation_logs: bool,
    pub replica_id: String,
    /// Event queue address handed to workers.
    pub server_addr: SocketAddr,
    pub entrypoint: String,
    pub runtime: String,
    pub skip_cert_verification: bool,
    /// Extra environment for every worker.
    pub worker_env: HashMap<String, String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(3),
            respawn_backoff: Duration::from_secs(1),
            invocation_logs: false,
            replica_id: "local".to_string(),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            entrypoint: "index".to_string(),
            runtime: "native".to_string(),
            skip_cert_verification: true,
            worker_env: HashMap::new(),
        }
    }
}

/// Last worker that ran a target, shared across replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmWorker {
    pub replica: String,
    pub worker_id: String,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub fresh: usize,
    pub targeted: usize,
    pub busy: usize,
    pub timeouted: usize,
    pub outdated: usize,
    /// Slots waiting for a process.
    pub starting: usize,
    /// Events no worker has been assigned yet.
    pub backlog: usize,
    /// Events waiting in a batch inbox.
    pub batched: usize,
    pub in_flight: usize,
}

enum Control {
    Invalidate { target_id: String },
    Stats(oneshot::Sender<SchedulerStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl SchedulerHandle {
    /// Retire every worker that ran `target_id`, for example after a redeploy.
    pub fn invalidate(&self, target_id: impl Into<String>) -> Result<()> {
        self.control
            .send(Control::Invalidate {
                target_id: target_id.into(),
            })
            .map_err(|_| SchedulerError::Stopped)
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (reply, stats) = oneshot::channel();
        self.control
            .send(Control::Stats(reply))
            .map_err(|_| SchedulerError::Stopped)?;
        stats.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Cancel queued events, stop every worker and end the loop.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.control
            .send(Control::Shutdown(reply))
            .map_err(|_| SchedulerError::Stopped)?;
        done.await.map_err(|_| SchedulerError::Stopped)
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    event_queue: Arc<EventQueue>,
    notices: mpsc::UnboundedReceiver<QueueNotice>,
    runner: Arc<dyn Runner>,
    registry: Arc<EnqueuerRegistry>,
    warm_workers: Option<Arc<ReplicationMap<WarmWorker>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        event_queue: Arc<EventQueue>,
        notices: mpsc::UnboundedReceiver<QueueNotice>,
        runner: Arc<dyn Runner>,
        registry: Arc<EnqueuerRegistry>,
    ) -> Self {
        Self {
            config,
            event_queue,
            notices,
            runner,
            registry,
            warm_workers: None,
        }
    }

    /// Record which worker last ran each target.
    pub fn with_warm_workers(mut self, map: Arc<ReplicationMap<WarmWorker>>) -> Self {
        self.warm_workers = Some(map);
        self
    }

    /// Spawn the whole pool and start the decision loop.
    ///
    /// A pool that cannot be filled at startup is an error, later spawn
    /// failures are retried.
    pub async fn start(self) -> Result<(SchedulerHandle, JoinHandle<()>)> {
        let Scheduler {
            config,
            event_queue,
            notices,
            runner,
            registry,
            warm_workers,
        } = self;

        let (exits_tx, exits) = mpsc::unbounded_channel();
        let (control_tx, control) = mpsc::unbounded_channel();

        let mut pool = Pool {
            slots: (0..config.max_concurrency).map(WorkerSlot::new).collect(),
            by_worker: HashMap::new(),
            active: HashMap::new(),
            backlog: VecDeque::new(),
            exits: exits_tx,
            shutting_down: false,
            config,
            event_queue,
            runner,
            registry,
            warm_workers,
        };

        for index in 0..pool.slots.len() {
            if let Err(e) = pool.spawn(index).await {
                pool.kill_all().await;
                return Err(e);
            }
        }

        info!(
            workers = pool.slots.len(),
            runner = pool.runner.runner_type(),
            "Worker pool started"
        );
        let task = tokio::spawn(pool.run(notices, exits, control));
        Ok((
            SchedulerHandle {
                control: control_tx,
            },
            task,
        ))
    }
}

/// State owned by the decision loop.
struct Pool {
    config: SchedulerConfig,
    event_queue: Arc<EventQueue>,
    runner: Arc<dyn Runner>,
    registry: Arc<EnqueuerRegistry>,
    warm_workers: Option<Arc<ReplicationMap<WarmWorker>>>,
    slots: Vec<WorkerSlot>,
    /// Live worker id -> slot index.
    by_worker: HashMap<String, usize>,
    /// Assigned event id -> slot index.
    active: HashMap<String, usize>,
    backlog: VecDeque<Event>,
    exits: mpsc::UnboundedSender<WorkerExit>,
    shutting_down: bool,
}

impl Pool {
    async fn run(
        mut self,
        mut notices: mpsc::UnboundedReceiver<QueueNotice>,
        mut exits: mpsc::UnboundedReceiver<WorkerExit>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                notice = notices.recv() => match notice {
                    Some(notice) => self.on_notice(notice).await,
                    None => {
                        warn!("Event queue is gone, stopping scheduler");
                        self.shutdown(&mut exits).await;
                        break;
                    }
                },
                Some(exit) = exits.recv() => self.on_exit(exit).await,
                command = control.recv() => match command {
                    Some(Control::Invalidate { target_id }) => self.invalidate(&target_id).await,
                    Some(Control::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Control::Shutdown(reply)) => {
                        self.shutdown(&mut exits).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown(&mut exits).await;
                        break;
                    }
                },
                _ = sleep_until(wakeup) => self.on_tick().await,
            }
        }
        info!("Scheduler stopped");
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.slots.iter().filter_map(WorkerSlot::next_wakeup).min()
    }

    async fn on_notice(&mut self, notice: QueueNotice) {
        match notice {
            QueueNotice::Enqueued(event) => self.on_enqueued(event),
            QueueNotice::Dequeued { id } => self.on_dequeued(&id).await,
            QueueNotice::Popped {
                worker_id,
                event_id,
            } => self.on_popped(&worker_id, &event_id),
            QueueNotice::Completed {
                event_id,
                succeeded,
                reply,
            } => self.on_completed(&event_id, succeeded, reply).await,
        }
    }

    // ========================================================================
    // Routing
    // ========================================================================

    fn on_enqueued(&mut self, event: Event) {
        if self.shutting_down {
            self.cancel(event);
            return;
        }

        let now = Instant::now();
        if let Some(index) = self.batch_slot(&event, now) {
            debug!(
                event_id = %event.id,
                worker_id = %self.slots[index].worker_id(),
                "Event joined open batch"
            );
            if self.slots[index].is_assignable() {
                self.assign(index, event, now);
            } else {
                self.slots[index].inbox.push_back(event);
            }
            return;
        }

        match self.free_slot() {
            Some(index) => self.assign(index, event, now),
            None => {
                debug!(event_id = %event.id, backlog = self.backlog.len() + 1, "No free worker, event queued");
                self.backlog.push_back(event);
            }
        }
    }

    /// Slot whose open batch admits `event`.
    fn batch_slot(&mut self, event: &Event, now: Instant) -> Option<usize> {
        let handler = event
            .target
            .as_ref()
            .map(|t| t.handler.as_str())
            .unwrap_or_default();
        self.slots.iter_mut().position(|slot| {
            let usable = slot.is_assignable()
                || matches!(slot.state(), WorkerState::Targeted | WorkerState::Busy);
            usable
                && slot
                    .batch
                    .as_mut()
                    .is_some_and(|b| b.target == event.target_id() && b.try_admit(handler, now))
        })
    }

    /// Prefers slots not holding a batch window open for another target.
    fn free_slot(&self) -> Option<usize> {
        let now = Instant::now();
        let assignable = || self.slots.iter().enumerate().filter(|(_, s)| s.is_assignable());
        assignable()
            .find(|(_, s)| s.batch.as_ref().is_none_or(|b| b.is_expired(now)))
            .or_else(|| assignable().next())
            .map(|(index, _)| index)
    }

    fn assign(&mut self, index: usize, event: Event, now: Instant) {
        let deadline = now + self.timeout_for(&event);
        let slot = &mut self.slots[index];
        let worker_id = slot.worker_id();

        let reopen = slot
            .batch
            .as_ref()
            .is_none_or(|b| b.target != event.target_id() || b.is_expired(now));
        if reopen {
            slot.batch = event.target.as_ref().and_then(|target| {
                let settings = target.context.as_ref()?.batch.as_ref()?;
                Batch::open(&target.id, &worker_id, &target.handler, settings, now)
            });
        }

        if let Err(e) = slot.assign(event.clone(), now, deadline) {
            error!(event_id = %event.id, error = %e, "Assignment refused, event requeued");
            self.backlog.push_front(event);
            return;
        }

        debug!(event_id = %event.id, worker_id = %worker_id, "Event assigned");
        self.active.insert(event.id.clone(), index);
        self.remember_warm(&event, &worker_id);
        self.event_queue.assign(&worker_id, event);
    }

    fn timeout_for(&self, event: &Event) -> Duration {
        event
            .target
            .as_ref()
            .and_then(|t| t.context.as_ref())
            .map(|c| c.timeout_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout)
    }

    fn remember_warm(&self, event: &Event, worker_id: &str) {
        let Some(map) = self.warm_workers.clone() else {
            return;
        };
        let target_id = event.target_id().to_string();
        let entry = WarmWorker {
            replica: self.config.replica_id.clone(),
            worker_id: worker_id.to_string(),
        };
        tokio::spawn(async move {
            if let Err(e) = map.set(target_id, entry).await {
                warn!(error = %e, "Failed to record warm worker");
            }
        });
    }

    /// Hand backlog events to every idle slot.
    fn dispatch_backlog(&mut self) {
        let now = Instant::now();
        while !self.backlog.is_empty() {
            let Some(index) = self.free_slot() else {
                break;
            };
            if let Some(event) = self.backlog.pop_front() {
                self.assign(index, event, now);
            }
        }
    }

    /// Move a slot's batch inbox back to the front of the backlog.
    fn requeue_inbox(&mut self, index: usize) {
        let inbox: Vec<Event> = self.slots[index].inbox.drain(..).collect();
        for event in inbox.into_iter().rev() {
            self.backlog.push_front(event);
        }
    }

    /// Decide what a slot does after its event ended.
    async fn next_for(&mut self, index: usize) {
        let now = Instant::now();
        match self.slots[index].state() {
            WorkerState::Outdated => {
                self.requeue_inbox(index);
                self.retire(index).await;
                self.dispatch_backlog();
            }
            WorkerState::Fresh => {
                let slot = &mut self.slots[index];
                if let Some(event) = slot.inbox.pop_front() {
                    self.assign(index, event, now);
                    return;
                }
                if slot.batch.as_ref().is_some_and(|b| b.is_expired(now)) {
                    slot.batch = None;
                }
                self.dispatch_backlog();
            }
            _ => {}
        }
    }

    // ========================================================================
    // Queue notices
    // ========================================================================

    async fn on_dequeued(&mut self, id: &str) {
        if let Some(pos) = self.backlog.iter().position(|e| e.id == id) {
            if let Some(event) = self.backlog.remove(pos) {
                self.cancel(event);
            }
            return;
        }

        let batched = self.slots.iter_mut().find_map(|slot| {
            let pos = slot.inbox.iter().position(|e| e.id == id)?;
            slot.inbox.remove(pos)
        });
        if let Some(event) = batched {
            self.cancel(event);
            return;
        }

        let Some(&index) = self.active.get(id) else {
            debug!(event_id = %id, "Dequeue of unknown event ignored");
            return;
        };
        let slot = &mut self.slots[index];
        let worker_id = slot.worker_id();
        if slot.in_flight().is_none_or(|f| f.popped_at.is_some()) {
            debug!(event_id = %id, worker_id = %worker_id, "Event already running, dequeue ignored");
            return;
        }
        if self.event_queue.revoke(&worker_id, id).is_none() {
            debug!(event_id = %id, worker_id = %worker_id, "Event popped meanwhile, dequeue ignored");
            return;
        }

        self.active.remove(id);
        if let Some(in_flight) = slot.take_in_flight() {
            if slot.state() == WorkerState::Targeted {
                if let Err(e) = slot.transition(WorkerState::Fresh) {
                    warn!(error = %e, "Unexpected slot state on dequeue");
                }
            }
            self.cancel(in_flight.event);
        }
        self.next_for(index).await;
    }

    fn on_popped(&mut self, worker_id: &str, event_id: &str) {
        let Some(&index) = self.by_worker.get(worker_id) else {
            warn!(worker_id = %worker_id, event_id = %event_id, "Pop from unknown worker");
            return;
        };
        let slot = &mut self.slots[index];
        if slot.in_flight().is_none_or(|f| f.event.id != event_id) {
            warn!(worker_id = %worker_id, event_id = %event_id, "Worker popped an event it does not hold");
            return;
        }
        if let Err(e) = slot.mark_popped(Instant::now()) {
            warn!(error = %e, "Unexpected slot state on pop");
        }
        if self.config.invocation_logs {
            if let Some(target) = slot.in_flight().and_then(|f| f.event.target.as_ref()) {
                info!(
                    event_id = %event_id,
                    worker_id = %worker_id,
                    target = %target.id,
                    handler = %target.handler,
                    "Invocation started"
                );
            }
        }
    }

    async fn on_completed(&mut self, event_id: &str, succeeded: bool, reply: oneshot::Sender<bool>) {
        let Some(index) = self.active.remove(event_id) else {
            warn!(event_id = %event_id, succeeded, "Completion for an event that is no longer running, rejected");
            let _ = reply.send(false);
            return;
        };
        let _ = reply.send(true);

        let slot = &mut self.slots[index];
        let worker_id = slot.worker_id();
        let Some(in_flight) = slot.take_in_flight() else {
            warn!(event_id = %event_id, worker_id = %worker_id, "Active event missing from its slot");
            return;
        };
        if slot.state() != WorkerState::Outdated {
            if let Err(e) = slot.transition(WorkerState::Fresh) {
                warn!(error = %e, "Unexpected slot state on completion");
            }
        }

        self.settle(&in_flight, &worker_id, Outcome::reported(succeeded));
        self.next_for(index).await;
    }

    // ========================================================================
    // Timers and process lifecycle
    // ========================================================================

    async fn on_tick(&mut self) {
        let now = Instant::now();
        for index in 0..self.slots.len() {
            if self.slots[index]
                .in_flight()
                .is_some_and(|f| f.deadline <= now)
            {
                self.time_out(index).await;
            }

            let slot = &mut self.slots[index];
            if slot.kill_at.is_some_and(|at| at <= now) {
                slot.kill_at = None;
                if let Some(handle) = slot.handle() {
                    warn!(worker_id = %handle.worker_id, "Worker ignored SIGTERM, killing");
                    if let Err(e) = self.runner.kill(handle).await {
                        error!(worker_id = %handle.worker_id, error = %e, "Failed to kill worker");
                    }
                }
            }

            if self.slots[index].respawn_at.is_some_and(|at| at <= now) {
                self.slots[index].respawn_at = None;
                self.respawn(index).await;
            }
        }
    }

    async fn time_out(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let Some(in_flight) = slot.take_in_flight() else {
            return;
        };
        let worker_id = slot.worker_id();
        if let Err(e) = slot.transition(WorkerState::Timeouted) {
            warn!(error = %e, "Unexpected slot state on timeout");
        }
        slot.batch = None;
        self.active.remove(&in_flight.event.id);

        warn!(
            event_id = %in_flight.event.id,
            worker_id = %worker_id,
            target = %in_flight.event.target_id(),
            "Invocation timed out"
        );
        self.event_queue.revoke(&worker_id, &in_flight.event.id);
        self.settle(&in_flight, &worker_id, Outcome::TimedOut);

        self.requeue_inbox(index);
        self.retire(index).await;
        self.dispatch_backlog();
    }

    /// Ask the slot's process to stop and schedule the SIGKILL fallback.
    async fn retire(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let Some(handle) = slot.handle().cloned() else {
            return;
        };
        self.event_queue.reject(&handle.worker_id);
        debug!(worker_id = %handle.worker_id, state = ?slot.state(), "Retiring worker");
        if let Err(e) = self.runner.terminate(&handle).await {
            warn!(worker_id = %handle.worker_id, error = %e, "Failed to terminate worker");
        }
        slot.kill_at = Some(Instant::now() + self.config.kill_grace);
    }

    async fn on_exit(&mut self, exit: WorkerExit) {
        let Some(index) = self.by_worker.remove(&exit.worker_id) else {
            debug!(worker_id = %exit.worker_id, "Exit of a worker no longer tracked");
            return;
        };

        let slot = &mut self.slots[index];
        match slot.take_in_flight() {
            Some(in_flight) => {
                self.active.remove(&in_flight.event.id);
                warn!(
                    worker_id = %exit.worker_id,
                    event_id = %in_flight.event.id,
                    code = ?exit.code,
                    "Worker died while running an event"
                );
                self.event_queue.revoke(&exit.worker_id, &in_flight.event.id);
                self.settle(&in_flight, &exit.worker_id, Outcome::Crashed);
            }
            None if matches!(slot.state(), WorkerState::Fresh) => {
                warn!(worker_id = %exit.worker_id, code = ?exit.code, "Idle worker exited");
            }
            None => debug!(worker_id = %exit.worker_id, code = ?exit.code, "Worker exited"),
        }

        let slot = &mut self.slots[index];
        self.event_queue.reject(&exit.worker_id);
        slot.batch = None;
        slot.detach();
        self.requeue_inbox(index);

        if self.shutting_down {
            return;
        }
        self.respawn(index).await;
        self.dispatch_backlog();
    }

    async fn spawn(&mut self, index: usize) -> Result<()> {
        let worker_id = self.slots[index].next_worker_id();
        let spec = WorkerSpec {
            worker_id: worker_id.clone(),
            server_addr: self.config.server_addr,
            entrypoint: self.config.entrypoint.clone(),
            runtime: self.config.runtime.clone(),
            skip_cert_verification: self.config.skip_cert_verification,
            env: self.config.worker_env.clone(),
        };

        let handle = self
            .runner
            .spawn(&spec, self.exits.clone())
            .await
            .map_err(|source| SchedulerError::Spawn {
                worker_id: worker_id.clone(),
                source,
            })?;
        self.by_worker.insert(worker_id, index);
        self.slots[index].attach(handle);
        Ok(())
    }

    async fn respawn(&mut self, index: usize) {
        if let Err(e) = self.spawn(index).await {
            error!(slot = index, error = %e, "Failed to respawn worker, retrying");
            self.slots[index].respawn_at = Some(Instant::now() + self.config.respawn_backoff);
            return;
        }
        self.dispatch_backlog();
    }

    // ========================================================================
    // Control
    // ========================================================================

    async fn invalidate(&mut self, target_id: &str) {
        let mut idle = Vec::new();
        let mut outdated = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.batch.as_ref().is_some_and(|b| b.target == target_id) {
                slot.batch = None;
            }
            let running = slot
                .in_flight()
                .is_some_and(|f| f.event.target_id() == target_id);
            let warm = slot.is_assignable() && slot.last_target() == Some(target_id);
            if (running || warm) && slot.transition(WorkerState::Outdated).is_ok() {
                outdated += 1;
                if warm {
                    idle.push(index);
                }
            }
        }

        for index in 0..self.slots.len() {
            if self.slots[index].state() == WorkerState::Outdated {
                self.requeue_inbox(index);
            }
        }
        for index in idle {
            self.retire(index).await;
        }
        self.dispatch_backlog();

        if let Some(map) = self.warm_workers.clone() {
            let target_id = target_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = map.delete(&target_id).await {
                    warn!(error = %e, "Failed to forget warm worker");
                }
            });
        }
        info!(target = %target_id, outdated, "Target invalidated");
    }

    fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            backlog: self.backlog.len(),
            in_flight: self.active.len(),
            ..Default::default()
        };
        for slot in &self.slots {
            stats.batched += slot.inbox.len();
            if slot.handle().is_none() {
                stats.starting += 1;
                continue;
            }
            match slot.state() {
                WorkerState::Fresh => stats.fresh += 1,
                WorkerState::Targeted => stats.targeted += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Timeouted => stats.timeouted += 1,
                WorkerState::Outdated => stats.outdated += 1,
            }
        }
        stats
    }

    async fn shutdown(&mut self, exits: &mut mpsc::UnboundedReceiver<WorkerExit>) {
        self.shutting_down = true;
        info!(
            backlog = self.backlog.len(),
            in_flight = self.active.len(),
            "Scheduler shutting down"
        );

        let mut cancelled: Vec<Event> = self.backlog.drain(..).collect();
        for slot in &mut self.slots {
            cancelled.extend(slot.inbox.drain(..));
            slot.batch = None;
            slot.respawn_at = None;
            if let Some(in_flight) = slot.take_in_flight() {
                self.event_queue.revoke(&slot.worker_id(), &in_flight.event.id);
                cancelled.push(in_flight.event);
            }
        }
        self.active.clear();
        for event in cancelled {
            self.cancel(event);
        }

        let handles: Vec<WorkerHandle> = self
            .slots
            .iter()
            .filter_map(|s| s.handle().cloned())
            .collect();
        for handle in &handles {
            self.event_queue.reject(&handle.worker_id);
            if let Err(e) = self.runner.terminate(handle).await {
                warn!(worker_id = %handle.worker_id, error = %e, "Failed to terminate worker");
            }
        }
        self.await_exits(exits).await;
        if self.by_worker.is_empty() {
            return;
        }

        warn!(remaining = self.by_worker.len(), "Workers still running after grace period, killing");
        self.kill_all().await;
        self.await_exits(exits).await;
        if !self.by_worker.is_empty() {
            error!(remaining = self.by_worker.len(), "Workers did not exit after SIGKILL");
        }
    }

    async fn kill_all(&mut self) {
        for slot in &self.slots {
            if let Some(handle) = slot.handle() {
                if let Err(e) = self.runner.kill(handle).await {
                    error!(worker_id = %handle.worker_id, error = %e, "Failed to kill worker");
                }
            }
        }
    }

    /// Collect exits until every worker is gone or the grace period passes.
    async fn await_exits(&mut self, exits: &mut mpsc::UnboundedReceiver<WorkerExit>) {
        let deadline = Instant::now() + self.config.kill_grace;
        while !self.by_worker.is_empty() {
            match tokio::time::timeout_at(deadline, exits.recv()).await {
                Ok(Some(exit)) => {
                    if let Some(index) = self.by_worker.remove(&exit.worker_id) {
                        self.slots[index].detach();
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    /// Drop an event that never ran.
    fn cancel(&self, event: Event) {
        debug!(event_id = %event.id, "Event cancelled");
        self.event_queue.discard_payloads(&event.id);
        self.registry.on_event_completed(&event, Outcome::Cancelled);
    }

    fn settle(&self, in_flight: &InFlight, worker_id: &str, outcome: Outcome) {
        if self.config.invocation_logs {
            let event = &in_flight.event;
            let (target, handler) = event
                .target
                .as_ref()
                .map(|t| (t.id.as_str(), t.handler.as_str()))
                .unwrap_or_default();
            info!(
                event_id = %event.id,
                worker_id = %worker_id,
                target = %target,
                handler = %handler,
                outcome = ?outcome,
                duration_ms = in_flight.assigned_at.elapsed().as_millis() as u64,
                "Invocation finished"
            );
        }
        self.registry.on_event_completed(&in_flight.event, outcome);
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
