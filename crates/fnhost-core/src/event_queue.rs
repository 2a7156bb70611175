// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The RPC endpoint workers connect to.
//!
//! `EventQueue` owns the listener and serves its own `pop`/`complete` methods
//! next to every registered domain queue. It makes no scheduling decisions:
//! enqueues, pops and completions are forwarded as [`QueueNotice`]s to the
//! scheduler, which answers by calling [`EventQueue::assign`] or
//! [`EventQueue::reject`] and by replying to completions.
//!
//! # Pop slots
//!
//! Each worker has at most one slot. A slot either holds an event assigned
//! before the worker asked (`Ready`) or a parked `pop` waiting for an
//! assignment (`Parked`). Whichever side arrives second completes the hand-off.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fnhost_protocol::messages::{Complete, CompleteResult, Event, WorkerPopRequest};
use fnhost_protocol::rpc::{methods, services};
use fnhost_protocol::{RpcServer, RpcServerConfig};
use prost::Message;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::service::{QueueService, ServiceTable, decode, unknown_method};

const DRAIN_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
const REBIND_ATTEMPTS: u32 = 10;
const REBIND_BACKOFF: Duration = Duration::from_millis(100);

/// What the event queue tells the scheduler.
#[derive(Debug)]
pub enum QueueNotice {
    Enqueued(Event),
    Dequeued {
        id: String,
    },
    /// A worker received its assigned event.
    Popped {
        worker_id: String,
        event_id: String,
    },
    /// A worker reported completion. `reply` carries whether it was accepted.
    Completed {
        event_id: String,
        succeeded: bool,
        reply: oneshot::Sender<bool>,
    },
}

enum PopSlot {
    Ready(Event),
    Parked(oneshot::Sender<Result<Event>>),
}

struct Listener {
    server: Arc<RpcServer>,
    task: JoinHandle<()>,
    addr: SocketAddr,
    table: Arc<ServiceTable>,
}

pub struct EventQueue {
    notices: mpsc::UnboundedSender<QueueNotice>,
    slots: DashMap<String, PopSlot>,
    queues: DashMap<&'static str, Arc<dyn QueueService>>,
    frozen: AtomicBool,
    server_config: RpcServerConfig,
    listener: Mutex<Option<Listener>>,
}

impl EventQueue {
    pub fn new(server_config: RpcServerConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<QueueNotice>) {
        let (notices, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            notices,
            slots: DashMap::new(),
            queues: DashMap::new(),
            frozen: AtomicBool::new(false),
            server_config,
            listener: Mutex::new(None),
        });
        (queue, receiver)
    }

    /// Register a domain queue on the shared endpoint. Only possible before
    /// the first [`listen`](Self::listen).
    pub fn add_queue(&self, queue: Arc<dyn QueueService>) -> Result<()> {
        let name = queue.service_name();
        if self.frozen.load(Ordering::Acquire) {
            return Err(CoreError::ServiceTableFrozen {
                service: name.to_string(),
            });
        }
        if name == services::EVENT_QUEUE {
            return Err(CoreError::DuplicateService {
                service: name.to_string(),
            });
        }
        match self.queues.entry(name) {
            Entry::Occupied(_) => Err(CoreError::DuplicateService {
                service: name.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(queue);
                debug!(service = name, "queue registered");
                Ok(())
            }
        }
    }

    /// Hand `event` to scheduling. Never blocks. Returns the event id,
    /// generated when the event had none.
    pub fn enqueue(&self, mut event: Event) -> String {
        if event.id.is_empty() {
            event.id = uuid::Uuid::new_v4().to_string();
        }
        let id = event.id.clone();
        self.notify(QueueNotice::Enqueued(event));
        id
    }

    /// Cancel an event that no worker has popped yet. No effect afterwards.
    pub fn dequeue(&self, id: &str) {
        self.notify(QueueNotice::Dequeued { id: id.to_string() });
    }

    /// Give `event` to `worker_id`, waking its parked `pop` if there is one.
    pub fn assign(&self, worker_id: &str, event: Event) {
        let event = match self.slots.entry(worker_id.to_string()) {
            Entry::Occupied(slot) => match slot.remove() {
                PopSlot::Parked(waiter) => match waiter.send(Ok(event)) {
                    Ok(()) => return,
                    // The pop was abandoned, keep the event for the next one.
                    Err(Ok(event)) => event,
                    Err(Err(_)) => return,
                },
                PopSlot::Ready(previous) => {
                    warn!(
                        worker_id = %worker_id,
                        replaced = %previous.id,
                        "worker already had an unpopped event"
                    );
                    event
                }
            },
            Entry::Vacant(_) => event,
        };
        self.slots
            .insert(worker_id.to_string(), PopSlot::Ready(event));
    }

    /// Tell `worker_id` it gets nothing. Returns an assigned but unpopped event.
    pub fn reject(&self, worker_id: &str) -> Option<Event> {
        match self.slots.remove(worker_id)? {
            (_, PopSlot::Parked(waiter)) => {
                let _ = waiter.send(Err(CoreError::NoNextEvent {
                    worker_id: worker_id.to_string(),
                }));
                None
            }
            (_, PopSlot::Ready(event)) => Some(event),
        }
    }

    /// Take back `event_id` from `worker_id` if it has not been popped yet.
    pub fn revoke(&self, worker_id: &str, event_id: &str) -> Option<Event> {
        self.slots
            .remove_if(worker_id, |_, slot| {
                matches!(slot, PopSlot::Ready(event) if event.id == event_id)
            })
            .and_then(|(_, slot)| match slot {
                PopSlot::Ready(event) => Some(event),
                PopSlot::Parked(_) => None,
            })
    }

    /// Drop every domain queue's payload for `id`.
    pub fn discard_payloads(&self, id: &str) {
        for queue in self.queues.iter() {
            queue.value().discard(id);
        }
    }

    /// Wait for the event assigned to `worker_id`.
    #[instrument(skip(self))]
    pub async fn pop(&self, worker_id: &str) -> Result<Event> {
        let (waiter, assignment) = oneshot::channel();
        let ready = match self.slots.entry(worker_id.to_string()) {
            Entry::Occupied(mut slot) => match slot.insert(PopSlot::Parked(waiter)) {
                PopSlot::Ready(event) => {
                    slot.remove();
                    Some(event)
                }
                PopSlot::Parked(_) => {
                    debug!("replacing an abandoned pop");
                    None
                }
            },
            Entry::Vacant(slot) => {
                slot.insert(PopSlot::Parked(waiter));
                None
            }
        };

        let event = match ready {
            Some(event) => event,
            None => assignment.await.map_err(|_| CoreError::NoNextEvent {
                worker_id: worker_id.to_string(),
            })??,
        };

        self.notify(QueueNotice::Popped {
            worker_id: worker_id.to_string(),
            event_id: event.id.clone(),
        });
        Ok(event)
    }

    /// Report a finished event and wait for the scheduler's verdict.
    #[instrument(skip_all, fields(id = %complete.id, succeeded = complete.succeeded))]
    pub async fn complete(&self, complete: Complete) -> Result<CompleteResult> {
        let (reply, verdict) = oneshot::channel();
        self.notices
            .send(QueueNotice::Completed {
                event_id: complete.id,
                succeeded: complete.succeeded,
                reply,
            })
            .map_err(|_| scheduler_gone())?;
        let accepted = verdict.await.map_err(|_| scheduler_gone())?;
        Ok(CompleteResult { accepted })
    }

    /// Freeze the service table and start serving on `addr`.
    ///
    /// Returns the bound address. Calling it again while listening returns
    /// the current address.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let mut listener = self.listener.lock().await;
        if let Some(current) = listener.as_ref() {
            return Ok(current.addr);
        }

        self.frozen.store(true, Ordering::Release);
        let mut services = vec![self.clone() as Arc<dyn QueueService>];
        services.extend(self.queues.iter().map(|entry| entry.value().clone()));
        let table = Arc::new(ServiceTable::new(services)?);

        let started = self.bind(addr, table)?;
        let addr = started.addr;
        *listener = Some(started);
        Ok(addr)
    }

    /// Cut off every worker and restart the listener on the same address.
    ///
    /// Parked pops fail with "no next event" and all connections are closed,
    /// so stuck workers lose their streams without the host restarting.
    pub async fn drain(&self) -> Result<SocketAddr> {
        let rejected = self.reject_parked();
        let mut listener = self.listener.lock().await;
        let Listener {
            server,
            task,
            addr,
            table,
        } = listener.take().ok_or_else(|| CoreError::Unavailable {
            reason: "event queue is not listening".to_string(),
        })?;

        server.close();
        if tokio::time::timeout(DRAIN_IDLE_TIMEOUT, server.wait_idle())
            .await
            .is_err()
        {
            warn!(addr = %addr, "connections still open after drain timeout");
        }
        task.abort();
        let _ = task.await;
        drop(server);

        let mut attempt = 0;
        loop {
            match self.bind(addr, table.clone()) {
                Ok(next) => {
                    info!(addr = %addr, rejected, "event queue drained");
                    *listener = Some(next);
                    return Ok(addr);
                }
                Err(e) if attempt < REBIND_ATTEMPTS => {
                    attempt += 1;
                    warn!(addr = %addr, attempt, error = %e, "rebind after drain failed, retrying");
                    tokio::time::sleep(REBIND_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop serving for good.
    pub async fn close(&self) {
        self.reject_parked();
        if let Some(listener) = self.listener.lock().await.take() {
            listener.server.close();
            listener.task.abort();
            info!(addr = %listener.addr, "event queue closed");
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.addr)
    }

    /// Number of workers with a parked pop.
    pub fn parked(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), PopSlot::Parked(_)))
            .count()
    }

    fn bind(&self, addr: SocketAddr, table: Arc<ServiceTable>) -> Result<Listener> {
        let server = Arc::new(
            RpcServer::localhost_with_config(addr, self.server_config.clone()).map_err(|e| {
                CoreError::Transport {
                    details: e.to_string(),
                }
            })?,
        );
        let addr = server.local_addr().map_err(|e| CoreError::Transport {
            details: e.to_string(),
        })?;

        let task = {
            let server = server.clone();
            let table = table.clone();
            tokio::spawn(async move {
                let result = server
                    .run(move |request| {
                        let table = table.clone();
                        async move { table.dispatch(request).await }
                    })
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "event queue listener failed");
                }
            })
        };

        info!(addr = %addr, services = ?table.names(), "event queue listening");
        Ok(Listener {
            server,
            task,
            addr,
            table,
        })
    }

    fn reject_parked(&self) -> usize {
        let parked: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), PopSlot::Parked(_)))
            .map(|slot| slot.key().clone())
            .collect();

        let mut rejected = 0;
        for worker_id in parked {
            if let Some((_, PopSlot::Parked(waiter))) = self
                .slots
                .remove_if(&worker_id, |_, slot| matches!(slot, PopSlot::Parked(_)))
            {
                let _ = waiter.send(Err(CoreError::NoNextEvent { worker_id }));
                rejected += 1;
            }
        }
        rejected
    }

    fn notify(&self, notice: QueueNotice) {
        if self.notices.send(notice).is_err() {
            warn!("scheduler is gone, dropping queue notice");
        }
    }
}

fn scheduler_gone() -> CoreError {
    CoreError::Unavailable {
        reason: "scheduler stopped".to_string(),
    }
}

#[async_trait]
impl QueueService for EventQueue {
    fn service_name(&self) -> &'static str {
        services::EVENT_QUEUE
    }

    async fn handle(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
        match method {
            methods::POP => {
                let request: WorkerPopRequest = decode(payload)?;
                Ok(self.pop(&request.id).await?.encode_to_vec())
            }
            methods::COMPLETE => Ok(self.complete(decode(payload)?).await?.encode_to_vec()),
            _ => Err(unknown_method(self.service_name(), method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DatabaseQueue;
    use fnhost_protocol::messages::{EventType, Target};

    fn event(id: &str) -> Event {
        Event {
            id: id.into(),
            r#type: EventType::Database as i32,
            target: Some(Target {
                id: "fn-1".into(),
                handler: "default".into(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_enqueue_assigns_id_and_notifies() {
        let (queue, mut notices) = EventQueue::new(RpcServerConfig::default());

        let id = queue.enqueue(Event::new(EventType::Http, Target::default()));
        assert!(!id.is_empty());

        match notices.recv().await.unwrap() {
            QueueNotice::Enqueued(event) => assert_eq!(event.id, id),
            other => panic!("unexpected notice {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_assign_before_pop() {
        let (queue, mut notices) = EventQueue::new(RpcServerConfig::default());

        queue.assign("w-1", event("e-1"));
        let popped = queue.pop("w-1").await.unwrap();

        assert_eq!(popped.id, "e-1");
        assert!(matches!(
            notices.recv().await.unwrap(),
            QueueNotice::Popped { worker_id, event_id } if worker_id == "w-1" && event_id == "e-1"
        ));
    }

    #[tokio::test]
    async fn test_parked_pop_woken_by_assign() {
        let (queue, _notices) = EventQueue::new(RpcServerConfig::default());

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop("w-1").await })
        };
        while queue.parked() == 0 {
            tokio::task::yield_now().await;
        }

        queue.assign("w-1", event("e-1"));
        assert_eq!(waiting.await.unwrap().unwrap().id, "e-1");
        assert_eq!(queue.parked(), 0);
    }

    #[tokio::test]
    async fn test_reject_parked_pop() {
        let (queue, _notices) = EventQueue::new(RpcServerConfig::default());

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop("w-1").await })
        };
        while queue.parked() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(queue.reject("w-1").is_none());
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::NoNextEvent { .. }));
        assert_eq!(err.status_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_revoke_only_unpopped() {
        let (queue, _notices) = EventQueue::new(RpcServerConfig::default());

        queue.assign("w-1", event("e-1"));
        assert!(queue.revoke("w-1", "e-2").is_none());
        assert_eq!(queue.revoke("w-1", "e-1").unwrap().id, "e-1");

        queue.assign("w-1", event("e-3"));
        queue.pop("w-1").await.unwrap();
        assert!(queue.revoke("w-1", "e-3").is_none());
    }

    #[tokio::test]
    async fn test_complete_answered_by_scheduler() {
        let (queue, mut notices) = EventQueue::new(RpcServerConfig::default());

        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                if let QueueNotice::Completed {
                    event_id, reply, ..
                } = notice
                {
                    let _ = reply.send(event_id == "known");
                }
            }
        });

        let accepted = queue
            .complete(Complete {
                id: "known".into(),
                succeeded: true,
            })
            .await
            .unwrap();
        assert!(accepted.accepted);

        let rejected = queue
            .complete(Complete {
                id: "late".into(),
                succeeded: true,
            })
            .await
            .unwrap();
        assert!(!rejected.accepted);
    }

    #[tokio::test]
    async fn test_complete_without_scheduler() {
        let (queue, notices) = EventQueue::new(RpcServerConfig::default());
        drop(notices);

        let err = queue
            .complete(Complete {
                id: "e".into(),
                succeeded: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_add_queue_rules() {
        let (queue, _notices) = EventQueue::new(RpcServerConfig::default());

        queue.add_queue(Arc::new(DatabaseQueue::new())).unwrap();
        assert!(matches!(
            queue.add_queue(Arc::new(DatabaseQueue::new())),
            Err(CoreError::DuplicateService { .. })
        ));
    }

    #[tokio::test]
    async fn test_discard_payloads_reaches_domain_queues() {
        let (queue, _notices) = EventQueue::new(RpcServerConfig::default());
        let database = Arc::new(DatabaseQueue::new());
        queue.add_queue(database.clone()).unwrap();

        database.enqueue("e-1", Default::default());
        queue.discard_payloads("e-1");
        assert_eq!(database.size(), 0);
    }
}
