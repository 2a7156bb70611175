// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker slots and their state machine.
//!
//! ```text
//! Fresh ──assign──▶ Targeted ──pop──▶ Busy ──complete──▶ Fresh
//!   │                  │  └──revoke──▶ Fresh               │
//!   │                  ├──deadline──▶ Timeouted ◀──────────┤
//!   └──invalidate──────┴────────────▶ Outdated ◀───────────┘
//! ```
//!
//! Timeouted and Outdated are terminal for the process: the slot goes back
//! to Fresh only through [`WorkerSlot::attach`] with a new process.

use std::collections::VecDeque;

use fnhost_protocol::messages::Event;
use serde::Serialize;
use tokio::time::Instant;

use super::batch::Batch;
use crate::error::{Result, SchedulerError};
use crate::runner::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Idle and assignable.
    Fresh,
    /// Assigned an event the worker has not popped yet.
    Targeted,
    /// Popped its event and running it.
    Busy,
    /// Missed its deadline, being torn down.
    Timeouted,
    /// Marked for replacement, not reused once it finishes.
    Outdated,
}

impl WorkerState {
    pub fn can_transition(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Fresh, Targeted)
                | (Targeted, Busy)
                | (Targeted, Fresh)
                | (Busy, Fresh)
                | (Targeted | Busy | Outdated, Timeouted)
                | (Fresh | Targeted | Busy, Outdated)
        )
    }
}

/// The event a slot is running.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub event: Event,
    pub assigned_at: Instant,
    pub popped_at: Option<Instant>,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct WorkerSlot {
    index: usize,
    generation: u64,
    state: WorkerState,
    handle: Option<WorkerHandle>,
    in_flight: Option<InFlight>,
    /// Events routed here by an open batch, run after the current one.
    pub(crate) inbox: VecDeque<Event>,
    pub(crate) batch: Option<Batch>,
    last_target: Option<String>,
    /// SIGKILL escalation after an unanswered SIGTERM.
    pub(crate) kill_at: Option<Instant>,
    /// Retry of a failed spawn.
    pub(crate) respawn_at: Option<Instant>,
}

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            generation: 0,
            state: WorkerState::Fresh,
            handle: None,
            in_flight: None,
            inbox: VecDeque::new(),
            batch: None,
            last_target: None,
            kill_at: None,
            respawn_at: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Id of the current (or last) process in this slot.
    pub fn worker_id(&self) -> String {
        format!("w{}-{}", self.index, self.generation)
    }

    /// Id for the next process of this slot.
    pub fn next_worker_id(&mut self) -> String {
        self.generation += 1;
        self.worker_id()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn handle(&self) -> Option<&WorkerHandle> {
        self.handle.as_ref()
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub fn last_target(&self) -> Option<&str> {
        self.last_target.as_deref()
    }

    /// Has a live process and nothing to do.
    pub fn is_assignable(&self) -> bool {
        self.state == WorkerState::Fresh && self.handle.is_some()
    }

    pub fn transition(&mut self, to: WorkerState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(SchedulerError::InvalidTransition {
                worker_id: self.worker_id(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Fresh -> Targeted with `event`.
    pub fn assign(&mut self, event: Event, now: Instant, deadline: Instant) -> Result<()> {
        self.transition(WorkerState::Targeted)?;
        self.last_target = Some(event.target_id().to_string());
        self.in_flight = Some(InFlight {
            event,
            assigned_at: now,
            popped_at: None,
            deadline,
        });
        Ok(())
    }

    /// The worker fetched its event. Outdated slots keep their state.
    pub fn mark_popped(&mut self, now: Instant) -> Result<()> {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.popped_at = Some(now);
        }
        match self.state {
            WorkerState::Outdated => Ok(()),
            _ => self.transition(WorkerState::Busy),
        }
    }

    pub fn take_in_flight(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    /// Put a fresh process in the slot.
    pub fn attach(&mut self, handle: WorkerHandle) {
        self.state = WorkerState::Fresh;
        self.handle = Some(handle);
        self.in_flight = None;
        self.batch = None;
        self.last_target = None;
        self.kill_at = None;
        self.respawn_at = None;
    }

    /// The process is gone.
    pub fn detach(&mut self) -> Option<WorkerHandle> {
        self.kill_at = None;
        self.handle.take()
    }

    /// Earliest moment the decision loop must look at this slot.
    pub fn next_wakeup(&self) -> Option<Instant> {
        [
            self.in_flight.as_ref().map(|f| f.deadline),
            self.kill_at,
            self.respawn_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}
