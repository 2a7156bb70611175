// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost scheduler - the function host.
//!
//! Keeps a fixed pool of worker processes busy with events produced by
//! trigger enqueuers, and settles each triggering party with the outcome.
//!
//! # Architecture
//!
//! ```text
//!  HTTP /fn-execute   /firehose ws   cron   change log   broker   tools   gRPC
//!        │                 │           │        │           │        │       │
//!        ▼                 ▼           ▼        ▼           ▼        ▼       ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     EnqueuerRegistry (enqueuer)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │ enqueue                                        ▲ on_event_completed
//!        ▼                                                │
//! ┌──────────────┐   QueueNotice   ┌──────────────────────┴──────────────────┐
//! │  EventQueue  │────────────────▶│ Scheduler decision loop (scheduler)     │
//! │  (QUIC RPC)  │◀────────────────│ Fresh / Targeted / Busy / Timeouted /   │
//! └──────────────┘  assign/reject  │ Outdated slots, batches, timeouts       │
//!        ▲                         └─────────────────────────────────────────┘
//!        │ pop / complete                         │ spawn / SIGTERM / SIGKILL
//!        │                                        ▼
//!        └──────────────────────────────── Worker processes (runner)
//! ```
//!
//! # Worker states
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Fresh` | Idle, never ran a target or was recycled |
//! | `Targeted` | Assigned an event it has not popped yet |
//! | `Busy` | Running an event |
//! | `Timeouted` | Past its deadline, being stopped |
//! | `Outdated` | Its target was redeployed, retired when idle |
//!
//! See [`runtime::FnHostRuntime`] to embed the host.

pub mod bindings;
pub mod cleanup_worker;
pub mod config;
pub mod enqueuer;
pub mod error;
pub mod runner;
pub mod runtime;
pub mod scheduler;

pub use enqueuer::{Enqueuer, EnqueuerContext, EnqueuerRegistry, Outcome, Trigger};
pub use error::{EnqueuerError, Result, SchedulerError};
pub use runtime::FnHostRuntime;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
