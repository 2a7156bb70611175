// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost core - the host side of the worker protocol and the cross-replica
//! coordination layer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue   ┌─────────────┐  QueueNotice  ┌─────────────┐
//! │  Enqueuers   │───────────▶│ EventQueue  │──────────────▶│  Scheduler  │
//! │ (scheduler)  │            │  (this crate)│◀──────────────│             │
//! └──────────────┘            └─────────────┘ assign/reject └─────────────┘
//!        │ payloads                  │ QUIC, one endpoint
//!        ▼                           ▼
//! ┌──────────────────────────────────────────┐
//! │ Domain queues: Database, Http, RabbitMQ, │◀──── workers pop / respond
//! │ Firehose, AgentTool, Grpc                │
//! └──────────────────────────────────────────┘
//!
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────────────────────────┐
//! │ JobReducer  │   │ Memory transport │◀──│ CommandMessenger /           │
//! │ job_locks   │   │ memory_messages  │   │ ClassCommander/ReplicationMap│
//! └─────────────┘   └──────────────────┘   └──────────────────────────────┘
//!         └──────────────┬───────┘
//!                        ▼
//!                 SQLite (sqlx)
//! ```
//!
//! Every RPC error a worker can trigger is a [`CoreError`] carrying a
//! gRPC-style status code, so a worker never hangs on a bad request.

pub mod commander;
pub mod error;
pub mod event_queue;
pub mod job_reducer;
pub mod memory;
pub mod persistence;
pub mod queue;
pub mod service;

pub use commander::{
    ClassCommander, Command, CommandError, CommandHandler, CommandMessage, CommandMessenger,
    Operation, ReplicationMap,
};
pub use error::{CoreError, Result};
pub use event_queue::{EventQueue, QueueNotice};
pub use job_reducer::{JobClaim, JobReducer, JobReducerConfig};
pub use memory::{Memory, MemoryConfig, Subscription, Transport};
pub use persistence::{Persistence, SqlitePersistence};
pub use service::{QueueService, ServiceTable};
