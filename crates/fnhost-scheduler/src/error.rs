// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnhost-scheduler.

use fnhost_core::CoreError;
use fnhost_protocol::messages::EventType;
use thiserror::Error;

use crate::scheduler::WorkerState;

/// Scheduler errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A worker process could not be started.
    #[error("Failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: String,
        #[source]
        source: crate::runner::RunnerError,
    },

    /// A worker slot was asked to make a move its state does not allow.
    #[error("Worker {worker_id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        worker_id: String,
        from: WorkerState,
        to: WorkerState,
    },

    /// The decision loop has exited.
    #[error("Scheduler is not running")]
    Stopped,

    /// Event queue operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Enqueuer setup failed.
    #[error("Enqueuer error: {0}")]
    Enqueuer(#[from] EnqueuerError),
}

/// Result type using [`SchedulerError`].
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised by trigger enqueuers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnqueuerError {
    /// No enqueuer handles this trigger kind.
    #[error("No enqueuer registered for {}", .0.as_str_name())]
    Unsupported(EventType),

    /// Two enqueuers claim the same trigger kind.
    #[error("An enqueuer for {} is already registered", .0.as_str_name())]
    Duplicate(EventType),

    /// The trigger definition is malformed (bad cron, unknown timezone, ...).
    #[error("Invalid trigger for target {target}: {reason}")]
    InvalidTrigger { target: String, reason: String },

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("No gRPC handler for {service}/{method}")]
    UnknownMethod { service: String, method: String },

    /// The worker settled the event without sending a reply.
    #[error("Event {0} finished without a response")]
    NoResponse(String),

    /// The worker replied with an error.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Message broker operation failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Shared store operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
