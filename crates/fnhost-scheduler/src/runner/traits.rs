// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! A runner starts worker processes and reports their exit on a channel the
//! scheduler's decision loop selects on. Runners know nothing about events.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Binary executable was not found.
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    /// Process failed to start.
    #[error("Worker start failed: {0}")]
    StartFailed(String),

    /// Signal delivery failed.
    #[error("Failed to signal pid {pid}: {errno}")]
    Signal { pid: u32, errno: nix::errno::Errno },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Everything a worker needs to find its host.
///
/// Passed to the process as `FNHOST_SERVER_ADDR`, `FNHOST_WORKER_ID`,
/// `FNHOST_ENTRYPOINT`, `FNHOST_RUNTIME` and `FNHOST_SKIP_CERT_VERIFICATION`.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub worker_id: String,
    pub server_addr: SocketAddr,
    pub entrypoint: String,
    pub runtime: String,
    pub skip_cert_verification: bool,
    /// Extra variables, applied after the contract variables.
    pub env: HashMap<String, String>,
}

impl WorkerSpec {
    /// The full environment of the worker process.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("FNHOST_SERVER_ADDR".to_string(), self.server_addr.to_string()),
            ("FNHOST_WORKER_ID".to_string(), self.worker_id.clone()),
            ("FNHOST_ENTRYPOINT".to_string(), self.entrypoint.clone()),
            ("FNHOST_RUNTIME".to_string(), self.runtime.clone()),
            (
                "FNHOST_SKIP_CERT_VERIFICATION".to_string(),
                self.skip_cert_verification.to_string(),
            ),
        ];
        vars.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}

/// Handle for a spawned worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    /// OS process id, `None` for runners without real processes.
    pub pid: Option<u32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Sent once when a worker process is gone, whatever the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_id: String,
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
}

/// Trait for worker runners.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runner type identifier (e.g., "process", "mock")
    fn runner_type(&self) -> &'static str;

    /// Start a worker. Its exit is reported on `exits`.
    async fn spawn(
        &self,
        spec: &WorkerSpec,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<WorkerHandle>;

    /// Ask the worker to stop (SIGTERM).
    async fn terminate(&self, handle: &WorkerHandle) -> Result<()>;

    /// Stop the worker now (SIGKILL).
    async fn kill(&self, handle: &WorkerHandle) -> Result<()>;
}
