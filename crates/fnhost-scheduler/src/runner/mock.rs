// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Spawns nothing. "Workers" are entries in a table, tests play the worker
//! side against the event queue directly and use [`MockRunner::crash`] to
//! simulate a process dying.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};

use super::traits::*;

/// Mock runner for testing.
pub struct MockRunner {
    live: DashMap<String, mpsc::UnboundedSender<WorkerExit>>,
    spawned: Mutex<Vec<WorkerSpec>>,
    terminated: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
    fail_spawn: AtomicBool,
    /// If true, workers survive SIGTERM and only go away on SIGKILL.
    /// This is useful for testing kill escalation.
    pub ignore_sigterm: bool,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a new mock runner.
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
            spawned: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            fail_spawn: AtomicBool::new(false),
            ignore_sigterm: false,
        }
    }

    /// Create a mock runner whose workers ignore SIGTERM.
    pub fn stubborn() -> Self {
        Self {
            ignore_sigterm: true,
            ..Self::new()
        }
    }

    /// Make subsequent spawns fail (or succeed again).
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Simulate the worker process dying on its own.
    pub fn crash(&self, worker_id: &str) -> bool {
        self.exit(worker_id, Some(1))
    }

    /// Ids of workers that have not exited, sorted.
    pub fn live_workers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn spawned(&self) -> Vec<WorkerSpec> {
        self.spawned.lock().await.clone()
    }

    pub async fn terminated(&self) -> Vec<String> {
        self.terminated.lock().await.clone()
    }

    pub async fn killed(&self) -> Vec<String> {
        self.killed.lock().await.clone()
    }

    fn exit(&self, worker_id: &str, code: Option<i32>) -> bool {
        match self.live.remove(worker_id) {
            Some((worker_id, exits)) => {
                let _ = exits.send(WorkerExit { worker_id, code });
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn spawn(
        &self,
        spec: &WorkerSpec,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<WorkerHandle> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(RunnerError::StartFailed("mock spawn failure".to_string()));
        }
        self.spawned.lock().await.push(spec.clone());
        self.live.insert(spec.worker_id.clone(), exits);
        Ok(WorkerHandle {
            worker_id: spec.worker_id.clone(),
            pid: None,
            started_at: Utc::now(),
        })
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<()> {
        self.terminated.lock().await.push(handle.worker_id.clone());
        if !self.ignore_sigterm {
            self.exit(&handle.worker_id, None);
        }
        Ok(())
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        self.killed.lock().await.push(handle.worker_id.clone());
        self.exit(&handle.worker_id, None);
        Ok(())
    }
}
