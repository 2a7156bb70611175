// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that trims the shared store.
//!
//! Removes entries older than `max_age` from:
//! - `memory_messages` (replica pub/sub log)
//! - `collection_changes` (database trigger log)
//! - `job_locks` records in the `done` state
//!
//! Sequence numbers keep growing after a purge, so cursors held by running
//! replicas stay valid. A replica that lags by more than `max_age` misses
//! the purged entries.

use std::sync::Arc;
use std::time::Duration;

use fnhost_core::persistence::now_ms;
use fnhost_core::{CoreError, Persistence};
use tokio::sync::Notify;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupWorkerConfig {
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Entries older than this are deleted.
    pub max_age: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(300), // 5 minutes
            max_age: Duration::from_secs(3600),      // 1 hour
        }
    }
}

impl CleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `FNHOST_CLEANUP_ENABLED`: "false" or "0" to disable (default: enabled)
    /// - `FNHOST_CLEANUP_POLL_INTERVAL_SECS`: seconds between runs (default: 300)
    /// - `FNHOST_CLEANUP_MAX_AGE_SECS`: age at which entries are deleted (default: 3600)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("FNHOST_CLEANUP_ENABLED")
            .map(|v| !(v == "false" || v == "0"))
            .unwrap_or(defaults.enabled);

        let poll_interval = std::env::var("FNHOST_CLEANUP_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        let max_age = std::env::var("FNHOST_CLEANUP_MAX_AGE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_age);

        Self {
            enabled,
            poll_interval,
            max_age,
        }
    }
}

/// Rows deleted by one cleanup cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub messages: u64,
    pub changes: u64,
    pub jobs: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.messages + self.changes + self.jobs
    }
}

pub struct CleanupWorker {
    persistence: Arc<dyn Persistence>,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    pub fn new(persistence: Arc<dyn Persistence>, config: CleanupWorkerConfig) -> Self {
        Self {
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until the shutdown signal.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_once().await {
                        error!(error = %e, "Failed to clean up the shared store");
                    }
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// One cleanup cycle.
    pub async fn cleanup_once(&self) -> Result<CleanupReport, CoreError> {
        let cutoff = now_ms() - self.config.max_age.as_millis() as i64;

        let report = CleanupReport {
            messages: self.persistence.purge_messages_before(cutoff).await?,
            changes: self.persistence.purge_changes_before(cutoff).await?,
            jobs: self.persistence.purge_finished_jobs(cutoff).await?,
        };

        if report.total() > 0 {
            info!(
                messages = report.messages,
                changes = report.changes,
                jobs = report.jobs,
                "Cleanup cycle completed"
            );
        } else {
            debug!("Cleanup cycle completed, nothing to delete");
        }
        Ok(report)
    }
}
