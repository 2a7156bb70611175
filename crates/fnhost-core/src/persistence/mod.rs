// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared durable state.
//!
//! Three consumers share one store:
//! - the job reducer's coordination records (`job_locks`)
//! - the pub/sub transport's message log (`memory_messages`)
//! - the database enqueuer's change stream (`collection_changes`)

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreError;

/// Coordination record of a job reducer run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobLockRecord {
    /// Content hash of the job meta.
    pub job_key: String,
    /// Replica that ran (or is running) the job.
    pub owner: String,
    /// Job meta as JSON, kept for inspection.
    pub meta: String,
    /// `running` or `done`.
    pub state: String,
    /// Epoch milliseconds.
    pub acquired_at: i64,
    pub expires_at: i64,
    pub finished_at: Option<i64>,
}

impl JobLockRecord {
    pub fn is_done(&self) -> bool {
        self.state == "done"
    }

    /// A running record whose owner stopped renewing it.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        !self.is_done() && self.expires_at < now_ms
    }
}

/// One message of the pub/sub log.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRecord {
    pub seq: i64,
    pub topic: String,
    pub payload: String,
}

/// One entry of the collection change log.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChangeRecord {
    pub seq: i64,
    pub collection: String,
    /// `insert`, `update`, `replace` or `delete`.
    pub kind: String,
    pub document_key: String,
    pub document: Option<String>,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Job coordination
    // ========================================================================

    /// Insert a `running` record for `job_key` unless one exists.
    ///
    /// An expired `running` record is taken over. Returns `true` when this
    /// caller now owns the record.
    async fn try_acquire_job(
        &self,
        job_key: &str,
        owner: &str,
        meta: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    async fn get_job(&self, job_key: &str) -> Result<Option<JobLockRecord>, CoreError>;

    /// Mark the record `done`. No-op if `owner` lost it to a takeover.
    async fn finish_job(&self, job_key: &str, owner: &str) -> Result<(), CoreError>;

    /// Drop a `running` record held by `owner` so another replica can take
    /// the job right away. No-op once the record is `done` or taken over.
    async fn release_job(&self, job_key: &str, owner: &str) -> Result<(), CoreError>;

    /// Delete `done` records finished before `before_ms`. Returns how many.
    async fn purge_finished_jobs(&self, before_ms: i64) -> Result<u64, CoreError>;

    // ========================================================================
    // Pub/sub log
    // ========================================================================

    async fn append_message(&self, topic: &str, payload: &str) -> Result<i64, CoreError>;

    async fn messages_after(
        &self,
        topic: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, CoreError>;

    /// Highest sequence number for `topic`, 0 when empty.
    async fn latest_message_seq(&self, topic: &str) -> Result<i64, CoreError>;

    /// Delete messages written before `before_ms`. Returns how many.
    async fn purge_messages_before(&self, before_ms: i64) -> Result<u64, CoreError>;

    // ========================================================================
    // Collection change log
    // ========================================================================

    async fn record_change(
        &self,
        collection: &str,
        kind: &str,
        document_key: &str,
        document: Option<&str>,
    ) -> Result<i64, CoreError>;

    async fn changes_after(&self, after_seq: i64, limit: i64)
    -> Result<Vec<ChangeRecord>, CoreError>;

    /// Highest change sequence number, 0 when empty.
    async fn latest_change_seq(&self) -> Result<i64, CoreError>;

    /// Delete changes recorded before `before_ms`. Returns how many.
    async fn purge_changes_before(&self, before_ms: i64) -> Result<u64, CoreError>;

    async fn health_check(&self) -> Result<(), CoreError>;
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
