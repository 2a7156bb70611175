// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::CoreError;

use super::{ChangeRecord, JobLockRecord, MessageRecord, Persistence, now_ms};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Wrap an existing pool. Migrations are the caller's business.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL, creating the file if needed, and migrate.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::database("connect", e))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::database("connect", format!("{}: {}", url, e)))?;

        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open the database file at `path`, creating parent directories.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::database("create_dir", format!("{:?}: {}", parent, e))
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::database("connect", e))?;

        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn try_acquire_job(
        &self,
        job_key: &str,
        owner: &str,
        meta: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = now_ms();
        let expires = now + ttl.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO job_locks (job_key, owner, meta, state, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, 'running', ?4, ?5)
            ON CONFLICT(job_key) DO UPDATE
                SET owner = excluded.owner,
                    state = 'running',
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at,
                    finished_at = NULL
                WHERE job_locks.state = 'running' AND job_locks.expires_at < excluded.acquired_at
            "#,
        )
        .bind(job_key)
        .bind(owner)
        .bind(meta)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::database("acquire_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, job_key: &str) -> Result<Option<JobLockRecord>, CoreError> {
        let record = sqlx::query_as::<_, JobLockRecord>(
            r#"
            SELECT job_key, owner, meta, state, acquired_at, expires_at, finished_at
            FROM job_locks
            WHERE job_key = ?
            "#,
        )
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn finish_job(&self, job_key: &str, owner: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE job_locks
            SET state = 'done', finished_at = ?1
            WHERE job_key = ?2 AND owner = ?3
            "#,
        )
        .bind(now_ms())
        .bind(job_key)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::database("finish_job", e))?;

        Ok(())
    }

    async fn release_job(&self, job_key: &str, owner: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            DELETE FROM job_locks
            WHERE job_key = ? AND owner = ? AND state = 'running'
            "#,
        )
        .bind(job_key)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::database("release_job", e))?;

        Ok(())
    }

    async fn purge_finished_jobs(&self, before_ms: i64) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_locks
            WHERE state = 'done' AND finished_at < ?
            "#,
        )
        .bind(before_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn append_message(&self, topic: &str, payload: &str) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO memory_messages (topic, payload)
            VALUES (?, ?)
            "#,
        )
        .bind(topic)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::database("append_message", e))?;

        Ok(result.last_insert_rowid())
    }

    async fn messages_after(
        &self,
        topic: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, CoreError> {
        let rows = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT seq, topic, payload
            FROM memory_messages
            WHERE topic = ? AND seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn latest_message_seq(&self, topic: &str) -> Result<i64, CoreError> {
        let (seq,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(seq), 0)
            FROM memory_messages
            WHERE topic = ?
            "#,
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;

        Ok(seq)
    }

    async fn purge_messages_before(&self, before_ms: i64) -> Result<u64, CoreError> {
        // created_at is CURRENT_TIMESTAMP text, second resolution.
        let result = sqlx::query(
            r#"
            DELETE FROM memory_messages
            WHERE created_at < datetime(? / 1000, 'unixepoch')
            "#,
        )
        .bind(before_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::database("purge_messages", e))?;

        Ok(result.rows_affected())
    }

    async fn record_change(
        &self,
        collection: &str,
        kind: &str,
        document_key: &str,
        document: Option<&str>,
    ) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO collection_changes (collection, kind, document_key, document)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(collection)
        .bind(kind)
        .bind(document_key)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::database("record_change", e))?;

        Ok(result.last_insert_rowid())
    }

    async fn changes_after(
        &self,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<ChangeRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ChangeRecord>(
            r#"
            SELECT seq, collection, kind, document_key, document
            FROM collection_changes
            WHERE seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn latest_change_seq(&self) -> Result<i64, CoreError> {
        let (seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM collection_changes")
            .fetch_one(&self.pool)
            .await?;

        Ok(seq)
    }

    async fn purge_changes_before(&self, before_ms: i64) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM collection_changes
            WHERE created_at < datetime(? / 1000, 'unixepoch')
            "#,
        )
        .bind(before_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::database("purge_changes", e))?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
