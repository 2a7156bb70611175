// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deduplication of identical jobs across callers and replicas.
//!
//! A job is identified by the content hash of its meta (minus `_id`). The
//! first caller in a process becomes the local owner; concurrent callers in
//! the same process wait on a watch channel. The local owner then competes
//! for the durable `job_locks` record, which settles the race between
//! replicas. Finished records are kept for `retention` so a replica that
//! arrives slightly late still sees the job as done.
//!
//! [`JobReducer::run`] waits for whichever caller runs the job.
//! [`JobReducer::try_claim`] never waits: it either hands back a
//! [`JobClaim`] or reports that someone else has the job. A lease dropped
//! before it is finished releases the durable record in the background.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::persistence::{Persistence, now_ms};

#[derive(Debug, Clone)]
pub struct JobReducerConfig {
    /// Lease on a running record. Must exceed the longest job.
    pub ttl: Duration,
    /// How long finished records suppress duplicates.
    pub retention: Duration,
    /// How often a replica that lost the race checks the record.
    pub poll_interval: Duration,
}

impl Default for JobReducerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            retention: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

type InFlight = Arc<DashMap<String, watch::Receiver<bool>>>;

pub struct JobReducer {
    persistence: Arc<dyn Persistence>,
    owner: String,
    config: JobReducerConfig,
    in_flight: InFlight,
}

/// Releases local waiters when the owning call finishes or is dropped.
struct LocalOwner {
    key: String,
    in_flight: InFlight,
    done: watch::Sender<bool>,
}

impl Drop for LocalOwner {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
        self.done.send_replace(true);
    }
}

/// Ownership of a durable `running` record.
struct Lease {
    key: String,
    owner: String,
    persistence: Arc<dyn Persistence>,
    retention: Duration,
    settled: bool,
}

impl Lease {
    async fn finish(mut self) {
        self.settled = true;

        if let Err(e) = self.persistence.finish_job(&self.key, &self.owner).await {
            warn!(job_key = %self.key, error = %e, "failed to mark job done");
        }
        let horizon = now_ms() - self.retention.as_millis() as i64;
        if let Err(e) = self.persistence.purge_finished_jobs(horizon).await {
            debug!(error = %e, "failed to purge finished jobs");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Abandoned mid-job. Free the record now instead of at TTL expiry.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let persistence = self.persistence.clone();
        let key = std::mem::take(&mut self.key);
        let owner = self.owner.clone();
        handle.spawn(async move {
            match persistence.release_job(&key, &owner).await {
                Ok(()) => debug!(job_key = %key, "released abandoned job"),
                Err(e) => warn!(job_key = %key, error = %e, "failed to release abandoned job"),
            }
        });
    }
}

/// Exclusive right to run one job, obtained from [`JobReducer::try_claim`].
///
/// Call [`JobClaim::finish`] once the job is done. Dropping the claim
/// instead releases it so another caller may run the job.
pub struct JobClaim {
    lease: Option<Lease>,
    _local: Option<LocalOwner>,
}

impl JobClaim {
    /// Whether the claim is backed by a durable record. `false` when the
    /// store was unreachable and the job runs without cross-replica
    /// deduplication.
    pub fn is_coordinated(&self) -> bool {
        self.lease.is_some()
    }

    pub async fn finish(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.finish().await;
        }
    }
}

enum Attempt {
    Acquired(Lease),
    /// Finished within the retention window.
    Done,
    /// Running under another live owner.
    Held,
    /// The store failed.
    Unavailable,
}

impl JobReducer {
    pub fn new(persistence: Arc<dyn Persistence>, owner: impl Into<String>) -> Self {
        Self::with_config(persistence, owner, JobReducerConfig::default())
    }

    pub fn with_config(
        persistence: Arc<dyn Persistence>,
        owner: impl Into<String>,
        config: JobReducerConfig,
    ) -> Self {
        Self {
            persistence,
            owner: owner.into(),
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Run `job` unless an identical job is already running or just ran.
    ///
    /// Resolves once the single execution finishes. Returns `true` only for
    /// the caller that actually ran `job`. If coordination through the store
    /// fails the job runs anyway.
    #[instrument(skip_all, fields(owner = %self.owner))]
    pub async fn run<M, F, Fut>(&self, meta: &M, job: F) -> bool
    where
        M: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let meta = match serde_json::to_value(meta) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "job meta is not serializable, running without deduplication");
                job().await;
                return true;
            }
        };
        let key = job_key(&meta);
        let encoded = meta.to_string();

        let local = match self.own_locally(&key) {
            Ok(local) => local,
            Err(mut waiter) => {
                debug!(job_key = %key, "joining in-flight job");
                let _ = waiter.wait_for(|done| *done).await;
                return false;
            }
        };

        let lease = loop {
            match self.attempt(&key, &encoded).await {
                Attempt::Acquired(lease) => break Some(lease),
                Attempt::Unavailable => break None,
                Attempt::Done => return false,
                Attempt::Held => tokio::time::sleep(self.config.poll_interval).await,
            }
        };

        job().await;

        if let Some(lease) = lease {
            lease.finish().await;
        }
        drop(local);
        true
    }

    /// Claim the job described by `meta` without waiting for anyone.
    ///
    /// Returns `None` when an identical job is running in this process or
    /// on another replica, or finished within the retention window.
    #[instrument(skip_all, fields(owner = %self.owner))]
    pub async fn try_claim<M>(&self, meta: &M) -> Option<JobClaim>
    where
        M: Serialize + ?Sized,
    {
        let meta = match serde_json::to_value(meta) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "job meta is not serializable, running without deduplication");
                return Some(JobClaim {
                    lease: None,
                    _local: None,
                });
            }
        };
        let key = job_key(&meta);

        let Ok(local) = self.own_locally(&key) else {
            debug!(job_key = %key, "job in flight locally, skipping");
            return None;
        };

        match self.attempt(&key, &meta.to_string()).await {
            Attempt::Acquired(lease) => Some(JobClaim {
                lease: Some(lease),
                _local: Some(local),
            }),
            Attempt::Unavailable => Some(JobClaim {
                lease: None,
                _local: Some(local),
            }),
            Attempt::Done | Attempt::Held => None,
        }
    }

    fn own_locally(&self, key: &str) -> Result<LocalOwner, watch::Receiver<bool>> {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => Err(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (done, waiter) = watch::channel(false);
                entry.insert(waiter);
                Ok(LocalOwner {
                    key: key.to_string(),
                    in_flight: self.in_flight.clone(),
                    done,
                })
            }
        }
    }

    /// One round against the durable record.
    async fn attempt(&self, key: &str, encoded: &str) -> Attempt {
        loop {
            match self
                .persistence
                .try_acquire_job(key, &self.owner, encoded, self.config.ttl)
                .await
            {
                Ok(true) => {
                    return Attempt::Acquired(Lease {
                        key: key.to_string(),
                        owner: self.owner.clone(),
                        persistence: self.persistence.clone(),
                        retention: self.config.retention,
                        settled: false,
                    });
                }
                Ok(false) => match self.persistence.get_job(key).await {
                    Ok(Some(record)) if record.is_done() => {
                        debug!(job_key = %key, ran_by = %record.owner, "job already done");
                        return Attempt::Done;
                    }
                    Ok(Some(record)) => {
                        debug!(job_key = %key, held_by = %record.owner, "job running elsewhere");
                        return Attempt::Held;
                    }
                    // Released or purged between the two queries.
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(job_key = %key, error = %e, "job coordination failed, running locally");
                        return Attempt::Unavailable;
                    }
                },
                Err(e) => {
                    warn!(job_key = %key, error = %e, "job coordination failed, running locally");
                    return Attempt::Unavailable;
                }
            }
        }
    }
}

/// Content hash of `meta`, ignoring a top-level `_id` and object key order.
pub fn job_key(meta: &Value) -> String {
    let identity = match meta {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(name, _)| name.as_str() != "_id")
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    };

    let digest = Sha256::digest(canonical(&identity).to_string().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<_> = fields.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonical(&fields[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_job_key_ignores_id_and_key_order() {
        let a = json!({"_id": "1", "target": "fn", "tick": 5});
        let b = json!({"tick": 5, "target": "fn", "_id": "2"});
        let c = json!({"tick": 6, "target": "fn"});

        assert_eq!(job_key(&a), job_key(&b));
        assert_ne!(job_key(&a), job_key(&c));
        assert_eq!(job_key(&a).len(), 64);
    }

    #[test]
    fn test_job_key_nested_order() {
        let a = json!({"meta": {"x": 1, "y": [ {"b": 1, "a": 2} ]}});
        let b = json!({"meta": {"y": [ {"a": 2, "b": 1} ], "x": 1}});
        assert_eq!(job_key(&a), job_key(&b));
    }

    async fn reducer(owner: &str, persistence: Arc<dyn Persistence>) -> Arc<JobReducer> {
        Arc::new(JobReducer::with_config(
            persistence,
            owner,
            JobReducerConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_concurrent_identical_jobs_run_once() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let reducer = reducer("r1", persistence).await;
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..10 {
            let reducer = reducer.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                reducer
                    .run(&json!({"_id": i, "target": "fn-1", "tick": 1}), || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        runs.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_distinct_meta_each_run_once() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let reducer = reducer("r1", persistence).await;
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for tick in 0..3 {
            for _ in 0..4 {
                let reducer = reducer.clone();
                let runs = runs.clone();
                handles.push(tokio::spawn(async move {
                    reducer
                        .run(&json!({"target": "fn-1", "tick": tick}), || async move {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            runs.fetch_add(1, Ordering::SeqCst);
                        })
                        .await
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_replicas_share_coordination_records() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let r1 = reducer("r1", persistence.clone()).await;
        let r2 = reducer("r2", persistence).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let meta = json!({"target": "fn-1", "tick": 42});

        let first = {
            let runs = runs.clone();
            let meta = meta.clone();
            tokio::spawn(async move {
                r1.run(&meta, || async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let runs = runs.clone();
            r2.run(&meta, || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .await
        };

        assert!(first.await.unwrap());
        assert!(!second);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recent_duplicate_is_suppressed() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let reducer = reducer("r1", persistence).await;
        let meta = json!({"target": "fn-1", "tick": 7});

        assert!(reducer.run(&meta, || async {}).await);
        assert!(!reducer.run(&meta, || async {}).await);
    }

    #[tokio::test]
    async fn test_try_claim_does_not_wait_for_holder() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let r1 = reducer("r1", persistence.clone()).await;
        let r2 = reducer("r2", persistence).await;
        let meta = json!({"target": "fn-1", "seq": 3});

        let claim = r1.try_claim(&meta).await.expect("first claim wins");
        assert!(claim.is_coordinated());
        assert!(r1.try_claim(&meta).await.is_none());

        let other = tokio::time::timeout(Duration::from_millis(500), r2.try_claim(&meta))
            .await
            .expect("losing claim must return immediately");
        assert!(other.is_none());

        claim.finish().await;
        assert!(r2.try_claim(&meta).await.is_none());
        assert!(!r2.run(&meta, || async {}).await);
    }

    #[tokio::test]
    async fn test_dropped_claim_is_released() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let r1 = reducer("r1", persistence.clone()).await;
        let r2 = reducer("r2", persistence.clone()).await;
        let meta = json!({"target": "fn-1", "seq": 4});

        let claim = r1.try_claim(&meta).await.unwrap();
        drop(claim);

        let mut reclaimed = None;
        for _ in 0..100 {
            reclaimed = r2.try_claim(&meta).await;
            if reclaimed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reclaimed = reclaimed.expect("released record is claimable well before the TTL");
        reclaimed.finish().await;

        let record = persistence.get_job(&job_key(&meta)).await.unwrap().unwrap();
        assert_eq!(record.owner, "r2");
        assert!(record.is_done());
    }

    #[tokio::test]
    async fn test_cancelled_owner_frees_job_for_other_replica() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let r1 = reducer("r1", persistence.clone()).await;
        let r2 = reducer("r2", persistence).await;
        let meta = json!({"target": "fn-1", "tick": 9});

        let stuck = {
            let meta = meta.clone();
            tokio::spawn(async move {
                r1.run(&meta, || std::future::pending::<()>()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stuck.abort();
        let _ = stuck.await;

        let ran = tokio::time::timeout(Duration::from_secs(2), r2.run(&meta, || async {}))
            .await
            .expect("second replica must not wait for the lease TTL");
        assert!(ran);
    }
}
