// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable function host.
//!
//! [`FnHostRuntime`] wires the event queue, the trigger enqueuers, the
//! cross-replica coordination layer and the worker pool together, so the
//! host can run inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fnhost_core::SqlitePersistence;
//! use fnhost_scheduler::runner::ProcessRunner;
//! use fnhost_scheduler::runtime::FnHostRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::connect("sqlite://fnhost.db").await?);
//!
//!     let runtime = FnHostRuntime::builder()
//!         .persistence(persistence)
//!         .runner(Arc::new(ProcessRunner::new("fnhost-worker")))
//!         .rpc_addr("127.0.0.1:7400".parse()?)
//!         .http_addr("0.0.0.0:7480".parse()?)
//!         .max_concurrency(8)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::{HeaderName, HeaderValue, Method};
use fnhost_core::{
    ClassCommander, CommandMessenger, EventQueue, JobReducer, Memory, MemoryConfig, Persistence,
    ReplicationMap, Transport,
};
use fnhost_protocol::RpcServerConfig;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use crate::bindings::Binding;
use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::config::CorsConfig;
use crate::enqueuer::{Broker, EnqueuerContext, EnqueuerRegistry, MemoryBroker};
use crate::runner::Runner;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats, WarmWorker};

/// Name of the replicated map of warm workers.
pub const WARM_WORKERS_MAP: &str = "warm-workers";

/// Builder for [`FnHostRuntime`].
pub struct FnHostRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    runner: Option<Arc<dyn Runner>>,
    rpc_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    max_concurrency: usize,
    default_timeout: Duration,
    kill_grace: Duration,
    drain_timeout: Duration,
    cors: CorsConfig,
    invocation_logs: bool,
    replica_id: String,
    entrypoint: String,
    worker_runtime: String,
    bindings: Vec<Binding>,
    broker: Option<Arc<dyn Broker>>,
    poll_interval: Duration,
    cleanup: CleanupWorkerConfig,
}

impl Default for FnHostRuntimeBuilder {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            persistence: None,
            runner: None,
            rpc_addr: scheduler.server_addr,
            http_addr: None,
            max_concurrency: scheduler.max_concurrency,
            default_timeout: scheduler.default_timeout,
            kill_grace: scheduler.kill_grace,
            drain_timeout: Duration::from_secs(30),
            cors: CorsConfig::default(),
            invocation_logs: false,
            replica_id: scheduler.replica_id,
            entrypoint: scheduler.entrypoint,
            worker_runtime: scheduler.runtime,
            bindings: Vec::new(),
            broker: None,
            poll_interval: Duration::from_millis(500),
            cleanup: CleanupWorkerConfig::default(),
        }
    }
}

impl FnHostRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the runner that starts worker processes (required).
    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the address workers connect to.
    ///
    /// Default: 127.0.0.1:7400. Port 0 picks a free port.
    pub fn rpc_addr(mut self, addr: SocketAddr) -> Self {
        self.rpc_addr = addr;
        self
    }

    /// Serve the HTTP and websocket triggers on `addr`.
    ///
    /// Default: not served.
    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    /// Default: 4.
    pub fn max_concurrency(mut self, workers: usize) -> Self {
        self.max_concurrency = workers;
        self
    }

    /// Timeout for targets that do not set their own.
    ///
    /// Default: 60 seconds.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Time between SIGTERM and SIGKILL.
    ///
    /// Default: 3 seconds.
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// How long shutdown waits for unsettled events.
    ///
    /// Default: 30 seconds.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn cors(mut self, cors: CorsConfig) -> Self {
        self.cors = cors;
        self
    }

    pub fn invocation_logs(mut self, enabled: bool) -> Self {
        self.invocation_logs = enabled;
        self
    }

    /// Default: "local".
    pub fn replica_id(mut self, id: impl Into<String>) -> Self {
        self.replica_id = id.into();
        self
    }

    /// Default: "index".
    pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = entrypoint.into();
        self
    }

    /// Default: "native".
    pub fn worker_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.worker_runtime = runtime.into();
        self
    }

    /// Targets to subscribe once the enqueuers are running.
    pub fn bindings(mut self, bindings: Vec<Binding>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Message broker for queue triggers.
    ///
    /// Default: an in-process [`MemoryBroker`].
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// How often log-backed sources (database changes, replica messages) are polled.
    ///
    /// Default: 500ms.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Retention of the store's message, change and job logs.
    ///
    /// Default: hourly entries kept, trimmed every 5 minutes.
    pub fn cleanup(mut self, config: CleanupWorkerConfig) -> Self {
        self.cleanup = config;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<FnHostRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("runner is required"))?;
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }

        Ok(FnHostRuntimeConfig {
            persistence,
            runner,
            rpc_addr: self.rpc_addr,
            http_addr: self.http_addr,
            max_concurrency: self.max_concurrency,
            default_timeout: self.default_timeout,
            kill_grace: self.kill_grace,
            drain_timeout: self.drain_timeout,
            cors: self.cors,
            invocation_logs: self.invocation_logs,
            replica_id: self.replica_id,
            entrypoint: self.entrypoint,
            worker_runtime: self.worker_runtime,
            bindings: self.bindings,
            broker: self
                .broker
                .unwrap_or_else(|| Arc::new(MemoryBroker::new()) as Arc<dyn Broker>),
            poll_interval: self.poll_interval,
            cleanup: self.cleanup,
        })
    }
}

/// Configuration for [`FnHostRuntime`].
pub struct FnHostRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    runner: Arc<dyn Runner>,
    rpc_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    max_concurrency: usize,
    default_timeout: Duration,
    kill_grace: Duration,
    drain_timeout: Duration,
    cors: CorsConfig,
    invocation_logs: bool,
    replica_id: String,
    entrypoint: String,
    worker_runtime: String,
    bindings: Vec<Binding>,
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
    cleanup: CleanupWorkerConfig,
}

impl FnHostRuntimeConfig {
    /// Start the host.
    ///
    /// Nothing is left running if any step fails.
    pub async fn start(self) -> Result<FnHostRuntime> {
        info!(
            replica_id = %self.replica_id,
            rpc_addr = %self.rpc_addr,
            http_addr = ?self.http_addr,
            max_concurrency = self.max_concurrency,
            "Starting fnhost runtime"
        );

        let (event_queue, notices) = EventQueue::new(RpcServerConfig {
            bind_addr: self.rpc_addr,
            ..RpcServerConfig::from_env()
        });

        // Replica coordination
        let transport: Arc<dyn Transport> = Arc::new(Memory::with_config(
            self.persistence.clone(),
            MemoryConfig {
                poll_interval: self.poll_interval,
                ..MemoryConfig::default()
            },
        ));
        let commander = ClassCommander::new(CommandMessenger::new(
            transport,
            self.replica_id.clone(),
        ));
        commander.start().await?;
        let warm_workers =
            ReplicationMap::<WarmWorker>::new(WARM_WORKERS_MAP, commander.clone()).await;
        let job_reducer = Arc::new(JobReducer::new(
            self.persistence.clone(),
            self.replica_id.clone(),
        ));

        let ctx = EnqueuerContext {
            event_queue: event_queue.clone(),
            persistence: self.persistence.clone(),
            job_reducer: Some(job_reducer),
            commander: Some(commander.clone()),
            broker: self.broker.clone(),
            poll_interval: self.poll_interval,
        };
        let registry = Arc::new(EnqueuerRegistry::standard(&ctx)?);
        for service in registry.services() {
            event_queue.add_queue(service)?;
        }

        let rpc_addr = match event_queue.listen(self.rpc_addr).await {
            Ok(addr) => addr,
            Err(e) => {
                commander.stop().await;
                return Err(e.into());
            }
        };
        info!(addr = %rpc_addr, "Event queue listening");

        let scheduler = Scheduler::new(
            SchedulerConfig {
                max_concurrency: self.max_concurrency,
                default_timeout: self.default_timeout,
                kill_grace: self.kill_grace,
                invocation_logs: self.invocation_logs,
                replica_id: self.replica_id.clone(),
                server_addr: rpc_addr,
                entrypoint: self.entrypoint,
                runtime: self.worker_runtime,
                ..SchedulerConfig::default()
            },
            event_queue.clone(),
            notices,
            self.runner,
            registry.clone(),
        )
        .with_warm_workers(warm_workers);

        let (scheduler, scheduler_task) = match scheduler.start().await {
            Ok(started) => started,
            Err(e) => {
                event_queue.close().await;
                commander.stop().await;
                return Err(e.into());
            }
        };

        let cleanup_worker = CleanupWorker::new(self.persistence.clone(), self.cleanup);
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_task = tokio::spawn(async move { cleanup_worker.run().await });

        let runtime = FnHostRuntime {
            event_queue,
            registry,
            scheduler,
            scheduler_task,
            commander,
            cleanup: (cleanup_shutdown, cleanup_task),
            rpc_addr,
            http: None,
            drain_timeout: self.drain_timeout,
        };

        match runtime.start_triggers(self.http_addr, &self.cors, self.bindings).await {
            Ok(http) => {
                let runtime = FnHostRuntime { http, ..runtime };
                info!(
                    rpc_addr = %runtime.rpc_addr,
                    http_addr = ?runtime.http_addr(),
                    enqueuers = runtime.registry.kinds().len(),
                    "fnhost runtime started"
                );
                Ok(runtime)
            }
            Err(e) => {
                error!(error = %e, "Failed to start triggers");
                if let Err(shutdown) = runtime.shutdown().await {
                    warn!(error = %shutdown, "Cleanup after failed start did not finish");
                }
                Err(e)
            }
        }
    }
}

/// HTTP listener serving the enqueuer routes.
struct HttpServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Running function host.
pub struct FnHostRuntime {
    event_queue: Arc<EventQueue>,
    registry: Arc<EnqueuerRegistry>,
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
    commander: Arc<ClassCommander>,
    cleanup: (Arc<Notify>, JoinHandle<()>),
    rpc_addr: SocketAddr,
    http: Option<HttpServer>,
    drain_timeout: Duration,
}

impl FnHostRuntime {
    pub fn builder() -> FnHostRuntimeBuilder {
        FnHostRuntimeBuilder::new()
    }

    /// Address workers connect to.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Bound address of the trigger listener, if served.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|http| http.addr)
    }

    pub fn registry(&self) -> &Arc<EnqueuerRegistry> {
        &self.registry
    }

    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.event_queue
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        Ok(self.scheduler.stats().await?)
    }

    /// Drop every subscription of `target_id` and retire its warm workers.
    pub async fn undeploy(&self, target_id: &str) -> Result<bool> {
        let removed = self.registry.unsubscribe(target_id).await;
        self.scheduler.invalidate(target_id)?;
        Ok(removed)
    }

    async fn start_triggers(
        &self,
        http_addr: Option<SocketAddr>,
        cors: &CorsConfig,
        bindings: Vec<Binding>,
    ) -> Result<Option<HttpServer>> {
        self.registry.start_all().await?;

        for binding in bindings {
            let target = binding.target.into_target();
            for trigger in binding.triggers {
                self.registry.subscribe(target.clone(), trigger).await?;
            }
        }

        let (Some(addr), Some(router)) = (http_addr, self.registry.router()) else {
            return Ok(None);
        };
        let app = router.layer(cors_layer(cors));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown, mut signal) = watch::channel(false);

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = signal.wait_for(|stop| *stop).await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "HTTP trigger server failed");
            }
        });
        info!(addr = %addr, "HTTP triggers listening");

        Ok(Some(HttpServer {
            addr,
            shutdown,
            task,
        }))
    }

    /// Shut the host down.
    ///
    /// Stops accepting triggers, waits up to the drain timeout for unsettled
    /// events, then stops every worker and the event queue.
    pub async fn shutdown(self) -> Result<()> {
        info!("fnhost runtime shutting down...");

        if let Some(http) = self.http {
            let _ = http.shutdown.send(true);
            if let Err(e) = http.task.await {
                error!("HTTP server task panicked: {}", e);
            }
        }

        self.registry.stop_all().await;
        if tokio::time::timeout(self.drain_timeout, self.registry.drained())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.drain_timeout.as_secs(),
                "Events still unsettled after drain timeout, cancelling"
            );
        }

        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "Scheduler already stopped");
        }
        if let Err(e) = self.scheduler_task.await {
            error!("Scheduler task panicked: {}", e);
        }

        self.event_queue.close().await;
        self.commander.stop().await;

        let (cleanup_shutdown, cleanup_task) = self.cleanup;
        cleanup_shutdown.notify_one();
        if let Err(e) = cleanup_task.await {
            error!("Cleanup worker task panicked: {}", e);
        }

        info!("fnhost runtime shutdown complete");
        Ok(())
    }
}

/// Cross-origin layer for the trigger routes. A lone `*` allows anything,
/// mirrored back when credentials are enabled.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let any_origin = config.origins.len() == 1 && config.origins[0] == "*";
    let any_header = config.headers.iter().any(|h| h == "*");

    let origin = if any_origin && config.credentials {
        AllowOrigin::mirror_request()
    } else if any_origin {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            config
                .origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        error!(origin = %origin, "Invalid CORS origin, skipping");
                        None
                    }
                }),
        )
    };

    let headers = if any_header && config.credentials {
        AllowHeaders::mirror_request()
    } else if any_header {
        AllowHeaders::from(Any)
    } else {
        AllowHeaders::list(
            config
                .headers
                .iter()
                .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok()),
        )
    };

    let methods = AllowMethods::list(
        config
            .methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.to_uppercase().as_bytes()).ok()),
    );

    CorsLayer::new()
        .allow_origin(origin)
        .allow_headers(headers)
        .allow_methods(methods)
        .allow_credentials(config.credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use fnhost_core::SqlitePersistence;

    #[test]
    fn test_builder_requires_persistence_and_runner() {
        let err = FnHostRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("persistence"));

        let err = FnHostRuntime::builder()
            .runner(Arc::new(MockRunner::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("persistence"));
    }

    #[tokio::test]
    async fn test_builder_rejects_empty_pool() {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let err = FnHostRuntime::builder()
            .persistence(persistence)
            .runner(Arc::new(MockRunner::new()))
            .max_concurrency(0)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn test_cors_layer_variants() {
        use tower::Layer;

        // Wrapping a service runs tower-http's wildcard/credentials checks.
        let usable = |config: CorsConfig| {
            let _ = cors_layer(&config).layer(axum::Router::<()>::new());
        };
        usable(CorsConfig::default());
        usable(CorsConfig {
            credentials: true,
            ..CorsConfig::default()
        });
        usable(CorsConfig {
            origins: vec!["https://app.example.com".into(), "not a header\n".into()],
            headers: vec!["content-type".into()],
            credentials: true,
            ..CorsConfig::default()
        });
    }
}
