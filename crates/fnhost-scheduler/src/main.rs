// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost - function host
//!
//! Runs a pool of worker processes and feeds them events from:
//! - HTTP requests under `/fn-execute`
//! - database change logs
//! - cron schedules
//! - the `/firehose` websocket
//! - message broker queues, agent tool calls and gRPC calls

use std::sync::Arc;
use tracing::{info, warn};

use fnhost_core::SqlitePersistence;
use fnhost_scheduler::bindings::load_bindings;
use fnhost_scheduler::config::Config;
use fnhost_scheduler::enqueuer::AmqpBroker;
use fnhost_scheduler::runner::{ProcessRunner, Runner};
use fnhost_scheduler::runtime::FnHostRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    info!(
        rpc_addr = %config.rpc_addr,
        http_addr = ?config.http_addr,
        replica_id = %config.replica_id,
        max_concurrency = config.max_concurrency,
        "Starting fnhost"
    );

    let persistence = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    info!("Connected to database");

    let runner = Arc::new(ProcessRunner::new(&config.worker_bin));
    info!(
        runner_type = runner.runner_type(),
        worker_bin = %config.worker_bin.display(),
        "Runner initialized"
    );

    let bindings = match &config.triggers_file {
        Some(path) => {
            let bindings = load_bindings(path)?;
            info!(path = %path.display(), targets = bindings.len(), "Trigger bindings loaded");
            bindings
        }
        None => Vec::new(),
    };

    let mut builder = FnHostRuntime::builder()
        .persistence(persistence)
        .runner(runner)
        .rpc_addr(config.rpc_addr)
        .max_concurrency(config.max_concurrency)
        .default_timeout(config.timeout)
        .kill_grace(config.kill_grace)
        .cors(config.cors.clone())
        .invocation_logs(config.invocation_logs)
        .replica_id(&config.replica_id)
        .worker_runtime(&config.worker_runtime)
        .bindings(bindings)
        .cleanup(config.cleanup.clone());
    if let Some(addr) = config.http_addr {
        builder = builder.http_addr(addr);
    }
    if let Some(url) = &config.amqp_url {
        let broker = AmqpBroker::connect(url, config.amqp_prefetch).await?;
        builder = builder.broker(Arc::new(broker));
    }

    let runtime = builder.build()?.start().await?;
    info!(rpc_addr = %runtime.rpc_addr(), "fnhost ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("fnhost shut down");

    Ok(())
}
