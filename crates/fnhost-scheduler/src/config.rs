// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the fnhost binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cleanup_worker::CleanupWorkerConfig;

/// Host configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL of the store shared by every replica.
    pub database_url: String,
    /// QUIC address workers connect to.
    pub rpc_addr: SocketAddr,
    /// Address of the HTTP and websocket triggers. `None` disables them.
    pub http_addr: Option<SocketAddr>,
    /// Size of the worker pool.
    pub max_concurrency: usize,
    /// Timeout for targets that do not set their own.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    pub cors: CorsConfig,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log every invocation start and finish.
    pub invocation_logs: bool,
    pub replica_id: String,
    /// Worker executable.
    pub worker_bin: PathBuf,
    /// Runtime marker handed to workers.
    pub worker_runtime: String,
    /// JSON file listing targets and their triggers.
    pub triggers_file: Option<PathBuf>,
    /// AMQP broker for queue triggers. `None` uses the in-process broker.
    pub amqp_url: Option<String>,
    /// Unacked deliveries the AMQP broker may hand out at once.
    pub amqp_prefetch: u16,
    pub cleanup: CleanupWorkerConfig,
}

/// Cross-origin policy of the HTTP trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct CorsConfig {
    /// `*` alone allows any origin.
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
    pub credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: vec!["*".to_string()],
            methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            headers: vec!["*".to_string()],
            credentials: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FNHOST_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("FNHOST_DATABASE_URL"))?;

        let rpc_addr = parse_var("FNHOST_RPC_ADDR", "127.0.0.1:7400")?;

        let http_addr = match std::env::var("FNHOST_HTTP_ADDR") {
            Ok(value) if value.is_empty() || value == "off" => None,
            Ok(value) => Some(value.parse().map_err(|_| ConfigError::Invalid {
                var: "FNHOST_HTTP_ADDR",
                value,
            })?),
            Err(_) => Some(SocketAddr::from(([0, 0, 0, 0], 7480))),
        };

        let max_concurrency: usize = parse_var("FNHOST_MAX_CONCURRENCY", "4")?;
        if max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "FNHOST_MAX_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        let timeout = Duration::from_secs(parse_var("FNHOST_TIMEOUT_SECS", "60")?);
        let kill_grace = Duration::from_millis(parse_var("FNHOST_KILL_GRACE_MS", "3000")?);

        let default_cors = CorsConfig::default();
        let cors = CorsConfig {
            origins: list_var("FNHOST_CORS_ORIGINS").unwrap_or(default_cors.origins),
            methods: list_var("FNHOST_CORS_METHODS").unwrap_or(default_cors.methods),
            headers: list_var("FNHOST_CORS_HEADERS").unwrap_or(default_cors.headers),
            credentials: flag_var("FNHOST_CORS_CREDENTIALS"),
        };

        let log_level =
            std::env::var("FNHOST_LOG_LEVEL").unwrap_or_else(|_| "fnhost=info".to_string());

        let replica_id = std::env::var("FNHOST_REPLICA_ID")
            .unwrap_or_else(|_| format!("replica-{}", uuid::Uuid::new_v4().simple()));

        let worker_bin = PathBuf::from(
            std::env::var("FNHOST_WORKER_BIN").unwrap_or_else(|_| "fnhost-worker".to_string()),
        );
        let worker_runtime =
            std::env::var("FNHOST_WORKER_RUNTIME").unwrap_or_else(|_| "native".to_string());

        let triggers_file = std::env::var("FNHOST_TRIGGERS_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let amqp_url = std::env::var("FNHOST_AMQP_URL")
            .ok()
            .filter(|v| !v.is_empty());
        let amqp_prefetch: u16 = parse_var("FNHOST_AMQP_PREFETCH", "16")?;

        Ok(Self {
            database_url,
            rpc_addr,
            http_addr,
            max_concurrency,
            timeout,
            kill_grace,
            cors,
            log_level,
            invocation_logs: flag_var("FNHOST_INVOCATION_LOGS"),
            replica_id,
            worker_bin,
            worker_runtime,
            triggers_file,
            amqp_url,
            amqp_prefetch,
            cleanup: CleanupWorkerConfig::from_env(),
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

fn flag_var(var: &str) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Comma separated list, `None` when unset.
fn list_var(var: &str) -> Option<Vec<String>> {
    std::env::var(var).ok().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect()
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set to something that does not parse.
    #[error("Invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}
