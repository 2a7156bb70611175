// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker configuration, read from the environment the host spawns it with.

use std::env;
use std::net::SocketAddr;

use fnhost_protocol::RpcClientConfig;

use crate::error::{Result, SdkError};

const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:7400";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker id assigned by the host (required).
    pub worker_id: String,
    /// Event queue address (default: "127.0.0.1:7400")
    pub server_addr: SocketAddr,
    /// Server name for TLS verification (default: "localhost")
    pub server_name: String,
    /// Module the worker loads its functions from (default: "index")
    pub entrypoint: String,
    /// Runtime marker set by the host (default: "native")
    pub runtime: String,
    /// Skip TLS certificate verification (default: false)
    pub skip_cert_verification: bool,
    /// Connection timeout in milliseconds (default: 10_000)
    pub connect_timeout_ms: u64,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `FNHOST_WORKER_ID`
    ///
    /// # Optional Environment Variables
    /// - `FNHOST_SERVER_ADDR` (default: "127.0.0.1:7400")
    /// - `FNHOST_SERVER_NAME` (default: "localhost")
    /// - `FNHOST_ENTRYPOINT` (default: "index")
    /// - `FNHOST_RUNTIME` (default: "native")
    /// - `FNHOST_SKIP_CERT_VERIFICATION` (default: false)
    /// - `FNHOST_CONNECT_TIMEOUT_MS` (default: 10000)
    pub fn from_env() -> Result<Self> {
        let worker_id = env::var("FNHOST_WORKER_ID")
            .map_err(|_| SdkError::Config("FNHOST_WORKER_ID is required".to_string()))?;

        let server_addr = env::var("FNHOST_SERVER_ADDR")
            .unwrap_or_else(|_| DEFAULT_SERVER_ADDR.to_string())
            .parse()
            .map_err(|e| SdkError::Config(format!("invalid FNHOST_SERVER_ADDR: {}", e)))?;

        let server_name =
            env::var("FNHOST_SERVER_NAME").unwrap_or_else(|_| "localhost".to_string());
        let entrypoint = env::var("FNHOST_ENTRYPOINT").unwrap_or_else(|_| "index".to_string());
        let runtime = env::var("FNHOST_RUNTIME").unwrap_or_else(|_| "native".to_string());

        let skip_cert_verification = env::var("FNHOST_SKIP_CERT_VERIFICATION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let connect_timeout_ms = env::var("FNHOST_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);

        Ok(Self {
            worker_id,
            server_addr,
            server_name,
            entrypoint,
            runtime,
            skip_cert_verification,
            connect_timeout_ms,
        })
    }

    /// Configuration for a host on this machine with a self-signed certificate.
    pub fn localhost(worker_id: impl Into<String>, server_addr: SocketAddr) -> Self {
        Self {
            worker_id: worker_id.into(),
            server_addr,
            server_name: "localhost".to_string(),
            entrypoint: "index".to_string(),
            runtime: "native".to_string(),
            skip_cert_verification: true,
            connect_timeout_ms: 10_000,
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = entrypoint.into();
        self
    }

    pub(crate) fn client_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            server_addr: self.server_addr,
            server_name: self.server_name.clone(),
            dangerous_skip_cert_verification: self.skip_cert_verification,
            connect_timeout_ms: self.connect_timeout_ms,
            ..RpcClientConfig::default()
        }
    }
}
