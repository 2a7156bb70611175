// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC listener that serves [`RpcRequest`]s.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, read_frame, write_frame};
use crate::rpc::{RpcError, RpcRequest, RpcResponse, status};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid server configuration: {0}")]
    Config(String),

    #[error("server closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format)
    pub key_pem: Vec<u8>,
    /// Maximum pending incoming connections (handshakes in progress)
    pub max_incoming: u32,
    /// Maximum concurrent bidirectional streams per connection.
    /// Every parked `pop` holds one stream open.
    pub max_bi_streams: u32,
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP buffer sizes in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    pub udp_send_buffer_size: usize,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 1_000,
            max_bi_streams: 1_000,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 2 * 1024 * 1024,
            udp_send_buffer_size: 2 * 1024 * 1024,
            max_concurrent_handlers: 0,
        }
    }
}

impl RpcServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `FNHOST_QUIC_MAX_INCOMING`: Max pending handshakes (default: 1000)
    /// - `FNHOST_QUIC_MAX_BI_STREAMS`: Max bidirectional streams per connection (default: 1000)
    /// - `FNHOST_QUIC_IDLE_TIMEOUT_MS`: Idle timeout in ms (default: 120000)
    /// - `FNHOST_QUIC_KEEP_ALIVE_MS`: Keep-alive interval in ms, 0 to disable (default: 15000)
    /// - `FNHOST_QUIC_UDP_RECV_BUFFER` / `FNHOST_QUIC_UDP_SEND_BUFFER`: socket buffers (default: 2097152)
    /// - `FNHOST_QUIC_MAX_HANDLERS`: Max concurrent connection handlers, 0 for unlimited (default: 0)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_incoming: env_or("FNHOST_QUIC_MAX_INCOMING", default.max_incoming),
            max_bi_streams: env_or("FNHOST_QUIC_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: env_or("FNHOST_QUIC_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "FNHOST_QUIC_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            udp_receive_buffer_size: env_or(
                "FNHOST_QUIC_UDP_RECV_BUFFER",
                default.udp_receive_buffer_size,
            ),
            udp_send_buffer_size: env_or(
                "FNHOST_QUIC_UDP_SEND_BUFFER",
                default.udp_send_buffer_size,
            ),
            max_concurrent_handlers: env_or(
                "FNHOST_QUIC_MAX_HANDLERS",
                default.max_concurrent_handlers,
            ),
            ..default
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// QUIC endpoint accepting worker connections.
pub struct RpcServer {
    endpoint: Endpoint,
    config: RpcServerConfig,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // A drained listener is re-bound on the same port right away.
        socket.set_reuse_address(true)?;

        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(
                size = config.udp_receive_buffer_size,
                error = %e,
                "Failed to set UDP receive buffer size"
            );
        }
        if config.udp_send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
        {
            warn!(
                size = config.udp_send_buffer_size,
                error = %e,
                "Failed to set UDP send buffer size"
            );
        }

        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            max_incoming = config.max_incoming,
            max_bi_streams = config.max_bi_streams,
            idle_timeout_ms = config.idle_timeout_ms,
            max_handlers = config.max_concurrent_handlers,
            "QUIC server bound"
        );

        Ok(Self { endpoint, config })
    }

    /// Create a server with a self-signed certificate for `localhost`.
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::localhost_with_config(bind_addr, RpcServerConfig::from_env())
    }

    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        mut config: RpcServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        config.bind_addr = bind_addr;
        config.cert_pem = cert.cert.pem().into_bytes();
        config.key_pem = cert.key_pair.serialize_pem().into_bytes();

        Self::new(config)
    }

    pub fn config(&self) -> &RpcServerConfig {
        &self.config
    }

    fn build_server_config(config: &RpcServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;

        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|_| ServerError::Config("idle timeout out of range".to_string()))?,
        ));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        transport.max_concurrent_uni_streams(0u32.into());
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);

        Ok(server_config)
    }

    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Close the endpoint and every open connection. Pending `run` returns.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Wait until all connections are gone after [`close`](Self::close).
    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await;
    }

    /// Serve RPCs until the endpoint is closed.
    ///
    /// Each bidirectional stream carries one request; `handler` runs in its own
    /// task so a parked call never blocks other calls on the same connection.
    #[instrument(skip(self, handler), fields(addr = ?self.endpoint.local_addr().ok()))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(RpcRequest) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = RpcResponse> + Send + 'static,
    {
        info!("QUIC server running");

        let semaphore = (self.config.max_concurrent_handlers > 0).then(|| {
            Arc::new(Semaphore::new(self.config.max_concurrent_handlers as usize))
        });

        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    },
                    None => None,
                };

                match incoming.await {
                    Ok(connection) => {
                        debug!(remote_addr = %connection.remote_address(), "accepted connection");
                        ConnectionHandler::new(connection).run(handler).await;
                    }
                    Err(e) => warn!("failed to accept connection: {}", e),
                }
            });
        }

        info!("QUIC server stopped");
        Ok(())
    }
}

/// Accepts streams on one worker connection.
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        Ok(self.connection.accept_bi().await?)
    }

    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(RpcRequest) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = RpcResponse> + Send + 'static,
    {
        loop {
            match self.accept_bi().await {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let mut stream = StreamHandler::new(send, recv);
                        if let Err(e) = stream.serve(handler).await {
                            debug!("stream ended with error: {}", e);
                        }
                    });
                }
                Err(ServerError::Connection(
                    quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::LocallyClosed
                    | quinn::ConnectionError::TimedOut,
                )) => {
                    debug!("connection closed");
                    break;
                }
                Err(e) => {
                    error!("error accepting stream: {}", e);
                    break;
                }
            }
        }
    }
}

/// One request/response exchange.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Finish the send stream (signal no more data)
    pub fn finish(&mut self) -> Result<(), ServerError> {
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))
    }

    async fn serve<H, Fut>(&mut self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(RpcRequest) -> Fut,
        Fut: Future<Output = RpcResponse>,
    {
        let frame = self.read_frame().await?;
        let reply = match frame.decode::<RpcRequest>() {
            Ok(request) => {
                debug!(service = %request.service, method = %request.method, "rpc request");
                Frame::response(&handler(request).await)?
            }
            Err(e) => {
                warn!("malformed rpc request: {}", e);
                Frame::error(&RpcError {
                    code: status::INVALID_ARGUMENT.to_string(),
                    message: format!("malformed request: {}", e),
                })?
            }
        };
        self.write_frame(&reply).await?;
        self.finish()
    }
}
