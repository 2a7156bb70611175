// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost protocol - QUIC + Protobuf layer between the host and its workers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    fnhost-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC: RpcRequest{service, method, payload} -> RpcResponse   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), one bidirectional stream per call │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All queue services share one endpoint. A worker first asks the
//! `EventQueue` service which event it should run, then fetches the trigger
//! payload from the domain service for that event type:
//!
//! ```ignore
//! use fnhost_protocol::{RpcClient, messages, rpc::{methods, services}};
//!
//! let client = RpcClient::localhost("127.0.0.1:7400".parse()?)?;
//! let event: messages::Event = client
//!     .call(services::EVENT_QUEUE, methods::POP, &messages::WorkerPopRequest { id: worker_id })
//!     .await?;
//! let change: messages::Change = client
//!     .call(services::DATABASE_QUEUE, methods::POP, &messages::Pop { id: event.id.clone() })
//!     .await?;
//! ```

pub mod client;
pub mod frame;
pub mod messages;
pub mod rpc;
pub mod server;

pub use client::{ClientError, RpcClient, RpcClientConfig};
pub use frame::{Frame, FrameError, FrameKind};
pub use rpc::{RpcError, RpcRequest, RpcResponse};
pub use server::{ConnectionHandler, RpcServer, RpcServerConfig, ServerError, StreamHandler};
