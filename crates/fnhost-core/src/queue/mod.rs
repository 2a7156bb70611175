// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-domain queues holding trigger payloads until a worker pops them.
//!
//! | Queue | Methods |
//! |-------|---------|
//! | [`DatabaseQueue`] | `pop` |
//! | [`RabbitMqQueue`] | `pop` |
//! | [`HttpQueue`] | `pop`, `writeHead`, `write`, `end` |
//! | [`FirehoseQueue`] | `pop`, `send`, `sendAll` |
//! | [`AgentToolQueue`] | `pop`, `respond` |
//! | [`GrpcQueue`] | `pop`, `respond` |

mod agent_tool;
mod bridge;
mod database;
mod firehose;
mod grpc;
mod http;
mod mailbox;
mod rabbitmq;

pub use agent_tool::{AgentToolQueue, tool_outcome};
pub use bridge::Bridge;
pub use database::DatabaseQueue;
pub use firehose::{FirehoseQueue, Outbound};
pub use grpc::GrpcQueue;
pub use http::{HttpQueue, ResponsePart, ResponseReceiver};
pub use mailbox::Mailbox;
pub use rabbitmq::RabbitMqQueue;
