// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost SDK - the worker side of the host protocol.
//!
//! A worker process is started by the host with its id and the event queue
//! address in the environment. It pops one event at a time, fetches the
//! trigger payload from the matching domain queue, replies where the
//! trigger expects a reply, and reports completion.
//!
//! # Example
//!
//! ```rust,ignore
//! use fnhost_sdk::{Handler, WorkerClient, run_worker};
//! use fnhost_sdk::messages::{Event, EventType};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     async fn handle(&self, client: &WorkerClient, event: &Event) -> fnhost_sdk::Result<()> {
//!         if event.kind() == Some(EventType::Http) {
//!             let request = client.http_request(&event.id).await?;
//!             client.http_write_head(&event.id, 200, &[("content-type", "text/plain")]).await?;
//!             client.http_write(&event.id, request.body).await?;
//!             client.http_end(&event.id).await?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = WorkerClient::from_env()?;
//!     run_worker(&client, &Echo).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod worker;

pub use client::WorkerClient;
pub use config::WorkerConfig;
pub use error::{Result, SdkError};
pub use worker::{Handler, WorkerSummary, run_worker};

pub use fnhost_protocol::messages;
