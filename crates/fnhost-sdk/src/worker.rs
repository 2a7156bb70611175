// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The worker main loop: pop, handle, complete, until the host says stop.

use async_trait::async_trait;
use fnhost_protocol::messages::Event;
use tracing::{info, warn};

use crate::client::WorkerClient;
use crate::error::{Result, SdkError};

/// Runs one event. The payload, if any, is fetched through `client`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, client: &WorkerClient, event: &Event) -> Result<()>;
}

/// Totals for one worker lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub succeeded: u64,
    pub failed: u64,
    /// Completions the host no longer wanted (the event had timed out).
    pub rejected: u64,
}

/// Serve events until the host has no next event for this worker.
///
/// Handler errors are reported as failed completions, transport errors end
/// the loop.
pub async fn run_worker<H: Handler + ?Sized>(
    client: &WorkerClient,
    handler: &H,
) -> Result<WorkerSummary> {
    info!(
        worker_id = %client.worker_id(),
        entrypoint = %client.config().entrypoint,
        runtime = %client.config().runtime,
        "Worker started"
    );
    let mut summary = WorkerSummary::default();

    loop {
        let event = match client.pop_event().await {
            Ok(event) => event,
            Err(SdkError::NoNextEvent(_)) => {
                info!(worker_id = %client.worker_id(), ?summary, "No next event, worker exiting");
                return Ok(summary);
            }
            Err(e) => return Err(e),
        };

        let succeeded = match handler.handle(client, &event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(event_id = %event.id, target = %event.target_id(), error = %e, "Handler failed");
                false
            }
        };

        if client.complete(&event.id, succeeded).await? {
            if succeeded {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        } else {
            warn!(event_id = %event.id, "Host rejected completion, event already settled");
            summary.rejected += 1;
        }
    }
}
