// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process runner.
//!
//! Each worker is a child process of the host. Output is inherited so worker
//! logs land next to the host's.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::traits::*;

pub struct ProcessRunner {
    binary: PathBuf,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
        }
    }

    /// Arguments passed to every worker.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn signal(&self, handle: &WorkerHandle, sig: Signal) -> Result<()> {
        let Some(pid) = handle.pid else {
            return Ok(());
        };
        let raw = i32::try_from(pid)
            .map_err(|_| RunnerError::Other(format!("pid {} out of range", pid)))?;

        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) => {
                debug!(worker_id = %handle.worker_id, pid, signal = ?sig, "Signal sent");
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!(worker_id = %handle.worker_id, pid, "Process already dead (ESRCH)");
                Ok(())
            }
            Err(errno) => Err(RunnerError::Signal { pid, errno }),
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn spawn(
        &self,
        spec: &WorkerSpec,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<WorkerHandle> {
        // Bare names are resolved through PATH by the OS.
        if self.binary.components().count() > 1 && !self.binary.exists() {
            return Err(RunnerError::BinaryNotFound(
                self.binary.display().to_string(),
            ));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .envs(spec.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::StartFailed(format!("{}: {}", self.binary.display(), e)))?;
        let pid = child.id();

        let worker_id = spec.worker_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Failed to wait for worker");
                    None
                }
            };
            debug!(worker_id = %worker_id, code = ?code, "Worker exited");
            let _ = exits.send(WorkerExit { worker_id, code });
        });

        info!(worker_id = %spec.worker_id, pid = ?pid, "Worker spawned");

        Ok(WorkerHandle {
            worker_id: spec.worker_id.clone(),
            pid,
            started_at: chrono::Utc::now(),
        })
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<()> {
        self.signal(handle, Signal::SIGTERM)
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        self.signal(handle, Signal::SIGKILL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn spec(worker_id: &str) -> WorkerSpec {
        WorkerSpec {
            worker_id: worker_id.into(),
            server_addr: "127.0.0.1:7400".parse().unwrap(),
            entrypoint: "index".into(),
            runtime: "test".into(),
            skip_cert_verification: true,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let runner = ProcessRunner::new("/nonexistent/fnhost-worker");
        let (exits, _rx) = mpsc::unbounded_channel();

        let err = runner.spawn(&spec("w-1"), exits).await.unwrap_err();
        assert!(matches!(err, RunnerError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_exit_is_reported() {
        let runner = ProcessRunner::new("/bin/sh").with_args(["-c", "exit 3"]);
        let (exits, mut rx) = mpsc::unbounded_channel();

        let handle = runner.spawn(&spec("w-1"), exits).await.unwrap();
        assert!(handle.pid.is_some());

        let exit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            exit,
            WorkerExit {
                worker_id: "w-1".into(),
                code: Some(3)
            }
        );
    }

    #[tokio::test]
    async fn test_worker_sees_contract_env() {
        let runner = ProcessRunner::new("/bin/sh")
            .with_args(["-c", r#"test "$FNHOST_WORKER_ID" = "w-env" && exit 0 || exit 1"#]);
        let (exits, mut rx) = mpsc::unbounded_channel();

        runner.spawn(&spec("w-env"), exits).await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test]
    async fn test_terminate_stops_worker() {
        let runner = ProcessRunner::new("/bin/sh").with_args(["-c", "sleep 30"]);
        let (exits, mut rx) = mpsc::unbounded_channel();

        let handle = runner.spawn(&spec("w-1"), exits).await.unwrap();
        runner.terminate(&handle).await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, None);

        // Signalling a dead process is not an error.
        runner.kill(&handle).await.unwrap();
    }
}
