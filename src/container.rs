//! `ContainerRuntime` capability trait.
//!
//! The container runtime (create/start/stop/exec/pull/status) is a
//! pluggable external capability, not implemented here. This module
//! defines the trait boundary the Session Controller and Schedule Runner
//! call through, plus a couple of small helpers (bounded wait for the
//! relay socket to appear, retrying `ping`) built on `retry::retry_with_backoff`
//! so cancellable bounded waits follow the same idiom as the rest of the
//! crate instead of each call site hand-rolling a sleep loop.

use async_trait::async_trait;
use std::time::Duration;

use crate::retry::{retry_with_backoff, RetryConfig};

/// Result of a container `exec` call.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Bind-mount configuration the orchestrator asks the container runtime to
/// honor when creating a project's container ("Mount model").
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    /// host_path -> container_path
    pub mounts: Vec<(String, String)>,
    /// Host path of the per-project relay socket, mounted into the
    /// container at `/<container>/relay.sock`.
    pub relay_socket_host_path: String,
}

/// External capability: container lifecycle management.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, config: ContainerConfig) -> anyhow::Result<()>;
    async fn start(&self, name: &str) -> anyhow::Result<()>;
    async fn stop(&self, name: &str) -> anyhow::Result<()>;
    async fn remove(&self, name: &str, force: bool) -> anyhow::Result<()>;
    /// Returns `true` if the container is currently running.
    async fn status(&self, name: &str) -> anyhow::Result<bool>;
    async fn exec(&self, name: &str, cmd: &[String], cwd: &str) -> anyhow::Result<ExecOutput>;
    async fn logs(&self, name: &str, tail: usize) -> anyhow::Result<String>;
    async fn image_exists(&self, image: &str) -> anyhow::Result<bool>;
    async fn pull(&self, image: &str) -> anyhow::Result<()>;
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Ensure `name`'s container is running, starting it if it is not. The
/// start call is retried with backoff — container daemons routinely fail a
/// first start attempt while an image layer is still settling.
/// Used by the Session Controller before spawning or resuming an executor.
pub async fn ensure_running(runtime: &dyn ContainerRuntime, name: &str) -> anyhow::Result<()> {
    if runtime.status(name).await? {
        return Ok(());
    }
    retry_with_backoff(&RetryConfig::default(), || runtime.start(name)).await
}

/// Wait (bounded) for a path to appear on disk, polling every 100ms.
/// Used before dialing the per-project relay socket.
pub async fn wait_for_path(path: &std::path::Path, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if path.exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {} to appear", path.display());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
