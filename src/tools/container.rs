//! `container` umbrella tool (start, stop, logs, exec) and the standalone
//! `container_refresh` tool.
//!
//! `exec` calls are gated behind a [`CircuitBreaker`] keyed by container
//! name: a container whose daemon is wedged should fail fast for the rest
//! of a burst of tool calls instead of each one paying a full timeout.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::access::Scope;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::container::ContainerRuntime;
use crate::error::OrchError;

use super::args::{opt_str, opt_u64, require_str};
use super::registry::ToolHandler;

fn container_name(project_id: &str, workspace_id: &str) -> String {
    format!("{project_id}-{workspace_id}")
}

pub struct ContainerTool {
    containers: Arc<dyn ContainerRuntime>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl ContainerTool {
    pub fn new(containers: Arc<dyn ContainerRuntime>) -> Self {
        Self { containers, breakers: Mutex::new(HashMap::new()) }
    }

    async fn breaker_for(&self, name: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(format!("container:{name}"), CircuitBreakerConfig::default()))
            .clone()
    }
}

#[async_trait]
impl ToolHandler for ContainerTool {
    async fn call(&self, action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        let project_id = require_str(&args, "project_id")?;
        let workspace_id = opt_str(&args, "workspace_id").unwrap_or_else(|| "default".into());
        let name = container_name(project_id, &workspace_id);

        match action.expect("registry validates action presence") {
            "start" => {
                self.containers.start(&name).await.map_err(|e| OrchError::from_external("container start", &e))?;
                Ok(json!({ "started": name }))
            }
            "stop" => {
                self.containers.stop(&name).await.map_err(|e| OrchError::from_external("container stop", &e))?;
                Ok(json!({ "stopped": name }))
            }
            "logs" => {
                let tail = opt_u64(&args, "tail").unwrap_or(200) as usize;
                let logs =
                    self.containers.logs(&name, tail).await.map_err(|e| OrchError::from_external("container logs", &e))?;
                Ok(json!({ "logs": logs }))
            }
            "exec" => {
                let cmd: Vec<String> = args
                    .get("cmd")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .filter(|v: &Vec<String>| !v.is_empty())
                    .ok_or_else(|| OrchError::MissingParameter("cmd".to_string()))?;
                let cwd = opt_str(&args, "cwd").unwrap_or_else(|| "/workspace".into());

                let breaker = self.breaker_for(&name).await;
                if !breaker.is_allowed().await {
                    return Err(OrchError::Internal(format!("container {name} is temporarily unavailable")));
                }
                match self.containers.exec(&name, &cmd, &cwd).await {
                    Ok(output) => {
                        breaker.record_success().await;
                        Ok(json!({
                            "stdout": output.stdout,
                            "stderr": output.stderr,
                            "exit_code": output.exit_code,
                        }))
                    }
                    Err(e) => {
                        breaker.record_failure().await;
                        Err(OrchError::from_external("container exec", &e))
                    }
                }
            }
            other => Err(OrchError::UnknownAction { action: other.to_string(), valid: "start, stop, logs, exec".to_string() }),
        }
    }
}

/// Standalone tool: pulls a fresh image without touching any running
/// container (— a refresh never restarts what's already up; the
/// new image takes effect the next time a workspace's container is
/// (re)created).
pub struct ContainerRefreshTool {
    containers: Arc<dyn ContainerRuntime>,
}

impl ContainerRefreshTool {
    pub fn new(containers: Arc<dyn ContainerRuntime>) -> Self {
        Self { containers }
    }
}

#[async_trait]
impl ToolHandler for ContainerRefreshTool {
    async fn call(&self, _action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        let image = require_str(&args, "image")?;
        self.containers.pull(image).await.map_err(|e| OrchError::from_external("container refresh", &e))?;
        Ok(json!({ "pulled": image }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, ExecOutput};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyRuntime {
        exec_failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl ContainerRuntime for FlakyRuntime {
        async fn create(&self, _config: ContainerConfig) -> anyhow::Result<()> {
            Ok(())
        }
        async fn start(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn remove(&self, _name: &str, _force: bool) -> anyhow::Result<()> {
            Ok(())
        }
        async fn status(&self, _name: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn exec(&self, _name: &str, _cmd: &[String], _cwd: &str) -> anyhow::Result<ExecOutput> {
            if self.exec_failures_remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            }).is_ok()
            {
                anyhow::bail!("daemon wedged");
            }
            Ok(ExecOutput { stdout: "ok".into(), stderr: String::new(), exit_code: 0 })
        }
        async fn logs(&self, _name: &str, _tail: usize) -> anyhow::Result<String> {
            Ok("log line".into())
        }
        async fn image_exists(&self, _image: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn pull(&self, _image: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn args(project_id: &str) -> Value {
        json!({ "project_id": project_id, "cmd": ["echo", "hi"] })
    }

    #[tokio::test]
    async fn exec_reports_stdout_on_success() {
        let tool = ContainerTool::new(Arc::new(FlakyRuntime { exec_failures_remaining: AtomicU32::new(0) }));
        let result = tool.call(Some("exec"), args("P1"), &Scope::Admin).await.unwrap();
        assert_eq!(result["stdout"], "ok");
    }

    #[tokio::test]
    async fn exec_failures_trip_the_breaker_and_fail_fast() {
        let tool = ContainerTool::new(Arc::new(FlakyRuntime { exec_failures_remaining: AtomicU32::new(10) }));
        for _ in 0..5 {
            assert!(tool.call(Some("exec"), args("P1"), &Scope::Admin).await.is_err());
        }
        // Breaker now open: the 6th call must fail without calling exec again
        // (still one of the 10 configured failures remaining either way, so
        // the only way this assertion distinguishes "fast fail" from "normal
        // failure" is the error message).
        let err = tool.call(Some("exec"), args("P1"), &Scope::Admin).await.unwrap_err();
        assert!(err.to_string().contains("temporarily unavailable"));
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let tool = ContainerTool::new(Arc::new(FlakyRuntime { exec_failures_remaining: AtomicU32::new(0) }));
        let result = tool.call(Some("bogus"), args("P1"), &Scope::Admin).await;
        assert!(matches!(result, Err(OrchError::UnknownAction { .. })));
    }

    #[tokio::test]
    async fn refresh_pulls_without_starting_or_stopping() {
        let tool = ContainerRefreshTool::new(Arc::new(FlakyRuntime { exec_failures_remaining: AtomicU32::new(0) }));
        let result = tool.call(None, json!({ "image": "ghcr.io/example/agent:latest" }), &Scope::Admin).await.unwrap();
        assert_eq!(result["pulled"], "ghcr.io/example/agent:latest");
    }
}
