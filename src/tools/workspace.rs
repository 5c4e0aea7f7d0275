//! `workspace` umbrella tool (list, delete) and the standalone
//! `config_limits` tool, which reports a project's recursion limits plus
//! the orchestrator's session limits so a client can pre-flight a spawn.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::access::Scope;
use crate::error::OrchError;
use crate::project::ProjectRegistry;
use crate::session::controller::SessionController;

use super::args::require_str;
use super::registry::ToolHandler;

pub struct WorkspaceTool {
    controller: Arc<SessionController>,
}

impl WorkspaceTool {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ToolHandler for WorkspaceTool {
    async fn call(&self, action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        let project_id = require_str(&args, "project_id")?;
        match action.expect("registry validates action presence") {
            "list" => {
                let workspaces = self
                    .controller
                    .workspaces()
                    .list(project_id)
                    .await
                    .map_err(|e| OrchError::from_external("workspace list", &e))?;
                Ok(json!({ "workspaces": workspaces }))
            }
            "delete" => {
                let workspace_id = require_str(&args, "workspace_id")?;
                self.controller
                    .workspaces()
                    .delete(self.controller.sessions(), project_id, workspace_id)
                    .await?;
                Ok(json!({ "deleted": workspace_id }))
            }
            other => {
                Err(OrchError::UnknownAction { action: other.to_string(), valid: "list, delete".to_string() })
            }
        }
    }
}

/// Standalone tool: a project's recursion limits plus the orchestrator's
/// own session ceilings, so a client can pre-flight a spawn.
pub struct ConfigLimitsTool {
    projects: Arc<dyn ProjectRegistry>,
    max_active_sessions: usize,
    idle_timeout_secs: u64,
}

impl ConfigLimitsTool {
    pub fn new(projects: Arc<dyn ProjectRegistry>, max_active_sessions: usize, idle_timeout_secs: u64) -> Self {
        Self { projects, max_active_sessions, idle_timeout_secs }
    }
}

#[async_trait]
impl ToolHandler for ConfigLimitsTool {
    async fn call(&self, _action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        let project_id = require_str(&args, "project_id")?;
        let project = self
            .projects
            .get(project_id)
            .await
            .map_err(|e| OrchError::from_external("config_limits", &e))?
            .ok_or_else(|| OrchError::NotFound { kind: "project", id: project_id.to_string() })?;
        Ok(json!({
            "max_depth": project.recursion_config.max_depth,
            "max_agents": project.recursion_config.max_agents,
            "max_cost": project.recursion_config.max_cost,
            "max_active_sessions": self.max_active_sessions,
            "idle_timeout_secs": self.idle_timeout_secs,
        }))
    }
}
