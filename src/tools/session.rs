//! `session` umbrella tool (spawn, message, get, list, end, events, cleanup)
//! and the standalone `caller_tool_response` tool that resolves a pending
//! caller-tool round-trip raised by a child agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::access::Scope;
use crate::error::OrchError;
use crate::session::controller::{EventsRequest, MessageRequest, SessionController, SpawnRequest};

use super::args::{opt_bool, opt_i64, opt_str, opt_str_vec, opt_u32, require_str};
use super::registry::ToolHandler;

pub struct SessionTool {
    controller: Arc<SessionController>,
}

impl SessionTool {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ToolHandler for SessionTool {
    async fn call(&self, action: Option<&str>, args: Value, scope: &Scope) -> Result<Value, OrchError> {
        match action.expect("registry validates action presence") {
            "spawn" => {
                let request = SpawnRequest {
                    project_id: opt_str(&args, "project_id"),
                    prompt: require_str(&args, "prompt")?.to_string(),
                    workspace_id: opt_str(&args, "workspace_id"),
                    create_workspace: opt_bool(&args, "create_workspace"),
                    new_session: opt_bool(&args, "new_session"),
                    model: opt_str(&args, "model"),
                    autonomy_level: opt_str(&args, "autonomy_level"),
                    reasoning_level: opt_str(&args, "reasoning_level"),
                    tools_allowed: opt_str_vec(&args, "tools_allowed"),
                    tools_disallowed: opt_str_vec(&args, "tools_disallowed"),
                    append_system_prompt: opt_str(&args, "append_system_prompt"),
                    external_id: opt_str(&args, "external_id"),
                    source: opt_str(&args, "source"),
                    inherited_parent_session_id: None,
                };
                let result = self.controller.spawn(scope, request).await?;
                Ok(json!({
                    "session_id": result.session_id,
                    "spawned": result.spawned,
                    "workspace_created": result.workspace_created,
                }))
            }
            "message" => {
                let request = MessageRequest {
                    project_id: require_str(&args, "project_id")?.to_string(),
                    message: require_str(&args, "message")?.to_string(),
                    workspace_id: opt_str(&args, "workspace_id"),
                    create_workspace: opt_bool(&args, "create_workspace"),
                };
                let result = self.controller.message(scope, request).await?;
                Ok(json!({
                    "session_id": result.session_id,
                    "spawned": result.spawned,
                    "workspace_created": result.workspace_created,
                    "last_event_index": result.last_event_index,
                }))
            }
            "get" => {
                let session_id = require_str(&args, "session_id")?;
                let session = self.controller.get(session_id).await?;
                Ok(serde_json::to_value(session).unwrap_or(Value::Null))
            }
            "list" => {
                let project_id = require_str(&args, "project_id")?;
                let sessions = self.controller.list(project_id).await?;
                Ok(json!({ "sessions": sessions }))
            }
            "end" => {
                let session_id = require_str(&args, "session_id")?;
                let project_id = require_str(&args, "project_id")?;
                self.controller.end(scope, session_id, project_id).await?;
                Ok(json!({ "ended": session_id }))
            }
            "events" => {
                let request = EventsRequest {
                    session_id: require_str(&args, "session_id")?.to_string(),
                    since_index: opt_i64(&args, "since_index").unwrap_or(0),
                    max_events: opt_u32(&args, "max_events").map(|n| n as usize),
                    include_children: opt_bool(&args, "include_children"),
                };
                let result = self.controller.events(request).await?;
                Ok(serde_json::to_value(result).unwrap_or(Value::Null))
            }
            "cleanup" => {
                let project_id = require_str(&args, "project_id")?;
                let max_age_secs = opt_i64(&args, "max_age_secs").unwrap_or(86_400);
                let cleaned = self.controller.cleanup(project_id, max_age_secs).await?;
                Ok(json!({ "cleaned": cleaned }))
            }
            other => Err(OrchError::UnknownAction {
                action: other.to_string(),
                valid: "spawn, message, get, list, end, events, cleanup".to_string(),
            }),
        }
    }
}

/// Resolves a pending caller-tool request raised via `caller_tool_request`
/// (step 4): the external caller calls this tool once it has
/// produced a result for the child agent's tool call.
pub struct CallerToolResponseTool {
    controller: Arc<SessionController>,
}

impl CallerToolResponseTool {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ToolHandler for CallerToolResponseTool {
    async fn call(&self, _action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        let session_id = require_str(&args, "session_id")?;
        let request_id = require_str(&args, "request_id")?;
        let response = args.get("response").cloned().unwrap_or(Value::Null);

        let active = self
            .controller
            .active_manager()
            .get(session_id)
            .await
            .ok_or_else(|| OrchError::NotFound { kind: "session", id: session_id.to_string() })?;

        let resolved = active.resolve_caller_request(request_id, response).await;
        if !resolved {
            return Err(OrchError::NotFound { kind: "caller_tool_request", id: request_id.to_string() });
        }
        Ok(json!({ "resolved": request_id }))
    }
}
