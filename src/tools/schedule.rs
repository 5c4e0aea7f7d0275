//! `schedule` umbrella tool: create, list, get, update, delete, trigger,
//! history.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::access::Scope;
use crate::error::OrchError;
use crate::schedule::{NewSchedule, OverlapBehavior, ScheduleRunner, SessionBehavior, Target};

use super::args::require_str;
use super::registry::ToolHandler;

fn parse_overlap_behavior(s: &str) -> Result<OverlapBehavior, OrchError> {
    match s {
        "skip" => Ok(OverlapBehavior::Skip),
        "queue" => Ok(OverlapBehavior::Queue),
        other => Err(OrchError::InvalidParameter(format!("overlap_behavior must be 'skip' or 'queue', got {other:?}"))),
    }
}

fn parse_session_behavior(s: &str) -> Result<SessionBehavior, OrchError> {
    match s {
        "resume" => Ok(SessionBehavior::Resume),
        "new" => Ok(SessionBehavior::New),
        other => Err(OrchError::InvalidParameter(format!("session_behavior must be 'resume' or 'new', got {other:?}"))),
    }
}

fn parse_targets(args: &Value) -> Result<Vec<Target>, OrchError> {
    let raw = args
        .get("targets")
        .and_then(Value::as_array)
        .ok_or_else(|| OrchError::MissingParameter("targets".to_string()))?;
    if raw.is_empty() {
        return Err(OrchError::InvalidParameter("targets must not be empty".to_string()));
    }
    raw.iter()
        .map(|t| {
            let project_id = t
                .get("project_id")
                .and_then(Value::as_str)
                .ok_or_else(|| OrchError::MissingParameter("targets[].project_id".to_string()))?;
            let workspace_id = t.get("workspace_id").and_then(Value::as_str).map(str::to_string);
            Ok(Target::new(project_id, workspace_id))
        })
        .collect()
}

pub struct ScheduleTool {
    runner: Arc<ScheduleRunner>,
}

impl ScheduleTool {
    pub fn new(runner: Arc<ScheduleRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ToolHandler for ScheduleTool {
    async fn call(&self, action: Option<&str>, args: Value, scope: &Scope) -> Result<Value, OrchError> {
        let store = self.runner.store();
        match action.expect("registry validates action presence") {
            "create" => {
                let new_schedule = NewSchedule {
                    name: require_str(&args, "name")?.to_string(),
                    cron_expr: require_str(&args, "cron_expr")?.to_string(),
                    prompt: require_str(&args, "prompt")?.to_string(),
                    targets: parse_targets(&args)?,
                    enabled: args.get("enabled").and_then(Value::as_bool).unwrap_or(true),
                    overlap_behavior: parse_overlap_behavior(require_str(&args, "overlap_behavior")?)?,
                    session_behavior: parse_session_behavior(require_str(&args, "session_behavior")?)?,
                    creator_token_id: args.get("creator_token_id").and_then(Value::as_str).unwrap_or("").to_string(),
                    creator_scope: scope.to_string(),
                };
                let schedule =
                    store.create(new_schedule).await.map_err(|e| OrchError::from_external("schedule create", &e))?;
                Ok(serde_json::to_value(schedule).unwrap_or(Value::Null))
            }
            "list" => {
                let schedules = store.list().await.map_err(|e| OrchError::from_external("schedule list", &e))?;
                Ok(json!({ "schedules": schedules }))
            }
            "get" => {
                let id = require_str(&args, "id")?;
                let schedule = store
                    .get(id)
                    .await
                    .map_err(|e| OrchError::from_external("schedule get", &e))?
                    .ok_or_else(|| OrchError::NotFound { kind: "schedule", id: id.to_string() })?;
                Ok(serde_json::to_value(schedule).unwrap_or(Value::Null))
            }
            "update" => {
                let id = require_str(&args, "id")?;
                if store.get(id).await.map_err(|e| OrchError::from_external("schedule update", &e))?.is_none() {
                    return Err(OrchError::NotFound { kind: "schedule", id: id.to_string() });
                }
                if let Some(enabled) = args.get("enabled").and_then(Value::as_bool) {
                    store.set_enabled(id, enabled).await.map_err(|e| OrchError::from_external("schedule update", &e))?;
                }
                let schedule = store
                    .get(id)
                    .await
                    .map_err(|e| OrchError::from_external("schedule update", &e))?
                    .ok_or_else(|| OrchError::NotFound { kind: "schedule", id: id.to_string() })?;
                Ok(serde_json::to_value(schedule).unwrap_or(Value::Null))
            }
            "delete" => {
                let id = require_str(&args, "id")?;
                store.delete(id).await.map_err(|e| OrchError::from_external("schedule delete", &e))?;
                Ok(json!({ "deleted": id }))
            }
            "trigger" => {
                let id = require_str(&args, "id")?;
                self.runner.trigger(id).await.map_err(|e| OrchError::from_external("schedule trigger", &e))?;
                Ok(json!({ "triggered": id }))
            }
            "history" => {
                let id = require_str(&args, "id")?;
                let executions =
                    store.list_executions(id).await.map_err(|e| OrchError::from_external("schedule history", &e))?;
                Ok(json!({ "executions": executions }))
            }
            other => Err(OrchError::UnknownAction {
                action: other.to_string(),
                valid: "create, list, get, update, delete, trigger, history".to_string(),
            }),
        }
    }
}
