//! Tool Registry & Dispatch: `ToolDef`s plus a typed handler per
//! tool, addressed by name with optional action sub-dispatch, and a single
//! `call` entry point that performs access-control gating uniformly before
//! any handler runs — the same gate whether the caller reached dispatch via
//! HTTP or via the relay's API-key re-entry path.
//!
//! Built on the access predicate table already implemented in `access.rs`;
//! the registry's job is purely to wire `(target, access)` per declared
//! tool to that one predicate, replacing what would otherwise be scattered
//! per-endpoint ad hoc checks with one dispatch-time gate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::access::{self, Access, Scope, Target};
use crate::error::OrchError;

#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub target: Target,
    pub access: Access,
    /// `Some(valid actions)` for umbrella tools addressed by action
    /// sub-dispatch; `None` for standalone tools.
    pub actions: Option<&'static [&'static str]>,
}

/// Per-tool handler. `action` is `Some` for umbrella tools (already
/// validated against `ToolDef::actions` by the registry before this is
/// called) and `None` for standalone tools.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, action: Option<&str>, args: Value, scope: &Scope) -> Result<Value, OrchError>;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Dispatch result shape: success carries `isError: false` plus
/// optional structured `data`; failure carries `isError: true` and the
/// already-sanitized message as the sole content item.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallResult {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError")]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolCallResult {
    pub fn ok(data: Value) -> Self {
        Self { content: vec![ContentItem { kind: "text".into(), text: "ok".into() }], is_error: false, data: Some(data) }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { content: vec![ContentItem { kind: "text".into(), text: message.into() }], is_error: true, data: None }
    }

    /// Builds an error result from an `OrchError`, attaching its stable
    /// `label()` as `data.error_kind` so callers that want to branch on
    /// error kind (rather than parse `text`) don't have to.
    pub fn from_error(err: &OrchError) -> Self {
        Self {
            content: vec![ContentItem { kind: "text".into(), text: err.to_string() }],
            is_error: true,
            data: Some(serde_json::json!({ "error_kind": err.label() })),
        }
    }
}

pub struct ToolRegistry {
    entries: HashMap<&'static str, (ToolDef, Arc<dyn ToolHandler>)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn register(&mut self, def: ToolDef, handler: Arc<dyn ToolHandler>) {
        self.entries.insert(def.name, (def, handler));
    }

    pub fn defs(&self) -> Vec<ToolDef> {
        self.entries.values().map(|(def, _)| def.clone()).collect()
    }

    /// `call(name, args_as_map, auth_ctx) -> result_map`.
    pub async fn call(&self, name: &str, args: Value, scope: &Scope) -> ToolCallResult {
        let Some((def, handler)) = self.entries.get(name) else {
            return ToolCallResult::error(format!("unknown tool: {name}"));
        };

        let project_id = args.get("project_id").and_then(Value::as_str);
        if let Err(e) = access::check(scope, def.target, def.access, project_id) {
            // Access-denied calls are logged at warn; this is ordinary
            // structured logging, not an audit-log subsystem.
            tracing::warn!(
                scope = %scope,
                tool = name,
                action = args.get("action").and_then(Value::as_str).unwrap_or(""),
                project_id = project_id.unwrap_or(""),
                "access denied"
            );
            return ToolCallResult::from_error(&e);
        }

        let action = match def.actions {
            Some(valid) => match args.get("action").and_then(Value::as_str) {
                Some(a) if valid.contains(&a) => Some(a.to_string()),
                _ => {
                    return ToolCallResult::error(format!(
                        "missing or unknown action for tool {name}; valid actions: {}",
                        valid.join(", ")
                    ));
                }
            },
            None => None,
        };

        match handler.call(action.as_deref(), args, scope).await {
            Ok(value) => ToolCallResult::ok(value),
            Err(e) => ToolCallResult::from_error(&e),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
