//! Cross-module scenario: a project-scoped token calling into a sibling
//! project is refused before the handler ever runs.
//!
//! Reproduces spec scenario 6: token scope `project:A` calling
//! `project.get` for `project_id: "B"` is denied and project B's data is
//! never touched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use oubliette::access::{Access, Scope, Target};
use oubliette::error::OrchError;
use oubliette::tools::registry::{ToolDef, ToolHandler, ToolRegistry};

struct RecordingHandler {
    called: Arc<AtomicBool>,
}

#[async_trait]
impl ToolHandler for RecordingHandler {
    async fn call(&self, _action: Option<&str>, _args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        self.called.store(true, Ordering::SeqCst);
        Ok(serde_json::json!({"id": "B"}))
    }
}

#[tokio::test]
async fn cross_project_access_is_denied_without_touching_the_handler() {
    let called = Arc::new(AtomicBool::new(false));
    let mut registry = ToolRegistry::new();
    registry.register(
        ToolDef {
            name: "project",
            description: "project management",
            target: Target::Project,
            access: Access::Read,
            actions: Some(&["get"]),
        },
        Arc::new(RecordingHandler { called: called.clone() }),
    );

    let scope = Scope::Project("A".into());
    let result = registry
        .call("project", serde_json::json!({"project_id": "B", "action": "get"}), &scope)
        .await;

    assert!(result.is_error);
    assert!(!called.load(Ordering::SeqCst), "handler must not run for a denied call");
    assert_eq!(
        result.data.as_ref().and_then(|d| d.get("error_kind")).and_then(Value::as_str),
        Some("access_denied")
    );
    assert_eq!(result.content[0].text, "access denied");
}
