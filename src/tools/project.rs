//! `project` umbrella tool (create, list, get, delete, options) and the
//! standalone `project_changes`/`project_tasks` tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::access::Scope;
use crate::error::OrchError;
use crate::project::{NewProject, ProjectRegistry};

use super::args::{opt_str, opt_str_vec, require_str};
use super::registry::ToolHandler;

pub struct ProjectTool {
    projects: Arc<dyn ProjectRegistry>,
}

impl ProjectTool {
    pub fn new(projects: Arc<dyn ProjectRegistry>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for ProjectTool {
    async fn call(&self, action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        match action.expect("registry validates action presence") {
            "create" => {
                let new_project = NewProject {
                    id: require_str(&args, "id")?.to_string(),
                    display_name: require_str(&args, "display_name")?.to_string(),
                    container_image: require_str(&args, "container_image")?.to_string(),
                    default_workspace_id: opt_str(&args, "default_workspace_id").unwrap_or_else(|| "default".into()),
                    workspace_isolation: args.get("workspace_isolation").and_then(Value::as_bool).unwrap_or(false),
                    protected_paths: opt_str_vec(&args, "protected_paths").unwrap_or_default(),
                    recursion_config: Default::default(),
                    model_hint: opt_str(&args, "model_hint"),
                    credential_refs: opt_str_vec(&args, "credential_refs").unwrap_or_default(),
                };
                let project = self
                    .projects
                    .create(new_project)
                    .await
                    .map_err(|e| OrchError::from_external("project create", &e))?;
                Ok(serde_json::to_value(project).unwrap_or(Value::Null))
            }
            "list" => {
                let projects = self.projects.list().await.map_err(|e| OrchError::from_external("project list", &e))?;
                Ok(json!({ "projects": projects }))
            }
            "get" => {
                let id = require_str(&args, "id")?;
                let project = self
                    .projects
                    .get(id)
                    .await
                    .map_err(|e| OrchError::from_external("project get", &e))?
                    .ok_or_else(|| OrchError::NotFound { kind: "project", id: id.to_string() })?;
                Ok(serde_json::to_value(project).unwrap_or(Value::Null))
            }
            "delete" => {
                let id = require_str(&args, "id")?;
                self.projects.delete(id).await.map_err(|e| OrchError::from_external("project delete", &e))?;
                Ok(json!({ "deleted": id }))
            }
            "options" => {
                let options = self.projects.options().await.map_err(|e| OrchError::from_external("project options", &e))?;
                Ok(serde_json::to_value(options).unwrap_or(Value::Null))
            }
            other => Err(OrchError::UnknownAction {
                action: other.to_string(),
                valid: "create, list, get, delete, options".to_string(),
            }),
        }
    }
}

pub struct ProjectChangesTool {
    projects: Arc<dyn ProjectRegistry>,
}

impl ProjectChangesTool {
    pub fn new(projects: Arc<dyn ProjectRegistry>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for ProjectChangesTool {
    async fn call(&self, _action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        let project_id = require_str(&args, "project_id")?;
        let changes = self
            .projects
            .changes(project_id)
            .await
            .map_err(|e| OrchError::from_external("project changes", &e))?;
        Ok(json!({ "changes": changes }))
    }
}

pub struct ProjectTasksTool {
    projects: Arc<dyn ProjectRegistry>,
}

impl ProjectTasksTool {
    pub fn new(projects: Arc<dyn ProjectRegistry>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for ProjectTasksTool {
    async fn call(&self, _action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        let project_id = require_str(&args, "project_id")?;
        let tasks = self
            .projects
            .tasks(project_id)
            .await
            .map_err(|e| OrchError::from_external("project tasks", &e))?;
        Ok(json!({ "tasks": tasks }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::InMemoryProjectRegistry;

    fn tool() -> ProjectTool {
        ProjectTool::new(Arc::new(InMemoryProjectRegistry::new()))
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let tool = tool();
        let create_args = json!({
            "id": "P1",
            "display_name": "Sample",
            "container_image": "oubliette/sandbox:latest",
        });
        tool.call(Some("create"), create_args, &Scope::Admin).await.unwrap();

        let got = tool.call(Some("get"), json!({"id": "P1"}), &Scope::Admin).await.unwrap();
        assert_eq!(got["id"], "P1");
        assert_eq!(got["default_workspace_id"], "default");
    }

    #[tokio::test]
    async fn get_unknown_project_is_not_found() {
        let tool = tool();
        let err = tool.call(Some("get"), json!({"id": "nope"}), &Scope::Admin).await.unwrap_err();
        assert!(matches!(err, OrchError::NotFound { kind: "project", .. }));
    }

    #[tokio::test]
    async fn delete_then_list_is_empty() {
        let tool = tool();
        tool.call(
            Some("create"),
            json!({"id": "P1", "display_name": "Sample", "container_image": "img"}),
            &Scope::Admin,
        )
        .await
        .unwrap();
        tool.call(Some("delete"), json!({"id": "P1"}), &Scope::Admin).await.unwrap();
        let listed = tool.call(Some("list"), json!({}), &Scope::Admin).await.unwrap();
        assert!(listed["projects"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_action_lists_valid_actions() {
        let tool = tool();
        let err = tool.call(Some("frobnicate"), json!({}), &Scope::Admin).await.unwrap_err();
        match err {
            OrchError::UnknownAction { action, valid } => {
                assert_eq!(action, "frobnicate");
                assert!(valid.contains("create"));
            }
            _ => panic!("expected UnknownAction"),
        }
    }
}
