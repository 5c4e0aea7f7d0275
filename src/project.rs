//! `Project` data type and the `ProjectRegistry` capability trait.
//!
//! Project metadata, credential references, and the model registry are
//! external collaborators owned elsewhere. This module only defines the
//! read-only shape the core depends on and the trait boundary it calls
//! through, the same way the agent runtime process is isolated behind a
//! trait in `agent_runtime.rs`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Recursive-spawn limits carried by a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecursionConfig {
    pub max_depth: u32,
    pub max_agents: u32,
    pub max_cost: f64,
}

impl Default for RecursionConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_agents: 16,
            max_cost: 25.0,
        }
    }
}

/// Immutable project metadata. Owned by an external store; the
/// core only ever reads it through `ProjectRegistry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub display_name: String,
    pub container_image: String,
    pub default_workspace_id: String,
    pub workspace_isolation: bool,
    pub protected_paths: Vec<String>,
    pub recursion_config: RecursionConfig,
    pub model_hint: Option<String>,
    /// Opaque references into the external credential registry — the core
    /// never reads credential *values*, only checks that at least one
    /// reference is present.
    pub credential_refs: Vec<String>,
}

impl Project {
    pub fn has_credentials(&self) -> bool {
        !self.credential_refs.is_empty()
    }
}

/// Fields accepted by `project create`/`project update`-shaped requests
/// (`project: create, list, get, delete, options`, target=global,
/// access=write). Optional fields default the same way `Project`'s own
/// defaults do; `id` is caller-supplied since projects are addressed by a
/// stable external identifier, not a generated one.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub id: String,
    pub display_name: String,
    pub container_image: String,
    pub default_workspace_id: String,
    #[serde(default)]
    pub workspace_isolation: bool,
    #[serde(default)]
    pub protected_paths: Vec<String>,
    #[serde(default)]
    pub recursion_config: RecursionConfig,
    #[serde(default)]
    pub model_hint: Option<String>,
    #[serde(default)]
    pub credential_refs: Vec<String>,
}

/// Options catalog returned by `project options` — enumerable
/// choices a caller can pick from when creating or updating a project.
/// A thin passthrough, the same shape as `project_list`'s "minimal
/// passthrough for enumeration".
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectOptions {
    pub container_images: Vec<String>,
    pub model_hints: Vec<String>,
}

/// A single recorded change against a project's workspace tree, as
/// surfaced by the standalone `project_changes` tool. The core never
/// inspects the contents of a change — this is a thin passthrough to
/// whatever owns the workspace tree, analogous to `project_list`'s
/// enumeration passthrough.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectChange {
    pub path: String,
    pub kind: String,
}

/// A single outstanding task surfaced by the standalone `project_tasks`
/// tool. Opaque to the core.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectTask {
    pub id: String,
    pub title: String,
    pub status: String,
}

/// External capability: project metadata lookup and management.
/// Implemented by whatever owns the on-disk project store (out of scope
/// for this crate); the core depends only on this trait.
///
/// `changes` and `tasks` back the standalone `project_changes`/
/// `project_tasks` tools, which stay undetailed beyond their
/// `(target, access)` declaration — they default to empty so a host that
/// has nothing to report does not need to implement them.
#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    async fn get(&self, project_id: &str) -> anyhow::Result<Option<Project>>;

    async fn list(&self) -> anyhow::Result<Vec<Project>>;

    async fn create(&self, new_project: NewProject) -> anyhow::Result<Project>;

    async fn delete(&self, project_id: &str) -> anyhow::Result<()>;

    async fn options(&self) -> anyhow::Result<ProjectOptions> {
        Ok(ProjectOptions::default())
    }

    async fn changes(&self, _project_id: &str) -> anyhow::Result<Vec<ProjectChange>> {
        Ok(Vec::new())
    }

    async fn tasks(&self, _project_id: &str) -> anyhow::Result<Vec<ProjectTask>> {
        Ok(Vec::new())
    }
}

/// A simple in-memory `ProjectRegistry`, useful for tests and for embedding
/// this crate in a host that has not yet wired a real store.
#[derive(Default)]
pub struct InMemoryProjectRegistry {
    projects: tokio::sync::RwLock<std::collections::HashMap<String, Project>>,
}

impl InMemoryProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, project: Project) {
        self.projects.write().await.insert(project.id.clone(), project);
    }
}

#[async_trait]
impl ProjectRegistry for InMemoryProjectRegistry {
    async fn get(&self, project_id: &str) -> anyhow::Result<Option<Project>> {
        Ok(self.projects.read().await.get(project_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<Project>> {
        let mut projects: Vec<Project> = self.projects.read().await.values().cloned().collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn create(&self, new_project: NewProject) -> anyhow::Result<Project> {
        let project = Project {
            id: new_project.id,
            display_name: new_project.display_name,
            container_image: new_project.container_image,
            default_workspace_id: new_project.default_workspace_id,
            workspace_isolation: new_project.workspace_isolation,
            protected_paths: new_project.protected_paths,
            recursion_config: new_project.recursion_config,
            model_hint: new_project.model_hint,
            credential_refs: new_project.credential_refs,
        };
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn delete(&self, project_id: &str) -> anyhow::Result<()> {
        self.projects.write().await.remove(project_id);
        Ok(())
    }
}
