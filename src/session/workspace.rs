//! Workspace Resolver.
//!
//! A project always owns a default workspace; additional workspaces are
//! created on demand and never implicitly inferred except as "the
//! default". The six resolution cases (workspace_id empty/set crossed with
//! create_workspace true/false crossed with existence) are implemented
//! literally as `resolve`'s match arms so each case is auditable on its
//! own.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::OrchError;
use crate::project::Project;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workspace {
    pub id: String,
    pub project_id: String,
    pub created_at: String,
    pub last_session_at: Option<String>,
    pub external_id: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceRequest {
    pub workspace_id: Option<String>,
    pub create_workspace: bool,
    pub external_id: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedWorkspace {
    pub workspace_id: String,
    pub workspace_created: bool,
}

#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_session_at TEXT,
                external_id TEXT,
                source TEXT,
                PRIMARY KEY (project_id, id)
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, project_id: &str, workspace_id: &str) -> Result<Option<Workspace>> {
        Ok(sqlx::query_as(
            "SELECT * FROM workspaces WHERE project_id = ? AND id = ?",
        )
        .bind(project_id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<Workspace>> {
        Ok(sqlx::query_as(
            "SELECT * FROM workspaces WHERE project_id = ? ORDER BY created_at DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create(
        &self,
        project_id: &str,
        workspace_id: &str,
        external_id: Option<&str>,
        source: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO workspaces (id, project_id, created_at, last_session_at, external_id, source)
             VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(workspace_id)
        .bind(project_id)
        .bind(&now)
        .bind(external_id)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_last_session_at(&self, project_id: &str, workspace_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE workspaces SET last_session_at = ? WHERE project_id = ? AND id = ?",
        )
        .bind(&now)
        .bind(project_id)
        .bind(workspace_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a workspace. Rejects with `Conflict` if any session still
    /// references it (`workspace delete` contract).
    pub async fn delete(
        &self,
        sessions: &super::store::SessionStore,
        project_id: &str,
        workspace_id: &str,
    ) -> Result<(), OrchError> {
        let referenced = sessions
            .list_by_project(project_id)
            .await
            .map_err(|e| OrchError::from_external("workspace delete", &e))?
            .into_iter()
            .any(|s| s.workspace_id == workspace_id);
        if referenced {
            return Err(OrchError::Conflict(format!(
                "workspace {workspace_id} is referenced by an existing session"
            )));
        }
        sqlx::query("DELETE FROM workspaces WHERE project_id = ? AND id = ?")
            .bind(project_id)
            .bind(workspace_id)
            .execute(&self.pool)
            .await
            .map_err(|e| OrchError::from_external("workspace delete", &e.into()))?;
        Ok(())
    }

    /// Implements the six-case table in literally.
    pub async fn resolve(
        &self,
        project: &Project,
        request: &WorkspaceRequest,
    ) -> Result<ResolvedWorkspace, OrchError> {
        let resolved = match (&request.workspace_id, request.create_workspace) {
            (None, false) => ResolvedWorkspace {
                workspace_id: project.default_workspace_id.clone(),
                workspace_created: false,
            },
            (None, true) => {
                let id = uuid::Uuid::new_v4().to_string();
                self.create(
                    &project.id,
                    &id,
                    request.external_id.as_deref(),
                    request.source.as_deref(),
                )
                .await
                .map_err(|e| OrchError::from_external("workspace create", &e))?;
                ResolvedWorkspace { workspace_id: id, workspace_created: true }
            }
            (Some(id), false) => {
                let exists = self
                    .get(&project.id, id)
                    .await
                    .map_err(|e| OrchError::from_external("workspace lookup", &e))?
                    .is_some();
                if !exists {
                    return Err(OrchError::NotFound {
                        kind: "workspace",
                        id: id.clone(),
                    });
                }
                ResolvedWorkspace { workspace_id: id.clone(), workspace_created: false }
            }
            (Some(id), true) => {
                let exists = self
                    .get(&project.id, id)
                    .await
                    .map_err(|e| OrchError::from_external("workspace lookup", &e))?
                    .is_some();
                if !exists {
                    self.create(
                        &project.id,
                        id,
                        request.external_id.as_deref(),
                        request.source.as_deref(),
                    )
                    .await
                    .map_err(|e| OrchError::from_external("workspace create", &e))?;
                    ResolvedWorkspace { workspace_id: id.clone(), workspace_created: true }
                } else {
                    ResolvedWorkspace { workspace_id: id.clone(), workspace_created: false }
                }
            }
        };
        self.touch_last_session_at(&project.id, &resolved.workspace_id)
            .await
            .map_err(|e| OrchError::from_external("workspace touch", &e))?;
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::RecursionConfig;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> WorkspaceStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        WorkspaceStore::migrate(&pool).await.unwrap();
        WorkspaceStore::new(pool)
    }

    fn project() -> Project {
        Project {
            id: "P1".into(),
            display_name: "Test".into(),
            container_image: "img".into(),
            default_workspace_id: "default".into(),
            workspace_isolation: true,
            protected_paths: vec![],
            recursion_config: RecursionConfig::default(),
            model_hint: None,
            credential_refs: vec!["cred-1".into()],
        }
    }

    #[tokio::test]
    async fn empty_no_create_returns_project_default_without_creating() {
        let ws = store().await;
        let p = project();
        let resolved = ws
            .resolve(&p, &WorkspaceRequest::default())
            .await
            .unwrap();
        assert_eq!(resolved.workspace_id, "default");
        assert!(!resolved.workspace_created);
        assert!(ws.get(&p.id, "default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_with_create_makes_a_new_uuid() {
        let ws = store().await;
        let p = project();
        let resolved = ws
            .resolve(&p, &WorkspaceRequest { create_workspace: true, ..Default::default() })
            .await
            .unwrap();
        assert!(resolved.workspace_created);
        assert_ne!(resolved.workspace_id, "default");
        assert!(ws.get(&p.id, &resolved.workspace_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn set_no_create_missing_is_an_error() {
        let ws = store().await;
        let p = project();
        let err = ws
            .resolve(
                &p,
                &WorkspaceRequest {
                    workspace_id: Some("nope".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::NotFound { kind: "workspace", .. }));
    }

    #[tokio::test]
    async fn set_with_create_missing_creates_it() {
        let ws = store().await;
        let p = project();
        let resolved = ws
            .resolve(
                &p,
                &WorkspaceRequest {
                    workspace_id: Some("explicit".into()),
                    create_workspace: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(resolved.workspace_created);
        assert_eq!(resolved.workspace_id, "explicit");
    }

    #[tokio::test]
    async fn set_existing_is_not_recreated() {
        let ws = store().await;
        let p = project();
        ws.resolve(
            &p,
            &WorkspaceRequest { workspace_id: Some("explicit".into()), create_workspace: true, ..Default::default() },
        )
        .await
        .unwrap();
        let second = ws
            .resolve(
                &p,
                &WorkspaceRequest { workspace_id: Some("explicit".into()), create_workspace: false, ..Default::default() },
            )
            .await
            .unwrap();
        assert!(!second.workspace_created);
    }
}
