//! Durable session metadata.
//!
//! A dedicated store rather than a field inside one monolithic storage
//! struct, using the same `sqlx` + `SqlitePool` idiom as the other stores
//! in this crate — including an atomic claim-by-UPDATE pattern for
//! `try_claim_running` — with its own schema: parent/child links,
//! `exploration_id`, `depth`, turn history, and resume lookup by
//! `(project_id, workspace_id)`.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Idle,
    Completed,
    Failed,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Ended)
    }

    fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "idle" => Self::Idle,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "ended" => Self::Ended,
            _ => Self::Created,
        }
    }
}

/// One (prompt, output, cost) turn (`turns`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub prompt: String,
    pub output_text: String,
    pub token_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub parent_id: Option<String>,
    pub exploration_id: Option<String>,
    pub depth: u32,
    pub runtime_session_id: Option<String>,
    pub status: SessionStatus,
    pub turns: Vec<Turn>,
    pub total_cost: f64,
    pub created_at: String,
    pub updated_at: String,
    pub tools_allowed: Option<Vec<String>>,
    pub task_context: Option<String>,
    pub child_ids: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    project_id: String,
    workspace_id: String,
    parent_id: Option<String>,
    exploration_id: Option<String>,
    depth: i64,
    runtime_session_id: Option<String>,
    status: String,
    turns: String,
    total_cost: f64,
    created_at: String,
    updated_at: String,
    tools_allowed: Option<String>,
    task_context: Option<String>,
    child_ids: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        Ok(Session {
            id: self.id,
            project_id: self.project_id,
            workspace_id: self.workspace_id,
            parent_id: self.parent_id,
            exploration_id: self.exploration_id,
            depth: self.depth as u32,
            runtime_session_id: self.runtime_session_id,
            status: SessionStatus::from_str(&self.status),
            turns: serde_json::from_str(&self.turns)?,
            total_cost: self.total_cost,
            created_at: self.created_at,
            updated_at: self.updated_at,
            tools_allowed: match self.tools_allowed {
                Some(s) => Some(serde_json::from_str(&s)?),
                None => None,
            },
            task_context: self.task_context,
            child_ids: serde_json::from_str(&self.child_ids)?,
        })
    }
}

/// Fields needed to persist a brand-new session.
pub struct NewSession {
    pub project_id: String,
    pub workspace_id: String,
    pub parent_id: Option<String>,
    pub exploration_id: Option<String>,
    pub depth: u32,
    pub tools_allowed: Option<Vec<String>>,
    pub task_context: Option<String>,
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                parent_id TEXT,
                exploration_id TEXT,
                depth INTEGER NOT NULL DEFAULT 0,
                runtime_session_id TEXT,
                status TEXT NOT NULL DEFAULT 'created',
                turns TEXT NOT NULL DEFAULT '[]',
                total_cost REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                tools_allowed TEXT,
                task_context TEXT,
                child_ids TEXT NOT NULL DEFAULT '[]'
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id, created_at DESC)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_project_workspace ON sessions(project_id, workspace_id, created_at DESC)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn create(&self, new: NewSession) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let tools_allowed = new
            .tools_allowed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO sessions
                (id, project_id, workspace_id, parent_id, exploration_id, depth, status,
                 turns, total_cost, created_at, updated_at, tools_allowed, task_context, child_ids)
             VALUES (?, ?, ?, ?, ?, ?, 'created', '[]', 0, ?, ?, ?, ?, '[]')",
        )
        .bind(&id)
        .bind(&new.project_id)
        .bind(&new.workspace_id)
        .bind(&new.parent_id)
        .bind(&new.exploration_id)
        .bind(new.depth as i64)
        .bind(&now)
        .bind(&now)
        .bind(&tools_allowed)
        .bind(&new.task_context)
        .execute(&self.pool)
        .await?;
        if let Some(parent_id) = &new.parent_id {
            self.append_child_id(parent_id, &id).await?;
        }
        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    pub async fn list_by_project(&self, project_id: &str) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM sessions WHERE project_id = ? ORDER BY created_at DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Most recent session for a (project, workspace) with a known runtime
    /// session id — used by the resume path.
    pub async fn most_recent_resumable(
        &self,
        project_id: &str,
        workspace_id: &str,
    ) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT * FROM sessions
             WHERE project_id = ? AND workspace_id = ? AND runtime_session_id IS NOT NULL
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(project_id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Set the runtime session id. Set exactly once per session; the WHERE
    /// clause makes a second call a no-op rather than an overwrite.
    pub async fn set_runtime_session_id(&self, id: &str, runtime_session_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sessions SET runtime_session_id = ?, updated_at = ?
             WHERE id = ? AND runtime_session_id IS NULL",
        )
        .bind(runtime_session_id)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append-only turn history (invariant: `turns` is append-only).
    pub async fn append_turn(&self, id: &str, turn: Turn) -> Result<()> {
        let Some(mut session) = self.get(id).await? else {
            anyhow::bail!("session {id} not found");
        };
        session.total_cost += turn.token_cost;
        session.turns.push(turn);
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET turns = ?, total_cost = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&session.turns)?)
            .bind(session.total_cost)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_child_id(&self, parent_id: &str, child_id: &str) -> Result<()> {
        let Some(parent) = self.get(parent_id).await? else {
            anyhow::bail!("parent session {parent_id} not found");
        };
        let mut child_ids = parent.child_ids;
        child_ids.push(child_id.to_string());
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET child_ids = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&child_ids)?)
            .bind(&now)
            .bind(parent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cleanup contract: delete sessions in a terminal
    /// status older than `max_age`. Returns the number removed.
    pub async fn cleanup(&self, project_id: &str, max_age: chrono::Duration) -> Result<u64> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM sessions
             WHERE project_id = ? AND updated_at < ?
               AND status IN ('completed', 'failed', 'ended')",
        )
        .bind(project_id)
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
