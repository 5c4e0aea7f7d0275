//! `Schedule`, `Target`, `Execution` types and the durable `ScheduleStore`.
//!
//! Same `sqlx` + `SqlitePool` idiom as `token.rs`/`session/store.rs`:
//! rfc3339 timestamps via `chrono::Utc`, `Uuid::new_v4` ids, `sqlx::FromRow`
//! rows mapped into a richer owned type. Targets are stored as a JSON
//! column — the Schedule Runner only ever reads/writes a schedule's full
//! target list at once, so there is no query that benefits from a join.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// How a schedule reacts to its previous run still being in flight at tick
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapBehavior {
    Skip,
    Queue,
}

/// Whether a target run resumes a previously pinned session or always
/// starts fresh (`execute_target`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBehavior {
    Resume,
    New,
}

/// One `(project_id, workspace_id?, pinned_session_id?, last_executed_at?,
/// last_output?)` entry. Updated in place by `execute_target` on
/// success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub project_id: String,
    pub workspace_id: Option<String>,
    pub pinned_session_id: Option<String>,
    pub last_executed_at: Option<String>,
    pub last_output: Option<String>,
}

impl Target {
    pub fn new(project_id: impl Into<String>, workspace_id: Option<String>) -> Self {
        Self {
            project_id: project_id.into(),
            workspace_id,
            pinned_session_id: None,
            last_executed_at: None,
            last_output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub cron_expr: String,
    pub prompt: String,
    pub targets: Vec<Target>,
    pub enabled: bool,
    pub overlap_behavior: OverlapBehavior,
    pub session_behavior: SessionBehavior,
    pub creator_token_id: String,
    pub creator_scope: String,
    pub last_run_at: Option<String>,
    pub next_run_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    name: String,
    cron_expr: String,
    prompt: String,
    targets_json: String,
    enabled: bool,
    overlap_behavior: String,
    session_behavior: String,
    creator_token_id: String,
    creator_scope: String,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<Schedule> {
        Ok(Schedule {
            id: self.id,
            name: self.name,
            cron_expr: self.cron_expr,
            prompt: self.prompt,
            targets: serde_json::from_str(&self.targets_json)
                .context("corrupt targets_json in schedules row")?,
            enabled: self.enabled,
            overlap_behavior: match self.overlap_behavior.as_str() {
                "skip" => OverlapBehavior::Skip,
                "queue" => OverlapBehavior::Queue,
                other => anyhow::bail!("unknown overlap_behavior {other:?} in schedules row"),
            },
            session_behavior: match self.session_behavior.as_str() {
                "resume" => SessionBehavior::Resume,
                "new" => SessionBehavior::New,
                other => anyhow::bail!("unknown session_behavior {other:?} in schedules row"),
            },
            creator_token_id: self.creator_token_id,
            creator_scope: self.creator_scope,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
        })
    }
}

fn overlap_str(b: OverlapBehavior) -> &'static str {
    match b {
        OverlapBehavior::Skip => "skip",
        OverlapBehavior::Queue => "queue",
    }
}

fn session_str(b: SessionBehavior) -> &'static str {
    match b {
        SessionBehavior::Resume => "resume",
        SessionBehavior::New => "new",
    }
}

/// Parameters accepted when creating a schedule (`schedule: create`).
#[derive(Debug, Clone, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub cron_expr: String,
    pub prompt: String,
    pub targets: Vec<Target>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub overlap_behavior: OverlapBehavior,
    pub session_behavior: SessionBehavior,
    pub creator_token_id: String,
    pub creator_scope: String,
}

fn default_true() -> bool {
    true
}

/// Outcome of one target execution within a tick (`execute_target`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Execution {
    pub id: String,
    pub schedule_id: String,
    pub project_id: String,
    pub outcome: String,
    pub session_id: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Clone)]
pub struct ScheduleStore {
    pool: SqlitePool,
}

impl ScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cron_expr TEXT NOT NULL,
                prompt TEXT NOT NULL,
                targets_json TEXT NOT NULL,
                enabled BOOLEAN NOT NULL,
                overlap_behavior TEXT NOT NULL,
                session_behavior TEXT NOT NULL,
                creator_token_id TEXT NOT NULL,
                creator_scope TEXT NOT NULL,
                last_run_at TEXT,
                next_run_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                session_id TEXT,
                output TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_schedule ON executions(schedule_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn create(&self, new: NewSchedule) -> Result<Schedule> {
        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            cron_expr: new.cron_expr,
            prompt: new.prompt,
            targets: new.targets,
            enabled: new.enabled,
            overlap_behavior: new.overlap_behavior,
            session_behavior: new.session_behavior,
            creator_token_id: new.creator_token_id,
            creator_scope: new.creator_scope,
            last_run_at: None,
            next_run_at: None,
        };
        let targets_json = serde_json::to_string(&schedule.targets)?;
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO schedules
                    (id, name, cron_expr, prompt, targets_json, enabled,
                     overlap_behavior, session_behavior, creator_token_id,
                     creator_scope, last_run_at, next_run_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
                "#,
            )
            .bind(&schedule.id)
            .bind(&schedule.name)
            .bind(&schedule.cron_expr)
            .bind(&schedule.prompt)
            .bind(&targets_json)
            .bind(schedule.enabled)
            .bind(overlap_str(schedule.overlap_behavior))
            .bind(session_str(schedule.session_behavior))
            .bind(&schedule.creator_token_id)
            .bind(&schedule.creator_scope)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        Ok(schedule)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        let row: Option<ScheduleRow> = with_timeout(async {
            Ok(sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;
        row.map(|r| r.into_schedule()).transpose()
    }

    pub async fn list_enabled(&self) -> Result<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> = with_timeout(async {
            Ok(
                sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules WHERE enabled = 1")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await?;
        rows.into_iter().map(|r| r.into_schedule()).collect()
    }

    pub async fn list(&self) -> Result<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> = with_timeout(async {
            Ok(
                sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await?;
        rows.into_iter().map(|r| r.into_schedule()).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM schedules WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE schedules SET enabled = ? WHERE id = ?")
                .bind(enabled)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Persists the recomputed `(last_run_at, next_run_at)` pair after a tick
    /// (step 2).
    pub async fn set_run_times(
        &self,
        id: &str,
        last_run_at: Option<&str>,
        next_run_at: Option<&str>,
    ) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE schedules SET last_run_at = ?, next_run_at = ? WHERE id = ?")
                .bind(last_run_at)
                .bind(next_run_at)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Replaces a schedule's target list, e.g. after `execute_target`
    /// updates `(pinned_session_id, last_output, last_executed_at)` on
    /// success, or clears a pinned session for `session_behavior = new`.
    pub async fn set_targets(&self, id: &str, targets: &[Target]) -> Result<()> {
        let targets_json = serde_json::to_string(targets)?;
        with_timeout(async {
            sqlx::query("UPDATE schedules SET targets_json = ? WHERE id = ?")
                .bind(&targets_json)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn record_execution(
        &self,
        schedule_id: &str,
        project_id: &str,
        outcome: ExecutionOutcome,
        session_id: Option<&str>,
        output: Option<&str>,
        error: Option<&str>,
        started_at: &str,
    ) -> Result<Execution> {
        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_string(),
            project_id: project_id.to_string(),
            outcome: match outcome {
                ExecutionOutcome::Success => "success",
                ExecutionOutcome::Failed => "failed",
                ExecutionOutcome::Skipped => "skipped",
            }
            .to_string(),
            session_id: session_id.map(str::to_string),
            output: output.map(str::to_string),
            error: error.map(str::to_string),
            started_at: started_at.to_string(),
            finished_at: Some(Utc::now().to_rfc3339()),
        };
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO executions
                    (id, schedule_id, project_id, outcome, session_id, output,
                     error, started_at, finished_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&execution.id)
            .bind(&execution.schedule_id)
            .bind(&execution.project_id)
            .bind(&execution.outcome)
            .bind(&execution.session_id)
            .bind(&execution.output)
            .bind(&execution.error)
            .bind(&execution.started_at)
            .bind(&execution.finished_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        Ok(execution)
    }

    pub async fn list_executions(&self, schedule_id: &str) -> Result<Vec<Execution>> {
        with_timeout(async {
            Ok(sqlx::query_as::<_, Execution>(
                "SELECT * FROM executions WHERE schedule_id = ? ORDER BY started_at DESC",
            )
            .bind(schedule_id)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }
}
