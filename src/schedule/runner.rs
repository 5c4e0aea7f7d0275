//! Schedule Runner: cron tick loop, per-schedule overlap gate, target
//! execution.
//!
//! New module. The tick/sleep-until-next-wake shape and the
//! cancellation-token-driven shutdown follow the same pattern as
//! `session::manager::ActiveSessionManager::spawn_sweeper`; the
//! per-schedule overlap gate guards concurrent work with a keyed
//! `tokio::sync::Mutex`, the same idiom used for serializing per-key work
//! elsewhere in this crate.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::access::Scope;
use crate::session::{ActiveStatus, MessageRequest, SessionController, SessionStatus, SpawnRequest};

use super::store::{ExecutionOutcome, NewSchedule, OverlapBehavior, Schedule, ScheduleStore, SessionBehavior, Target};

fn compute_next_run_at(cron_expr: &str, after: DateTime<Utc>) -> Option<String> {
    match CronSchedule::from_str(cron_expr) {
        Ok(schedule) => schedule.after(&after).next().map(|dt| dt.to_rfc3339()),
        Err(e) => {
            tracing::warn!(cron_expr, err = %e, "invalid cron expression");
            None
        }
    }
}

pub struct ScheduleRunner {
    store: ScheduleStore,
    controller: Arc<SessionController>,
    target_deadline: Duration,
    locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ScheduleRunner {
    pub fn new(store: ScheduleStore, controller: Arc<SessionController>, target_deadline: Duration) -> Self {
        Self { store, controller, target_deadline, locks: RwLock::new(HashMap::new()) }
    }

    /// Exposed so the standalone `schedule` tool can perform CRUD/history
    /// reads/writes through the same store the ticker uses, and so
    /// `schedule trigger` shares this runner's per-schedule overlap locks
    /// instead of racing a second, independent lock table.
    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// Computes and persists `next_run_at` for every enabled schedule that
    /// does not already have one. Called once at server startup.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for schedule in self.store.list_enabled().await? {
            if schedule.next_run_at.is_none() {
                let next_run_at = compute_next_run_at(&schedule.cron_expr, now);
                self.store.set_run_times(&schedule.id, None, next_run_at.as_deref()).await?;
            }
        }
        Ok(())
    }

    async fn lock_for(&self, schedule_id: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.locks.read().await.get(schedule_id) {
            return lock.clone();
        }
        self.locks
            .write()
            .await
            .entry(schedule_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Spawns the ticker. Cancelled via `token`; on cancellation, stops
    /// accepting new ticks and waits for in-flight executions to finish
    /// before returning ("Runner shutdown").
    pub fn spawn(self: Arc<Self>, token: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let sleep_for = self.time_until_next_wake().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {
                        self.tick().await;
                    }
                }
            }
            let locks: Vec<Arc<AsyncMutex<()>>> = self.locks.read().await.values().cloned().collect();
            for lock in locks {
                let _ = lock.lock().await;
            }
        });
    }

    /// Sleeps until the next minute boundary or the earliest known
    /// `next_run_at`, whichever comes first.
    async fn time_until_next_wake(&self) -> Duration {
        let now = Utc::now();
        let secs_into_minute = now.timestamp() % 60;
        let mut wake_at = now + chrono::Duration::seconds(60 - secs_into_minute);

        if let Ok(schedules) = self.store.list_enabled().await {
            for schedule in schedules {
                if let Some(next_run_at) = schedule.next_run_at.as_deref() {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(next_run_at) {
                        let parsed = parsed.with_timezone(&Utc);
                        if parsed < wake_at {
                            wake_at = parsed;
                        }
                    }
                }
            }
        }

        (wake_at - now).to_std().unwrap_or(Duration::from_millis(250)).max(Duration::from_millis(250))
    }

    async fn tick(self: &Arc<Self>) {
        let now = Utc::now();
        let schedules = match self.store.list_enabled().await {
            Ok(schedules) => schedules,
            Err(e) => {
                tracing::warn!(err = %e, "failed to list enabled schedules");
                return;
            }
        };

        for schedule in schedules {
            let due = match schedule.next_run_at.as_deref().and_then(|s| DateTime::parse_from_rfc3339(s).ok()) {
                Some(next_run_at) => next_run_at.with_timezone(&Utc) <= now,
                None => true,
            };
            if !due {
                continue;
            }
            tracing::debug!(schedule_id = %schedule.id, "schedule tick due");

            let lock = self.lock_for(&schedule.id).await;
            match schedule.overlap_behavior {
                OverlapBehavior::Skip => match lock.try_lock_owned() {
                    Ok(guard) => {
                        let runner = self.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            runner.run_schedule(schedule).await;
                        });
                    }
                    Err(_) => {
                        let runner = self.clone();
                        tokio::spawn(async move {
                            runner.record_skip(&schedule).await;
                        });
                    }
                },
                OverlapBehavior::Queue => {
                    let runner = self.clone();
                    tokio::spawn(async move {
                        let _guard = lock.lock_owned().await;
                        runner.run_schedule(schedule).await;
                    });
                }
            }
        }
    }

    /// Runs every target of one schedule invocation concurrently, then
    /// recomputes `next_run_at` (steps 1.b, 2).
    async fn run_schedule(self: Arc<Self>, schedule: Schedule) {
        let now = Utc::now();
        let mut targets = schedule.targets.clone();

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets.iter().cloned() {
            let runner = self.clone();
            let schedule = schedule.clone();
            handles.push(tokio::spawn(async move { runner.execute_target(&schedule, target).await }));
        }
        for (index, handle) in handles.into_iter().enumerate() {
            if let Ok(updated) = handle.await {
                targets[index] = updated;
            }
        }

        if let Err(e) = self.store.set_targets(&schedule.id, &targets).await {
            tracing::warn!(schedule_id = %schedule.id, err = %e, "failed to persist updated targets");
        }
        let next_run_at = compute_next_run_at(&schedule.cron_expr, now);
        if let Err(e) = self.store.set_run_times(&schedule.id, Some(&now.to_rfc3339()), next_run_at.as_deref()).await
        {
            tracing::warn!(schedule_id = %schedule.id, err = %e, "failed to persist run times");
        }
    }

    /// Runs one schedule immediately, outside its normal tick cadence (the
    /// standalone `schedule trigger` action). Honors the same overlap gate
    /// as a tick: a `skip` schedule already in flight records a skipped
    /// execution instead of running again.
    pub async fn trigger(self: &Arc<Self>, schedule_id: &str) -> anyhow::Result<()> {
        let schedule = self
            .store
            .get(schedule_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("schedule {schedule_id} not found"))?;

        let lock = self.lock_for(&schedule.id).await;
        match schedule.overlap_behavior {
            OverlapBehavior::Skip => match lock.try_lock_owned() {
                Ok(guard) => {
                    let runner = self.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        runner.run_schedule(schedule).await;
                    });
                }
                Err(_) => self.record_skip(&schedule).await,
            },
            OverlapBehavior::Queue => {
                let runner = self.clone();
                tokio::spawn(async move {
                    let _guard = lock.lock_owned().await;
                    runner.run_schedule(schedule).await;
                });
            }
        }
        Ok(())
    }

    async fn record_skip(&self, schedule: &Schedule) {
        let started_at = Utc::now().to_rfc3339();
        for target in &schedule.targets {
            let _ = self
                .store
                .record_execution(
                    &schedule.id,
                    &target.project_id,
                    ExecutionOutcome::Skipped,
                    None,
                    None,
                    None,
                    &started_at,
                )
                .await;
        }
    }

    /// Executes one target: resolves session policy, waits for completion
    /// bounded by `target_deadline`, records an `Execution`, and returns the
    /// target with `(pinned_session_id, last_output, last_executed_at)`
    /// updated on success (`execute_target`).
    async fn execute_target(&self, schedule: &Schedule, mut target: Target) -> Target {
        let started_at = Utc::now().to_rfc3339();

        let scope = match Scope::parse(&schedule.creator_scope) {
            Ok(scope) => scope,
            Err(e) => {
                self.fail(schedule, &target, None, &e.to_string(), &started_at).await;
                return target;
            }
        };

        let project = match self.controller.project(&target.project_id).await {
            Ok(project) => project,
            Err(e) => {
                self.fail(schedule, &target, None, &e.to_string(), &started_at).await;
                return target;
            }
        };
        let workspace_id = target.workspace_id.clone().unwrap_or_else(|| project.default_workspace_id.clone());

        if schedule.session_behavior == SessionBehavior::New {
            if let Some(active) = self.controller.active_manager().by_project_workspace(&target.project_id, &workspace_id).await {
                active.close().await;
                self.controller.active_manager().remove(&active.session_id).await;
            }
            target.pinned_session_id = None;
        }

        let has_active = self.controller.active_manager().by_project_workspace(&target.project_id, &workspace_id).await.is_some();

        let session_id = if schedule.session_behavior == SessionBehavior::Resume && has_active {
            match self
                .controller
                .message(
                    &scope,
                    MessageRequest {
                        project_id: target.project_id.clone(),
                        message: schedule.prompt.clone(),
                        workspace_id: Some(workspace_id.clone()),
                        create_workspace: false,
                    },
                )
                .await
            {
                Ok(result) => result.session_id,
                Err(e) => {
                    self.fail(schedule, &target, None, &e.to_string(), &started_at).await;
                    return target;
                }
            }
        } else if schedule.session_behavior == SessionBehavior::Resume && target.pinned_session_id.is_some() {
            // Prefer this target's own pinned session over whatever
            // `most_recent_resumable` would otherwise guess for the
            // (project, workspace) pair — a stray session, or another
            // target sharing the same workspace, must not hijack resume.
            let pinned = target.pinned_session_id.clone().unwrap();
            match self.controller.resume_pinned(&scope, &target.project_id, &workspace_id, &pinned, schedule.prompt.clone()).await {
                Ok(result) => result.session_id,
                Err(e) => {
                    tracing::warn!(
                        schedule_id = %schedule.id, target_id = %target.project_id, pinned_session_id = %pinned, err = %e,
                        "pinned session resume failed, falling back to most-recent resumable"
                    );
                    match self
                        .controller
                        .spawn(
                            &scope,
                            SpawnRequest {
                                project_id: Some(target.project_id.clone()),
                                prompt: schedule.prompt.clone(),
                                workspace_id: Some(workspace_id.clone()),
                                create_workspace: false,
                                new_session: false,
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        Ok(result) => result.session_id,
                        Err(e) => {
                            self.fail(schedule, &target, None, &e.to_string(), &started_at).await;
                            return target;
                        }
                    }
                }
            }
        } else {
            match self
                .controller
                .spawn(
                    &scope,
                    SpawnRequest {
                        project_id: Some(target.project_id.clone()),
                        prompt: schedule.prompt.clone(),
                        workspace_id: Some(workspace_id.clone()),
                        create_workspace: false,
                        new_session: schedule.session_behavior == SessionBehavior::New,
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(result) => result.session_id,
                Err(e) => {
                    self.fail(schedule, &target, None, &e.to_string(), &started_at).await;
                    return target;
                }
            }
        };

        let deadline = tokio::time::Instant::now() + self.target_deadline;
        loop {
            match self.controller.active_manager().get(&session_id).await {
                Some(active) => {
                    let status = active.status().await;
                    if status == ActiveStatus::Idle || status.is_terminal() {
                        break;
                    }
                }
                None => break,
            }
            if tokio::time::Instant::now() >= deadline {
                self.fail(schedule, &target, Some(&session_id), "execution deadline exceeded", &started_at).await;
                return target;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        match self.controller.get(&session_id).await {
            Ok(session) => {
                if session.status == SessionStatus::Failed {
                    self.fail(schedule, &target, Some(&session_id), "session ended in a failed state", &started_at).await;
                    return target;
                }
                let output = session.turns.last().map(|turn| turn.output_text.clone());
                let _ = self
                    .store
                    .record_execution(
                        &schedule.id,
                        &target.project_id,
                        ExecutionOutcome::Success,
                        Some(&session_id),
                        output.as_deref(),
                        None,
                        &started_at,
                    )
                    .await;
                tracing::info!(schedule_id = %schedule.id, target_id = %target.project_id, status = "success", "schedule target executed");
                target.pinned_session_id = Some(session_id);
                target.last_output = output;
                target.last_executed_at = Some(Utc::now().to_rfc3339());
            }
            Err(e) => self.fail(schedule, &target, Some(&session_id), &e.to_string(), &started_at).await,
        }

        target
    }

    async fn fail(&self, schedule: &Schedule, target: &Target, session_id: Option<&str>, error: &str, started_at: &str) {
        tracing::warn!(schedule_id = %schedule.id, target_id = %target.project_id, status = "failed", error, "schedule target failed");
        let _ = self
            .store
            .record_execution(&schedule.id, &target.project_id, ExecutionOutcome::Failed, session_id, None, Some(error), started_at)
            .await;
    }
}
