//! Active Session Manager: registry keyed by session-id and
//! `(project_id, workspace_id)`, capacity + idle eviction.
//!
//! New module. The registry-lock + check-then-register discipline guards
//! against double-registering an executor when two spawn paths race
//! ("Idle eviction vs. resume": check-then-register under the registry
//! lock). The sweeper loop follows the same `tokio::select!`-driven
//! background-task shape used by the schedule runner's tick loop, here
//! fixed at a 30s interval.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::active::{ActiveSession, ActiveStatus};

const SWEEP_INTERVAL_SECS: u64 = 30;

pub struct ActiveSessionManager {
    sessions: RwLock<HashMap<String, Arc<ActiveSession>>>,
    max_active: usize,
    idle_timeout: chrono::Duration,
}

impl ActiveSessionManager {
    pub fn new(max_active: usize, idle_timeout_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_active,
            idle_timeout: chrono::Duration::seconds(idle_timeout_secs as i64),
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<ActiveSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Unique running/idle instance for `(project_id, workspace_id)`, used
    /// by `message` to attach to an existing conversation.
    pub async fn by_project_workspace(
        &self,
        project_id: &str,
        workspace_id: &str,
    ) -> Option<Arc<ActiveSession>> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if session.project_id == project_id && session.workspace_id == workspace_id {
                let status = session.status().await;
                if !status.is_terminal() {
                    return Some(session.clone());
                }
            }
        }
        None
    }

    /// Check-then-register under the registry lock. If a session
    /// with the same id is already registered, the existing instance is
    /// returned instead — this is what makes resume-after-evict safe when
    /// two spawn paths race.
    pub async fn register_or_reuse(&self, session: Arc<ActiveSession>) -> Arc<ActiveSession> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&session.session_id) {
            return existing.clone();
        }
        let id = session.session_id.clone();
        sessions.insert(id, session.clone());
        drop(sessions);
        self.evict_over_capacity(&session.session_id).await;
        session
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Evict the least-recently-active idle session if over capacity. The
    /// session currently being registered is never evicted.
    async fn evict_over_capacity(&self, excluding: &str) {
        let over_capacity = self.sessions.read().await.len() > self.max_active;
        if !over_capacity {
            return;
        }
        let victim = {
            let sessions = self.sessions.read().await;
            let mut candidates = Vec::new();
            for session in sessions.values() {
                if session.session_id == excluding {
                    continue;
                }
                if session.status().await == ActiveStatus::Idle {
                    candidates.push((session.session_id.clone(), session.idle_for(), session.clone()));
                }
            }
            candidates.into_iter().max_by_key(|(_, idle, _)| *idle)
        };
        if let Some((id, _, session)) = victim {
            session.close().await;
            self.sessions.write().await.remove(&id);
        }
    }

    /// Spawns the idle sweeper. Cancelled via `token`.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS)) => {
                        manager.sweep_idle().await;
                    }
                }
            }
        });
    }

    async fn sweep_idle(&self) {
        let expired: Vec<Arc<ActiveSession>> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for session in sessions.values() {
                let status = session.status().await;
                if !status.is_terminal() && session.idle_for() > self.idle_timeout {
                    expired.push(session.clone());
                }
            }
            expired
        };
        for session in expired {
            session.close().await;
            self.remove(&session.session_id).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Closes every active session (server shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<ActiveSession>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
        self.sessions.write().await.clear();
    }
}
