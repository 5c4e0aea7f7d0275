//! Token type and durable `TokenStore`.
//!
//! Uses the same `sqlx` + `SqlitePool` query idiom as the other stores in
//! this crate (`Uuid::new_v4` ids, rfc3339 timestamps via `chrono::Utc`),
//! scoped to its own table rather than folded into one monolithic store.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::access::Scope;

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

/// `(id, name, scope, created_at, last_used_at?)`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    pub id: String,
    pub name: String,
    pub scope: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

impl Token {
    /// Parse this row's scope string. Tokens are only ever persisted with a
    /// scope that already passed `Scope::parse` at creation time, so a
    /// parse failure here indicates store corruption rather than bad input.
    pub fn parsed_scope(&self) -> Result<Scope> {
        Scope::parse(&self.scope).map_err(|e| anyhow::anyhow!(e.to_string()))
    }
}

#[derive(Clone)]
pub struct TokenStore {
    pool: SqlitePool,
}

impl TokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                scope TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_used_at TEXT
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Create a new token. Validates `scope` via `Scope::parse` before
    /// persisting (`token create` must reject malformed scopes).
    pub async fn create(&self, name: &str, scope: &str) -> Result<Token> {
        Scope::parse(scope).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO tokens (id, name, scope, created_at, last_used_at) VALUES (?, ?, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(name)
        .bind(scope)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("token not found after insert"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Token>> {
        Ok(sqlx::query_as("SELECT * FROM tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list(&self) -> Result<Vec<Token>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM tokens ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn revoke(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamp `last_used_at` on every authenticated call.
    pub async fn touch(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE tokens SET last_used_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> TokenStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        TokenStore::migrate(&pool).await.unwrap();
        TokenStore::new(pool)
    }

    #[tokio::test]
    async fn create_rejects_malformed_scope() {
        let store = test_store().await;
        let err = store.create("bad", "project:").await.unwrap_err();
        assert!(err.to_string().contains("scope"));
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = test_store().await;
        let token = store.create("ci-bot", "project:alpha").await.unwrap();
        let fetched = store.get(&token.id).await.unwrap().unwrap();
        assert_eq!(fetched.scope, "project:alpha");
        assert!(fetched.last_used_at.is_none());
    }

    #[tokio::test]
    async fn touch_sets_last_used_at() {
        let store = test_store().await;
        let token = store.create("ci-bot", "admin").await.unwrap();
        store.touch(&token.id).await.unwrap();
        let fetched = store.get(&token.id).await.unwrap().unwrap();
        assert!(fetched.last_used_at.is_some());
    }

    #[tokio::test]
    async fn revoke_removes_the_token() {
        let store = test_store().await;
        let token = store.create("ci-bot", "admin:ro").await.unwrap();
        assert!(store.revoke(&token.id).await.unwrap());
        assert!(store.get(&token.id).await.unwrap().is_none());
        assert!(!store.revoke(&token.id).await.unwrap());
    }
}
