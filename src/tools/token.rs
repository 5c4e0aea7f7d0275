//! `token` umbrella tool: create, list, revoke.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::access::Scope;
use crate::error::OrchError;
use crate::token::TokenStore;

use super::args::require_str;
use super::registry::ToolHandler;

pub struct TokenTool {
    tokens: TokenStore,
}

impl TokenTool {
    pub fn new(tokens: TokenStore) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl ToolHandler for TokenTool {
    async fn call(&self, action: Option<&str>, args: Value, _scope: &Scope) -> Result<Value, OrchError> {
        match action.expect("registry validates action presence") {
            "create" => {
                let name = require_str(&args, "name")?;
                let scope_str = require_str(&args, "scope")?;
                let token = self
                    .tokens
                    .create(name, scope_str)
                    .await
                    .map_err(|e| OrchError::from_external("token create", &e))?;
                Ok(serde_json::to_value(token).unwrap_or(Value::Null))
            }
            "list" => {
                let tokens = self.tokens.list().await.map_err(|e| OrchError::from_external("token list", &e))?;
                Ok(json!({ "tokens": tokens }))
            }
            "revoke" => {
                let id = require_str(&args, "id")?;
                let revoked = self.tokens.revoke(id).await.map_err(|e| OrchError::from_external("token revoke", &e))?;
                if !revoked {
                    return Err(OrchError::NotFound { kind: "token", id: id.to_string() });
                }
                Ok(json!({ "revoked": id }))
            }
            other => {
                Err(OrchError::UnknownAction { action: other.to_string(), valid: "create, list, revoke".to_string() })
            }
        }
    }
}
