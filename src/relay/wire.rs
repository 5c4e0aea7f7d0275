//! Wire types for the relay pairing protocol ("Relay wire
//! protocol"): the header line exchanged immediately after connect, and the
//! newline-delimited JSON-RPC 2.0 framing used once two ends are paired.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Parsed first line written by a connecting socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectHeader {
    Upstream { session_id: String, project_id: String, depth: u32 },
    Downstream,
}

impl ConnectHeader {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line == "OUBLIETTE-DOWNSTREAM" {
            return Ok(ConnectHeader::Downstream);
        }
        let mut parts = line.split(' ');
        match parts.next() {
            Some("OUBLIETTE-UPSTREAM") => {
                let session_id = parts.next().ok_or("missing session_id")?.to_string();
                let project_id = parts.next().ok_or("missing project_id")?.to_string();
                let depth: u32 = parts
                    .next()
                    .ok_or("missing depth")?
                    .parse()
                    .map_err(|_| "invalid depth".to_string())?;
                Ok(ConnectHeader::Upstream { session_id, project_id, depth })
            }
            _ => Err(format!("unrecognized connect header: {line:?}")),
        }
    }

    pub fn render(&self) -> String {
        match self {
            ConnectHeader::Upstream { session_id, project_id, depth } => {
                format!("OUBLIETTE-UPSTREAM {session_id} {project_id} {depth}\n")
            }
            ConnectHeader::Downstream => "OUBLIETTE-DOWNSTREAM\n".to_string(),
        }
    }
}

/// An inbound JSON-RPC frame. Requests carry `id`; notifications omit it —
/// this core never expects an inbound notification but parses leniently.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.into(), id, result: Some(result), error: None }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.into(), id, result: None, error: Some(RpcError { code, message: message.into() }) }
    }
}

/// Outbound, out-of-band notification (no `id`), e.g. `caller_tools_config`,
/// `caller_tool_request`.
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.into(), method: method.into(), params }
    }
}
