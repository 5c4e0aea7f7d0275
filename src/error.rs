//! Client-visible error kinds and the external-error sanitizer.
//!
//! A closed set of error kinds, plus a best-effort pattern-matching
//! scrubber that keeps short, user-facing messages and replaces anything
//! that looks like a credential or an infrastructure failure with a
//! generic label.

use once_cell::sync::Lazy;
use regex::RegexSet;
use thiserror::Error;

/// Client-visible error kind. Every tool handler and every relay RPC method
/// returns one of these — never a raw `anyhow::Error` string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchError {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("unknown action '{action}' — valid actions: {valid}")]
    UnknownAction { action: String, valid: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("access denied")]
    AccessDenied,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("max recursion depth exceeded: {0}")]
    RecursionExceeded(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Carries an already-sanitized message (see `sanitize`) — never raw
    /// external-capability output.
    #[error("{0}")]
    Internal(String),
}

impl OrchError {
    /// The stable short label used in `{content:[{type:"text",text}],isError:true}`
    /// tool results — distinct from `Display` so access-denied and internal
    /// errors never leak detail to callers that only inspect this.
    pub fn label(&self) -> &'static str {
        match self {
            OrchError::MissingParameter(_) => "missing_parameter",
            OrchError::InvalidParameter(_) => "invalid_parameter",
            OrchError::InvalidScope(_) => "invalid_scope",
            OrchError::UnknownAction { .. } => "unknown_action",
            OrchError::NotFound { .. } => "not_found",
            OrchError::AccessDenied => "access_denied",
            OrchError::Conflict(_) => "conflict",
            OrchError::RecursionExceeded(_) => "recursion_exceeded",
            OrchError::Timeout(_) => "timeout",
            OrchError::Internal(_) => "internal",
        }
    }
}

/// Wrap an external-capability failure (container runtime, agent runtime)
/// as `OrchError::Internal`. Logs the original message unconditionally,
/// then sanitizes it before attaching it to the returned error. `op_label`
/// names the operation for the generic fallback message (e.g.
/// `"container start"`).
pub fn from_external(op_label: &str, err: &anyhow::Error) -> OrchError {
    let raw = err.to_string();
    tracing::warn!(op = op_label, err = %raw, "external capability failed");
    OrchError::Internal(sanitize(op_label, &raw))
}

// ─── error-message sanitization ───────────────────────────────────────────

/// Patterns whose presence means the raw message must never reach the
/// client: credential-shaped tokens, or infrastructure failure text that
/// could leak internal topology.
static UNSAFE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)api[_-]?key",
        r"(?i)\btoken\b",
        r"(?i)\bsecret\b",
        r"(?i)\bpassword\b",
        r"(?i)\bauth\b",
        r"(?i)\bcredential",
        r"(?i)connection refused",
        r"(?i)no such file",
        r"(?i)permission denied",
        r"(?i)\btimeout\b",
        r"(?i)\beof\b",
    ])
    .expect("static regex set must compile")
});

/// Short, user-facing-looking phrases that are allowed through even though
/// they might otherwise be flagged — matched only when the message is also
/// short (< 50 chars).
static SAFE_SHORT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)not found",
        r"(?i)invalid",
        r"(?i)required",
        r"(?i)must be",
        r"(?i)limit",
    ])
    .expect("static regex set must compile")
});

/// Returns `true` if `msg` is safe to return to the client verbatim.
///
/// Short (<50 char) messages that look user-facing pass through even if they
/// also happen to match an unsafe pattern (e.g. "auth required" is 13 chars
/// and matches both sets) — the short/user-facing rule takes priority.
pub fn is_passthrough_safe(msg: &str) -> bool {
    if msg.len() < 50 && SAFE_SHORT_PATTERNS.is_match(msg) {
        return true;
    }
    !UNSAFE_PATTERNS.is_match(msg)
}

/// Sanitize an arbitrary external-error message for client consumption.
/// Idempotent: sanitizing an already-sanitized message returns the same
/// string.
pub fn sanitize(op_label: &str, msg: &str) -> String {
    if is_passthrough_safe(msg) {
        msg.to_string()
    } else {
        format!("{op_label} failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_user_facing_passes_through() {
        assert!(is_passthrough_safe("workspace nope not found"));
        assert!(is_passthrough_safe("session limit reached"));
    }

    #[test]
    fn credential_like_messages_are_blocked() {
        assert!(!is_passthrough_safe("failed: api_key=sk-abc123 rejected by upstream"));
        assert!(!is_passthrough_safe("connection refused: 10.0.0.5:443"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let raw = "connection refused while dialing container daemon socket";
        let once = sanitize("container start", raw);
        let twice = sanitize("container start", &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_passthrough_is_idempotent_too() {
        let raw = "workspace nope not found";
        let once = sanitize("workspace resolve", raw);
        let twice = sanitize("workspace resolve", &once);
        assert_eq!(once, twice);
    }
}
