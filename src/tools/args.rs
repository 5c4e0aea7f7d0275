//! Small argument-extraction helpers shared by every tool handler. Tool
//! arguments arrive as a `serde_json::Value` map (//! `call(name, args_as_map, auth_ctx)`); these helpers turn "absent or
//! wrong-typed field" into the same `MissingParameter`/`InvalidParameter`
//! client-visible errors uniformly instead of each handler hand-rolling it.

use serde_json::Value;

use crate::error::OrchError;

pub fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, OrchError> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OrchError::MissingParameter(field.to_string()))
}

pub fn opt_str(args: &Value, field: &str) -> Option<String> {
    args.get(field).and_then(Value::as_str).map(str::to_string)
}

pub fn opt_bool(args: &Value, field: &str) -> bool {
    args.get(field).and_then(Value::as_bool).unwrap_or(false)
}

pub fn opt_u32(args: &Value, field: &str) -> Option<u32> {
    args.get(field).and_then(Value::as_u64).map(|n| n as u32)
}

pub fn opt_i64(args: &Value, field: &str) -> Option<i64> {
    args.get(field).and_then(Value::as_i64)
}

pub fn opt_u64(args: &Value, field: &str) -> Option<u64> {
    args.get(field).and_then(Value::as_u64)
}

pub fn opt_str_vec(args: &Value, field: &str) -> Option<Vec<String>> {
    args.get(field)?.as_array().map(|items| {
        items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_str_rejects_missing_and_empty() {
        let args = json!({"project_id": "", "other": 5});
        assert!(matches!(require_str(&args, "project_id"), Err(OrchError::MissingParameter(f)) if f == "project_id"));
        assert!(matches!(require_str(&args, "missing"), Err(OrchError::MissingParameter(f)) if f == "missing"));
        assert!(matches!(require_str(&args, "other"), Err(OrchError::MissingParameter(_))));
    }

    #[test]
    fn require_str_accepts_present_nonempty() {
        let args = json!({"project_id": "P1"});
        assert_eq!(require_str(&args, "project_id").unwrap(), "P1");
    }

    #[test]
    fn opt_helpers_default_sensibly_when_absent() {
        let args = json!({});
        assert_eq!(opt_str(&args, "x"), None);
        assert!(!opt_bool(&args, "x"));
        assert_eq!(opt_u32(&args, "x"), None);
        assert_eq!(opt_i64(&args, "x"), None);
        assert_eq!(opt_u64(&args, "x"), None);
        assert_eq!(opt_str_vec(&args, "x"), None);
    }

    #[test]
    fn opt_str_vec_filters_non_string_entries() {
        let args = json!({"tools": ["a", 1, "b", null]});
        assert_eq!(opt_str_vec(&args, "tools"), Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn opt_i64_allows_negative() {
        let args = json!({"since_index": -1});
        assert_eq!(opt_i64(&args, "since_index"), Some(-1));
    }
}
