//! Token scope algebra.
//!
//! A small, pure-function predicate module: no I/O, trivially testable,
//! used from both the HTTP-side tool dispatcher and the relay's
//! `oubliette_tools`/`oubliette_call_tool` re-entry path so the two entry
//! points stay uniform.

use crate::error::OrchError;
use std::fmt;

/// A token's access scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Admin,
    AdminReadOnly,
    Project(String),
    ProjectReadOnly(String),
}

impl Scope {
    /// Parse a scope string of the form `admin`, `admin:ro`,
    /// `project:<id>`, or `project:<id>:ro`.
    pub fn parse(s: &str) -> Result<Scope, OrchError> {
        match s {
            "admin" => return Ok(Scope::Admin),
            "admin:ro" => return Ok(Scope::AdminReadOnly),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix("project:") {
            if let Some(id) = rest.strip_suffix(":ro") {
                if id.is_empty() {
                    return Err(OrchError::InvalidScope(s.to_string()));
                }
                return Ok(Scope::ProjectReadOnly(id.to_string()));
            }
            if rest.is_empty() {
                return Err(OrchError::InvalidScope(s.to_string()));
            }
            return Ok(Scope::Project(rest.to_string()));
        }
        Err(OrchError::InvalidScope(s.to_string()))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Admin => write!(f, "admin"),
            Scope::AdminReadOnly => write!(f, "admin:ro"),
            Scope::Project(id) => write!(f, "project:{id}"),
            Scope::ProjectReadOnly(id) => write!(f, "project:{id}:ro"),
        }
    }
}

/// What a tool operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Global,
    Project,
}

/// The kind of access a tool call requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Admin,
}

/// Decide whether `scope` permits `access` on `target`, where `project_id`
/// is the project extracted from the call's arguments (`None` for calls
/// with no project in scope, e.g. `project.create`).
///
/// Pure and O(1) — decidable in constant time and idempotent.
pub fn allows(scope: &Scope, target: Target, access: Access, project_id: Option<&str>) -> bool {
    match (scope, target, access) {
        // admin: full access everywhere.
        (Scope::Admin, _, _) => true,

        // admin:ro: read anywhere, never write/admin.
        (Scope::AdminReadOnly, _, Access::Read) => true,
        (Scope::AdminReadOnly, _, _) => false,

        // project:<id> / project:<id>:ro against a *global*-target tool:
        // only read access to globally-scoped read-only surfaces (e.g.
        // config_limits is project-targeted, not global — global write/admin
        // tools like `project.create` or `token.*` are never reachable by a
        // project-scoped token).
        (Scope::Project(_), Target::Global, Access::Read) => true,
        (Scope::ProjectReadOnly(_), Target::Global, Access::Read) => true,
        (Scope::Project(_), Target::Global, _) => false,
        (Scope::ProjectReadOnly(_), Target::Global, _) => false,

        // project:<id> against a project-target tool: read/write iff the
        // call's project_id matches X; admin never granted.
        (Scope::Project(x), Target::Project, Access::Read) => project_id == Some(x.as_str()),
        (Scope::Project(x), Target::Project, Access::Write) => project_id == Some(x.as_str()),
        (Scope::Project(_), Target::Project, Access::Admin) => false,

        // project:<id>:ro against a project-target tool: read-only iff
        // project_id matches X.
        (Scope::ProjectReadOnly(x), Target::Project, Access::Read) => {
            project_id == Some(x.as_str())
        }
        (Scope::ProjectReadOnly(_), Target::Project, _) => false,
    }
}

/// Check access and translate a denial into an `AccessDenied` error.
pub fn check(
    scope: &Scope,
    target: Target,
    access: Access,
    project_id: Option<&str>,
) -> Result<(), OrchError> {
    if allows(scope, target, access, project_id) {
        Ok(())
    } else {
        Err(OrchError::AccessDenied)
    }
}
