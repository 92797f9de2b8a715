//! Per-worker policy for file writes and shell commands.
//!
//! [`decide`] is a pure function of the attempted action, the worker's
//! identity and the configured policy. The only outside state it touches is
//! the current directory, when a worktree path is itself relative.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::Role;

/// Commands a builder may run when no allow-list is configured.
pub const DEFAULT_BUILDER_COMMANDS: &[&str] = &[
    "go", "make", "git", "rg", "sed", "cat", "ls", "pwd", "env", "grep",
];

/// Tools that write to the filesystem.
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Tools that run shell commands or ask for permission to.
const SHELL_TOOLS: &[&str] = &["Bash", "PermissionRequest"];

/// An action a worker is about to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write or edit a file. `None` when the tool input named no path.
    Write { path: Option<String> },
    /// Run a shell command.
    Shell { command: String },
    /// Anything else.
    Other { tool: String },
}

impl Action {
    /// Classify a tool invocation from its name and JSON input.
    pub fn from_tool(tool_name: &str, tool_input: &serde_json::Value) -> Self {
        let field = |key: &str| {
            tool_input
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        if WRITE_TOOLS.contains(&tool_name) {
            let path = field("file_path")
                .or_else(|| field("notebook_path"))
                .or_else(|| field("path"));
            Action::Write { path }
        } else if SHELL_TOOLS.contains(&tool_name) {
            Action::Shell {
                command: field("command").unwrap_or_default(),
            }
        } else {
            Action::Other {
                tool: tool_name.to_string(),
            }
        }
    }
}

/// Who is acting and where they are allowed to write.
#[derive(Debug, Clone)]
pub struct Identity {
    pub role: Role,
    pub worktree: PathBuf,
    /// Scope prefix relative to the worktree. Empty means the whole worktree.
    pub scope: String,
}

/// Configurable parts of the policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub builder_commands: Vec<String>,
    /// Roles that may neither write nor run commands.
    pub read_only_roles: Vec<Role>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            builder_commands: DEFAULT_BUILDER_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            read_only_roles: Role::all()
                .iter()
                .copied()
                .filter(Role::is_read_only)
                .collect(),
        }
    }
}

impl Policy {
    pub fn is_read_only(&self, role: Role) -> bool {
        self.read_only_roles.contains(&role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

/// Decision plus a human-readable reason. Serialized as the guard hook reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
}

impl Verdict {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Guard hook input: the tool about to run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardRequest {
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
}

pub fn decide(action: &Action, identity: &Identity, policy: &Policy) -> Verdict {
    match action {
        Action::Write { path } => decide_write(path.as_deref(), identity, policy),
        Action::Shell { command } => decide_shell(command, identity, policy),
        Action::Other { tool } => Verdict::allow(format!("{} is not restricted", tool)),
    }
}

fn decide_write(path: Option<&str>, identity: &Identity, policy: &Policy) -> Verdict {
    if policy.is_read_only(identity.role) {
        return Verdict::deny(format!("role {} is read-only", identity.role));
    }
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return Verdict::allow("no target path");
    };

    let Some(scope_root) = absolute(&identity.worktree.join(&identity.scope)) else {
        return Verdict::allow("scope could not be resolved");
    };
    let target = Path::new(path);
    let target = if target.is_absolute() {
        target.to_path_buf()
    } else {
        identity.worktree.join(target)
    };
    let Some(target) = absolute(&target) else {
        return Verdict::allow("path could not be resolved");
    };

    if target.starts_with(&scope_root) {
        Verdict::allow(format!("{} is inside scope", path))
    } else {
        Verdict::deny(format!(
            "{} escapes scope '{}' ({})",
            path,
            identity.scope,
            scope_root.display()
        ))
    }
}

fn decide_shell(command: &str, identity: &Identity, policy: &Policy) -> Verdict {
    if policy.is_read_only(identity.role) {
        return Verdict::deny(format!("role {} may not run commands", identity.role));
    }
    let Some(program) = command.split_whitespace().next() else {
        return Verdict::allow("empty command");
    };
    if identity.role != Role::Builder {
        return Verdict::allow(format!("role {} is unrestricted", identity.role));
    }
    if policy.builder_commands.iter().any(|c| c == program) {
        Verdict::allow(format!("{} is allowed", program))
    } else {
        Verdict::deny(format!(
            "command '{}' is not in the builder allow-list: {}",
            program, command
        ))
    }
}

/// Make `path` absolute and fold `.` and `..` components lexically.
fn absolute(path: &Path) -> Option<PathBuf> {
    let path = std::path::absolute(path).ok()?;
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder() -> Identity {
        Identity {
            role: Role::Builder,
            worktree: PathBuf::from("/rig/cells/payments"),
            scope: "services/payments".into(),
        }
    }

    fn write(path: &str) -> Action {
        Action::Write {
            path: Some(path.into()),
        }
    }

    fn shell(command: &str) -> Action {
        Action::Shell {
            command: command.into(),
        }
    }

    #[test]
    fn test_reviewer_write_is_denied_anywhere() {
        let identity = Identity {
            role: Role::Reviewer,
            ..builder()
        };
        for path in ["services/payments/a.go", "/tmp/x", ""] {
            let verdict = decide(&write(path), &identity, &Policy::default());
            assert_eq!(verdict.decision, Decision::Deny, "{path}");
        }
    }

    #[test]
    fn test_traversal_out_of_scope_is_denied() {
        let verdict = decide(
            &write("services/payments/../../secrets.txt"),
            &builder(),
            &Policy::default(),
        );
        assert_eq!(verdict.decision, Decision::Deny);
        assert!(verdict.reason.contains("escapes scope"));
    }

    #[test]
    fn test_absolute_path_inside_scope_is_allowed() {
        let verdict = decide(
            &write("/rig/cells/payments/services/payments/api/handler.go"),
            &builder(),
            &Policy::default(),
        );
        assert!(verdict.is_allowed());
    }

    #[test]
    fn test_exact_scope_dir_is_allowed() {
        let verdict = decide(
            &write("services/payments"),
            &builder(),
            &Policy::default(),
        );
        assert!(verdict.is_allowed());
    }

    #[test]
    fn test_sibling_with_shared_prefix_is_denied() {
        let verdict = decide(
            &write("services/payments-legacy/a.go"),
            &builder(),
            &Policy::default(),
        );
        assert_eq!(verdict.decision, Decision::Deny);
    }

    #[test]
    fn test_builder_command_allow_list() {
        let policy = Policy::default();
        let denied = decide(&shell("rm -rf /"), &builder(), &policy);
        assert_eq!(denied.decision, Decision::Deny);
        assert!(denied.reason.contains("rm -rf /"));
        assert!(decide(&shell("go test ./..."), &builder(), &policy).is_allowed());
        assert!(decide(&shell("   "), &builder(), &policy).is_allowed());
    }

    #[test]
    fn test_read_only_roles_cannot_run_commands() {
        for role in [Role::Reviewer, Role::Monitor, Role::Architect] {
            let identity = Identity { role, ..builder() };
            let verdict = decide(&shell("git status"), &identity, &Policy::default());
            assert_eq!(verdict.decision, Decision::Deny);
        }
    }

    #[test]
    fn test_read_only_roles_are_configurable() {
        let policy = Policy {
            read_only_roles: vec![Role::Reviewer],
            ..Policy::default()
        };
        let architect = Identity {
            role: Role::Architect,
            ..builder()
        };
        assert!(decide(&write("services/payments/adr.md"), &architect, &policy).is_allowed());
        let reviewer = Identity {
            role: Role::Reviewer,
            ..builder()
        };
        assert!(!decide(&shell("ls"), &reviewer, &policy).is_allowed());
    }

    #[test]
    fn test_other_tools_are_allowed() {
        let identity = Identity {
            role: Role::Reviewer,
            ..builder()
        };
        let action = Action::from_tool("Read", &json!({"file_path": "/etc/passwd"}));
        assert!(decide(&action, &identity, &Policy::default()).is_allowed());
    }

    #[test]
    fn test_from_tool_classifies_inputs() {
        assert_eq!(
            Action::from_tool("Edit", &json!({"file_path": "a.rs"})),
            write("a.rs")
        );
        assert_eq!(
            Action::from_tool("NotebookEdit", &json!({"notebook_path": "n.ipynb"})),
            write("n.ipynb")
        );
        assert_eq!(
            Action::from_tool("Bash", &json!({"command": "make test"})),
            shell("make test")
        );
        assert_eq!(
            Action::from_tool("PermissionRequest", &json!({})),
            shell("")
        );
    }

    #[test]
    fn test_decide_is_repeatable() {
        let action = write("services/payments/../../secrets.txt");
        let first = decide(&action, &builder(), &Policy::default());
        let second = decide(&action, &builder(), &Policy::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_verdict_serializes_as_hook_reply() {
        let verdict = decide(&shell("rm x"), &builder(), &Policy::default());
        let value = serde_json::to_value(&verdict).unwrap();
        assert_eq!(value["decision"], "deny");
        assert!(value["reason"].as_str().unwrap().contains("rm"));
    }
}
