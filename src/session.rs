//! Worker terminal sessions.
//!
//! The engine only ever asks four things of a session backend: is a session
//! live, start one, type a line into one, and stop one. [`TmuxSessions`]
//! answers them by shelling out to `tmux`, each call bounded by a timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::RigError;
use crate::store::{Cell, Role};

pub const DEFAULT_SESSION_PREFIX: &str = "rig";

/// Line typed into a live session when new work is queued for it.
pub const WAKE_MESSAGE: &str =
    "New work is queued for you. Stop now to receive your next assignment.";

/// Variables set in every worker session so hooks can recover the worker.
pub const ROOT_ENV: &str = "RIG_ROOT";
pub const NAME_ENV: &str = "RIG_NAME";
pub const CELL_ENV: &str = "RIG_CELL";
pub const ROLE_ENV: &str = "RIG_ROLE";
pub const WORKTREE_ENV: &str = "RIG_WORKTREE";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session handle for a worker: `<prefix>-<rig>-<cell>-<role>`.
///
/// Characters tmux treats specially in target names are replaced with `-`.
pub fn handle_for(prefix: &str, rig: &str, cell: &str, role: Role) -> String {
    let raw = format!("{}-{}-{}-{}", prefix, rig, cell, role.as_str());
    raw.chars()
        .map(|c| match c {
            '.' | ':' | '/' | ' ' => '-',
            c => c,
        })
        .collect()
}

/// Environment for the session of `role` in `cell`.
pub fn worker_env(root: &Path, rig: &str, cell: &Cell, role: Role) -> Vec<(String, String)> {
    vec![
        (ROOT_ENV.to_string(), root.display().to_string()),
        (NAME_ENV.to_string(), rig.to_string()),
        (CELL_ENV.to_string(), cell.name.clone()),
        (ROLE_ENV.to_string(), role.as_str().to_string()),
        (
            WORKTREE_ENV.to_string(),
            cell.worktree_path.display().to_string(),
        ),
    ]
}

/// How a worker session is launched.
#[derive(Debug, Clone)]
pub struct SessionSpec<'a> {
    pub handle: &'a str,
    pub command: &'a str,
    pub working_dir: &'a Path,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn is_live(&self, handle: &str) -> Result<bool>;
    async fn start(&self, spec: &SessionSpec<'_>) -> Result<()>;
    /// Type `text` into the session followed by Enter.
    async fn send_keys(&self, handle: &str, text: &str) -> Result<()>;
    async fn stop(&self, handle: &str) -> Result<()>;
}

/// tmux-backed sessions.
pub struct TmuxSessions {
    program: String,
    timeout: Duration,
}

impl Default for TmuxSessions {
    fn default() -> Self {
        Self {
            program: "tmux".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TmuxSessions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        let rendered = format!("{} {}", self.program, args.join(" "));
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", rendered))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.with_context(|| format!("Failed to wait for `{}`", rendered)),
            Err(_) => Err(RigError::Timeout {
                command: rendered,
                secs: self.timeout.as_secs(),
            }
            .into()),
        }
    }

    async fn run_checked(&self, args: &[String]) -> Result<()> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(RigError::ExternalCommand {
                command: format!("{} {}", self.program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl SessionBackend for TmuxSessions {
    async fn is_live(&self, handle: &str) -> Result<bool> {
        let target = format!("={}", handle);
        match self.run(&args(&["has-session", "-t", &target])).await {
            Ok(output) => Ok(output.status.success()),
            Err(e) => {
                tracing::debug!(handle, error = %e, "Session check failed, treating as not live");
                Ok(false)
            }
        }
    }

    async fn start(&self, spec: &SessionSpec<'_>) -> Result<()> {
        let dir = spec.working_dir.to_string_lossy().into_owned();
        let mut cmd = args(&["new-session", "-d", "-s", spec.handle, "-c", &dir]);
        for (key, value) in &spec.env {
            cmd.push("-e".to_string());
            cmd.push(format!("{}={}", key, value));
        }
        cmd.push(spec.command.to_string());
        self.run_checked(&cmd).await
    }

    async fn send_keys(&self, handle: &str, text: &str) -> Result<()> {
        self.run_checked(&args(&["send-keys", "-t", handle, "-l", text]))
            .await?;
        self.run_checked(&args(&["send-keys", "-t", handle, "Enter"]))
            .await
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.run_checked(&args(&["kill-session", "-t", handle])).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_for() {
        assert_eq!(
            handle_for("rig", "demo", "alpha", Role::Builder),
            "rig-demo-alpha-builder"
        );
        assert_eq!(
            handle_for("rig", "my.app", "api:v2", Role::Reviewer),
            "rig-my-app-api-v2-reviewer"
        );
    }

    #[test]
    fn test_worker_env_names_the_worker() {
        let cell = Cell::new("alpha", "apps/alpha", "/rig/cells/alpha");
        let env = worker_env(Path::new("/rig"), "demo", &cell, Role::Reviewer);
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get(ROOT_ENV), Some("/rig"));
        assert_eq!(get(CELL_ENV), Some("alpha"));
        assert_eq!(get(ROLE_ENV), Some("reviewer"));
        assert_eq!(get(WORKTREE_ENV), Some("/rig/cells/alpha"));
    }

    #[tokio::test]
    async fn test_missing_program_is_not_live() {
        let sessions = TmuxSessions {
            program: "cellrig-no-such-multiplexer".into(),
            timeout: Duration::from_secs(2),
        };
        assert!(!sessions.is_live("anything").await.unwrap());
        assert!(sessions.stop("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_failing_command_carries_stderr() {
        let sessions = TmuxSessions {
            program: "sh".into(),
            timeout: Duration::from_secs(2),
        };
        // `sh kill-session -t x` fails because there is no such script.
        let err = sessions.stop("x").await.unwrap_err();
        match err.downcast_ref::<RigError>() {
            Some(RigError::ExternalCommand { command, .. }) => {
                assert!(command.starts_with("sh kill-session"));
            }
            other => panic!("Expected external command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fake_sessions_record_keys() {
        let fake = fake::FakeSessions::with_live(&["rig-demo-alpha-builder"]);
        assert!(fake.is_live("rig-demo-alpha-builder").await.unwrap());
        fake.send_keys("rig-demo-alpha-builder", "check inbox")
            .await
            .unwrap();
        assert_eq!(fake.sent().len(), 1);
    }
}
