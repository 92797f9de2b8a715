//! Runs a single hook rule as a child process.
//!
//! The command runs through `sh -c` with the JSON context on stdin and
//! `RIG_EVENT`, `RIG_CELL`, `RIG_ROLE` in its environment. A command that
//! outlives its timeout is killed.

use super::config::HookRule;
use super::types::HookContext;
use crate::errors::RigError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Result of one finished hook command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRun {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl HookRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct HookExecutor {
    /// Rig root, the default working directory
    root: PathBuf,
}

impl HookExecutor {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Run `rule` with `context`.
    ///
    /// A command that could not be spawned or did not finish in time is an
    /// error; a non-zero exit is reported through [`HookRun::exit_code`].
    pub async fn execute(&self, rule: &HookRule, context: &HookContext) -> Result<HookRun> {
        let working_dir = rule
            .working_dir
            .as_ref()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.root.join(p)
                }
            })
            .unwrap_or_else(|| self.root.clone());

        let context_json =
            serde_json::to_string(context).context("Failed to serialize hook context to JSON")?;

        tracing::debug!(
            command = %rule.command,
            event = %context.event,
            timeout_secs = rule.timeout_secs,
            "Running hook"
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&rule.command)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("RIG_EVENT", context.event.as_str())
            .env("RIG_CELL", context.cell.as_deref().unwrap_or(""))
            .env("RIG_ROLE", context.role.as_deref().unwrap_or(""))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn hook command: {}", rule.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(context_json.as_bytes()).await {
                tracing::debug!(error = %e, "Hook command did not read its context");
            }
        }

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match timeout(
            Duration::from_secs(rule.timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(result) => result.context("Failed to wait for hook command")?,
            Err(_) => {
                return Err(RigError::Timeout {
                    command: rule.command.clone(),
                    secs: rule.timeout_secs,
                }
                .into());
            }
        };

        let run = HookRun {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        tracing::debug!(exit_code = run.exit_code, "Hook finished");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::types::HookEvent;
    use tempfile::tempdir;

    fn context() -> HookContext {
        HookContext::new(HookEvent::RoundStart, "demo")
            .with_cell("alpha")
            .with_role("builder")
    }

    #[tokio::test]
    async fn test_execute_success_receives_env_and_stdin() {
        let dir = tempdir().unwrap();
        let executor = HookExecutor::new(dir.path());
        let rule = HookRule::command(
            HookEvent::RoundStart,
            "printf '%s %s %s ' \"$RIG_EVENT\" \"$RIG_CELL\" \"$RIG_ROLE\"; cat",
        );

        let run = executor.execute(&rule, &context()).await.unwrap();
        assert!(run.success());
        assert!(run.stdout.starts_with("round_start alpha builder {"));
        assert!(run.stdout.contains("\"rig\":\"demo\""));
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let dir = tempdir().unwrap();
        let executor = HookExecutor::new(dir.path());
        let rule = HookRule::command(HookEvent::RoundStart, "echo 'nope' >&2; exit 3");

        let run = executor.execute(&rule, &context()).await.unwrap();
        assert!(!run.success());
        assert_eq!(run.exit_code, 3);
        assert_eq!(run.stderr, "nope");
    }

    #[tokio::test]
    async fn test_execute_runs_in_working_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("scripts")).unwrap();
        let executor = HookExecutor::new(dir.path());
        let mut rule = HookRule::command(HookEvent::RoundStart, "pwd");
        rule.working_dir = Some(PathBuf::from("scripts"));

        let run = executor.execute(&rule, &context()).await.unwrap();
        assert!(run.stdout.ends_with("scripts"));
    }

    #[tokio::test]
    async fn test_execute_timeout_is_error() {
        let dir = tempdir().unwrap();
        let executor = HookExecutor::new(dir.path());
        let rule = HookRule::command(HookEvent::RoundStart, "sleep 5").with_timeout(1);

        let start = std::time::Instant::now();
        let err = executor.execute(&rule, &context()).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(matches!(
            err.downcast_ref::<RigError>(),
            Some(RigError::Timeout { secs: 1, .. })
        ));
    }
}
