//! Evaluates the rule table for an event.

use super::config::HooksConfig;
use super::executor::HookExecutor;
use super::types::{HookContext, OnFailure};
use crate::errors::HookError;
use anyhow::Result;
use std::path::Path;

/// Matches rules to events and runs them in declaration order.
pub struct HookManager {
    config: HooksConfig,
    executor: HookExecutor,
}

impl HookManager {
    pub fn new(root: impl AsRef<Path>, config: HooksConfig) -> Self {
        Self {
            config,
            executor: HookExecutor::new(root),
        }
    }

    /// A manager with no rules, for callers that do not fire hooks.
    pub fn disabled() -> Self {
        Self::new(".", HooksConfig::default())
    }

    /// Get count of enabled rules.
    pub fn hook_count(&self) -> usize {
        self.config.enabled_hook_count()
    }

    /// Validate all rules and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.config.validate()
    }

    /// Run every matching rule for `context`, one after another.
    ///
    /// A failing rule (non-zero exit, spawn failure or timeout) is logged and
    /// skipped unless it is marked `on_failure = "abort"`, in which case the
    /// remaining rules are not run and [`HookError::Aborted`] is returned.
    /// Returns the number of rules that ran successfully.
    pub async fn fire(&self, context: &HookContext) -> Result<usize> {
        let rules = self.config.rules_for(
            context.event,
            context.cell.as_deref(),
            context.role.as_deref(),
        );
        let mut succeeded = 0;

        for rule in rules {
            let failure = match self.executor.execute(rule, context).await {
                Ok(run) if run.success() => {
                    succeeded += 1;
                    continue;
                }
                Ok(run) => {
                    let detail = if run.stderr.is_empty() {
                        run.stdout
                    } else {
                        run.stderr
                    };
                    format!("`{}` exited with {}: {}", rule.command, run.exit_code, detail)
                }
                Err(e) => format!("{:#}", e),
            };

            match rule.on_failure {
                OnFailure::Abort => {
                    tracing::error!(event = %context.event, %failure, "Hook aborted event");
                    return Err(HookError::Aborted {
                        event: context.event.to_string(),
                        reason: failure,
                    }
                    .into());
                }
                OnFailure::Continue => {
                    tracing::warn!(event = %context.event, %failure, "Hook failed, continuing");
                }
            }
        }

        Ok(succeeded)
    }
}
