//! Declarative hook rules.
//!
//! Rules live in the `[[hooks]]` array of `.rig/rig.toml`:
//!
//! ```toml
//! [[hooks]]
//! event = "assignment_created"
//! cell = "pay*"
//! role = "builder"
//! command = "./scripts/notify.sh"
//! timeout_secs = 10
//! on_failure = "abort"
//! ```

use super::types::{HookEvent, OnFailure};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single hook rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRule {
    /// The event that triggers this rule
    pub event: HookEvent,

    /// Glob over the cell name. Unset matches every cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,

    /// Glob over the role name. Unset matches every role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Shell command, run through `sh -c` from the rig root.
    pub command: String,

    /// Working directory, relative to the rig root or absolute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub on_failure: OnFailure,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

impl HookRule {
    /// Create a new rule for `event` running `command`.
    pub fn command(event: HookEvent, command: impl Into<String>) -> Self {
        Self {
            event,
            cell: None,
            role: None,
            command: command.into(),
            working_dir: None,
            timeout_secs: default_timeout(),
            on_failure: OnFailure::Continue,
            enabled: true,
            description: None,
        }
    }

    pub fn for_cell(mut self, pattern: impl Into<String>) -> Self {
        self.cell = Some(pattern.into());
        self
    }

    pub fn for_role(mut self, pattern: impl Into<String>) -> Self {
        self.role = Some(pattern.into());
        self
    }

    /// Set the timeout for this rule.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn aborting(mut self) -> Self {
        self.on_failure = OnFailure::Abort;
        self
    }

    /// Disable this rule.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// True when the rule's filters accept this cell and role. A filter
    /// against a missing value only matches when the filter is unset.
    pub fn matches(&self, cell: Option<&str>, role: Option<&str>) -> bool {
        filter_matches(self.cell.as_deref(), cell) && filter_matches(self.role.as_deref(), role)
    }

    /// Validate this rule.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.command.trim().is_empty() {
            warnings.push(format!(
                "Hook for event '{}' has an empty command",
                self.event
            ));
        }
        if self.timeout_secs == 0 {
            warnings.push(format!(
                "Hook for event '{}' has timeout of 0 seconds",
                self.event
            ));
        }
        warnings
    }
}

fn filter_matches(pattern: Option<&str>, value: Option<&str>) -> bool {
    match (pattern, value) {
        (None, _) => true,
        (Some(pattern), Some(value)) => pattern_matches(pattern, value),
        (Some(_), None) => false,
    }
}

/// The rule table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub hooks: Vec<HookRule>,
}

impl HooksConfig {
    /// Parse rules from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse hook rules")
    }

    /// Enabled rules for `event` whose filters accept this cell and role, in
    /// declaration order.
    pub fn rules_for(
        &self,
        event: HookEvent,
        cell: Option<&str>,
        role: Option<&str>,
    ) -> Vec<&HookRule> {
        self.hooks
            .iter()
            .filter(|h| h.enabled && h.event == event && h.matches(cell, role))
            .collect()
    }

    /// Validate all rules and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.hooks.iter().flat_map(|h| h.validate()).collect()
    }

    /// Get the total number of enabled rules.
    pub fn enabled_hook_count(&self) -> usize {
        self.hooks.iter().filter(|h| h.enabled).count()
    }
}

/// Case-insensitive glob match supporting `*` and `?`.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern_lower = pattern.to_lowercase();
    let name_lower = name.to_lowercase();

    glob_match(&pattern_lower, &name_lower)
}

/// Simple glob matching implementation.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut pattern_chars = pattern.chars().peekable();
    let mut text_chars = text.chars().peekable();

    while let Some(p) = pattern_chars.next() {
        match p {
            '*' => {
                while pattern_chars.peek() == Some(&'*') {
                    pattern_chars.next();
                }
                if pattern_chars.peek().is_none() {
                    return true;
                }

                let remaining_pattern: String = pattern_chars.collect();
                let remaining_text: String = text_chars.collect();
                return remaining_text
                    .char_indices()
                    .map(|(i, _)| i)
                    .chain(std::iter::once(remaining_text.len()))
                    .any(|i| glob_match(&remaining_pattern, &remaining_text[i..]));
            }
            '?' => {
                if text_chars.next().is_none() {
                    return false;
                }
            }
            c => {
                if text_chars.next() != Some(c) {
                    return false;
                }
            }
        }
    }

    text_chars.next().is_none()
}
