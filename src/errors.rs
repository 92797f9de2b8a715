//! Typed error hierarchy for the cellrig engine.
//!
//! Two enums cover the failure classes that callers need to tell apart:
//! - `RigError`: configuration, routing, quota, lookup and external-process failures
//! - `HookError`: a hook rule configured to abort its event
//!
//! Transient I/O (a missing outbox, an absent session) and guardrail denials are
//! not errors and never appear here.

use thiserror::Error;

/// Errors raised by the scheduling engine and its collaborators.
#[derive(Debug, Error)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No cell owns scope '{scope}'")]
    NoCellForScope { scope: String },

    #[error(
        "Work item quota exceeded for cell '{cell}' in turn '{turn}': {count} existing, limit {limit}"
    )]
    QuotaExceeded {
        cell: String,
        turn: String,
        limit: u32,
        count: u32,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("No active turn. Run 'cellrig turn start <name>' first.")]
    NoActiveTurn,

    #[error("Command `{command}` failed: {stderr}")]
    ExternalCommand { command: String, stderr: String },

    #[error("Command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RigError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True when the failure is a quota refusal a caller may retry later.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Errors from the declarative hook rule table.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Hook for event '{event}' aborted: {reason}")]
    Aborted { event: String, reason: String },
}
