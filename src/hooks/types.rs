//! Hook events and the context handed to hook commands.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Engine events that can trigger hook rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    TurnStart,
    TurnEnd,
    RoundStart,
    RoundReview,
    RoundMerge,
    AssignmentCreated,
    AssignmentClaimed,
    AssignmentDone,
    /// A worker asked for work and none was eligible.
    AgentIdle,
}

impl HookEvent {
    /// Returns all possible hook events.
    pub fn all() -> &'static [HookEvent] {
        &[
            HookEvent::TurnStart,
            HookEvent::TurnEnd,
            HookEvent::RoundStart,
            HookEvent::RoundReview,
            HookEvent::RoundMerge,
            HookEvent::AssignmentCreated,
            HookEvent::AssignmentClaimed,
            HookEvent::AssignmentDone,
            HookEvent::AgentIdle,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::TurnStart => "turn_start",
            HookEvent::TurnEnd => "turn_end",
            HookEvent::RoundStart => "round_start",
            HookEvent::RoundReview => "round_review",
            HookEvent::RoundMerge => "round_merge",
            HookEvent::AssignmentCreated => "assignment_created",
            HookEvent::AssignmentClaimed => "assignment_claimed",
            HookEvent::AssignmentDone => "assignment_done",
            HookEvent::AgentIdle => "agent_idle",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', "_");
        HookEvent::all()
            .iter()
            .copied()
            .find(|e| e.as_str() == normalized || e.as_str().replace('_', "") == normalized)
            .ok_or_else(|| {
                let valid: Vec<&str> = HookEvent::all().iter().map(|e| e.as_str()).collect();
                anyhow::anyhow!(
                    "Invalid hook event '{}'. Valid values: {}",
                    s,
                    valid.join(", ")
                )
            })
    }
}

/// What to do with the triggering event when a rule's command fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Fail the event.
    Abort,
    /// Log and carry on with the remaining rules.
    #[default]
    Continue,
}

/// Context passed to hook commands as JSON on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEvent,
    pub rig: String,
    #[serde(default)]
    pub cell: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub assignment_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl HookContext {
    pub fn new(event: HookEvent, rig: impl Into<String>) -> Self {
        Self {
            event,
            rig: rig.into(),
            cell: None,
            role: None,
            turn_id: None,
            work_item_id: None,
            assignment_id: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_cell(mut self, cell: impl Into<String>) -> Self {
        self.cell = Some(cell.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_turn(mut self, turn_id: Option<&str>) -> Self {
        self.turn_id = turn_id.map(str::to_string);
        self
    }

    pub fn with_work_item(mut self, id: impl Into<String>) -> Self {
        self.work_item_id = Some(id.into());
        self
    }

    pub fn with_assignment(mut self, id: impl Into<String>) -> Self {
        self.assignment_id = Some(id.into());
        self
    }

    /// Add extra data to the context.
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}
