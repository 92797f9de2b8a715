//! Per-worker heartbeat records under `.rig/heartbeats/`.
//!
//! The engine only writes these; dashboards read them. The same status is
//! mirrored onto the agent in the store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Agent, AgentStatus, Role, WorkStore};
use crate::util::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub cell: String,
    pub role: Role,
    pub status: AgentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Heartbeat {
    pub fn new(cell: &str, role: Role, status: AgentStatus) -> Self {
        Self {
            cell: cell.to_string(),
            role,
            status,
            timestamp: Utc::now(),
            assignment_id: None,
            message: None,
        }
    }

    pub fn with_assignment(mut self, id: impl Into<String>) -> Self {
        self.assignment_id = Some(id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub fn heartbeat_path(rig_dir: &Path, cell: &str, role: Role) -> PathBuf {
    rig_dir
        .join("heartbeats")
        .join(format!("{}-{}.json", cell, role.as_str()))
}

/// Write the heartbeat file and mirror the status onto the agent.
pub fn record(rig_dir: &Path, store: &dyn WorkStore, heartbeat: &Heartbeat) -> Result<()> {
    let path = heartbeat_path(rig_dir, &heartbeat.cell, heartbeat.role);
    write_json_atomic(&path, heartbeat)
        .with_context(|| format!("Failed to write heartbeat {}", path.display()))?;
    let agent_id = Agent::id_for(&heartbeat.cell, heartbeat.role);
    store
        .update_agent_status(&agent_id, heartbeat.status, heartbeat.timestamp)
        .with_context(|| format!("Failed to update status of {}", agent_id))?;
    tracing::debug!(agent = %agent_id, status = %heartbeat.status, "Heartbeat recorded");
    Ok(())
}

/// Last heartbeat written for (cell, role), if any.
pub fn load(rig_dir: &Path, cell: &str, role: Role) -> Option<Heartbeat> {
    let raw = std::fs::read_to_string(heartbeat_path(rig_dir, cell, role)).ok()?;
    serde_json::from_str(&raw).ok()
}
