use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::TurnRecord;
use crate::util::write_json_atomic;

/// Active-turn pointer plus an append-only history of closed turns.
pub struct TurnLedger {
    active_file: PathBuf,
    history_file: PathBuf,
}

impl TurnLedger {
    /// Ledger stored under `<rig_dir>/state/`.
    pub fn new(rig_dir: &Path) -> Self {
        let state = rig_dir.join("state");
        Self {
            active_file: state.join("turn.json"),
            history_file: state.join("turns.jsonl"),
        }
    }

    /// The active turn, if one is recorded.
    ///
    /// An unreadable pointer is reported as no turn rather than an error so a
    /// damaged file never blocks starting a fresh one.
    pub fn active(&self) -> Option<TurnRecord> {
        let raw = fs::read_to_string(&self.active_file).ok()?;
        match serde_json::from_str::<TurnRecord>(&raw) {
            Ok(record) if record.ended_at.is_none() => Some(record),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %self.active_file.display(), error = %e, "Ignoring unreadable turn pointer");
                None
            }
        }
    }

    pub fn set_active(&self, record: &TurnRecord) -> Result<()> {
        write_json_atomic(&self.active_file, record).context("Failed to write active turn")
    }

    pub fn clear_active(&self) -> Result<()> {
        if self.active_file.exists() {
            fs::remove_file(&self.active_file).context("Failed to clear active turn")?;
        }
        Ok(())
    }

    /// Append a closed turn to the history.
    pub fn record_closed(&self, record: &TurnRecord) -> Result<()> {
        if let Some(parent) = self.history_file.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let mut line = serde_json::to_string(record).context("Failed to serialize turn")?;
        line.push('\n');

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_file)
            .context("Failed to open turn history")?
            .write_all(line.as_bytes())
            .context("Failed to write turn history")?;
        Ok(())
    }

    /// Closed turns, oldest first. Malformed lines are skipped.
    pub fn history(&self) -> Result<Vec<TurnRecord>> {
        if !self.history_file.exists() {
            return Ok(Vec::new());
        }
        let content =
            fs::read_to_string(&self.history_file).context("Failed to read turn history")?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// A turn by id, active or closed.
    pub fn find(&self, id: &str) -> Result<Option<TurnRecord>> {
        if let Some(active) = self.active().filter(|t| t.id == id) {
            return Ok(Some(active));
        }
        Ok(self.history()?.into_iter().rev().find(|t| t.id == id))
    }
}
