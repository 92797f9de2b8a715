//! Per-(cell, turn) work item creation limit.

use anyhow::Result;

use crate::errors::RigError;
use crate::store::{WorkItemFilter, WorkStore};

/// Environment variable that sets the limit.
pub const LIMIT_ENV: &str = "RIG_BEAD_LIMIT_PER_CELL_TURN";

/// Parse a configured limit. Blank and `0` disable the check.
pub fn parse_limit(raw: &str) -> Result<Option<u32>, RigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let limit: u32 = raw.parse().map_err(|_| {
        RigError::Config(format!(
            "{} must be a non-negative integer, got '{}'",
            LIMIT_ENV, raw
        ))
    })?;
    Ok((limit > 0).then_some(limit))
}

/// Work items whose metadata names both `cell` and `turn_id`.
pub fn count(store: &dyn WorkStore, cell: &str, turn_id: &str) -> Result<u32> {
    let items = store.list_work_items(&WorkItemFilter::default())?;
    let count = items
        .iter()
        .map(|item| item.metadata())
        .filter(|meta| {
            meta.cell.as_deref() == Some(cell) && meta.turn_id.as_deref() == Some(turn_id)
        })
        .count();
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Refuse with [`RigError::QuotaExceeded`] when (cell, turn) is at its limit.
pub fn check(store: &dyn WorkStore, cell: &str, turn_id: &str, limit: Option<u32>) -> Result<()> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let count = count(store, cell, turn_id)?;
    if count >= limit {
        return Err(RigError::QuotaExceeded {
            cell: cell.to_string(),
            turn: turn_id.to_string(),
            limit,
            count,
        }
        .into());
    }
    Ok(())
}
