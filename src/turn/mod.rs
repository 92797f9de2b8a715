//! Turns: time-boxed orchestration cycles.
//!
//! A turn is backed by a work item of kind `turn` whose id doubles as the turn
//! id. At most one turn is active per rig; starting a new one closes the
//! previous one first. Rounds ([`round`]) run inside an open turn.

pub mod report;
pub mod round;
pub mod state;
pub mod summary;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::RigContext;
use crate::hooks::{HookContext, HookEvent, HookManager};
use crate::metadata::{Metadata, with_metadata};
use crate::store::{NewWorkItem, WorkKind, WorkStatus};

pub use state::TurnLedger;
pub use summary::TurnSummary;

/// A turn as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TurnRecord {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// End of the summary window: the recorded end, or `now` while open.
    pub fn window_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.ended_at.unwrap_or(now)
    }
}

/// What closing a turn produced.
#[derive(Debug)]
pub struct TurnClosed {
    pub record: TurnRecord,
    pub summary: Option<TurnSummary>,
    pub report_path: Option<PathBuf>,
}

/// Open a new turn named `name`, closing any active one first.
pub async fn start(
    ctx: &mut RigContext,
    ledger: &TurnLedger,
    hooks: &HookManager,
    name: &str,
) -> Result<TurnRecord> {
    if ctx.turn.is_some() {
        let closed = end(ctx, ledger, hooks, false).await?;
        info!(turn = %closed.record.id, "Closed previous turn");
    }

    let meta = Metadata {
        rig: Some(ctx.name.clone()),
        kind: Some(WorkKind::Turn.to_string()),
        title: Some(name.to_string()),
        ..Default::default()
    };
    let item = ctx
        .store
        .create_work_item(
            &NewWorkItem::new(WorkKind::Turn, name)
                .with_description(with_metadata(&format!("Turn {}", name), &meta)),
        )
        .context("Failed to create turn work item")?;
    ctx.store.advance_work_item(&item.id, WorkStatus::InProgress)?;

    let record = TurnRecord {
        id: item.id,
        name: name.to_string(),
        started_at: item.created_at,
        ended_at: None,
    };
    ledger.set_active(&record)?;
    ctx.turn = Some(record.clone());
    info!(turn = %record.id, name = %record.name, "Turn started");

    hooks
        .fire(
            &HookContext::new(HookEvent::TurnStart, &ctx.name)
                .with_turn(Some(&record.id))
                .with_extra("name", serde_json::json!(record.name)),
        )
        .await?;
    Ok(record)
}

/// Close the active turn. With `write_report`, compute the summary and write
/// it to `.rig/reports/<turn>.md`.
pub async fn end(
    ctx: &mut RigContext,
    ledger: &TurnLedger,
    hooks: &HookManager,
    write_report: bool,
) -> Result<TurnClosed> {
    let mut record = ctx.require_turn()?.clone();
    let now = Utc::now();
    record.ended_at = Some(now);

    if let Err(e) = ctx.store.advance_work_item(&record.id, WorkStatus::Closed) {
        warn!(turn = %record.id, error = %e, "Failed to close turn work item");
    }
    ledger.record_closed(&record)?;
    ledger.clear_active()?;
    ctx.turn = None;

    let (summary, report_path) = if write_report {
        let cells = ctx.store.list_cells()?;
        let summary = summary::compute(ctx.store.as_ref(), &cells, &record, now)?;
        let path = report::write(&ctx.rig_dir(), &summary)?;
        (Some(summary), Some(path))
    } else {
        (None, None)
    };

    info!(turn = %record.id, "Turn ended");
    hooks
        .fire(
            &HookContext::new(HookEvent::TurnEnd, &ctx.name)
                .with_turn(Some(&record.id))
                .with_extra("name", serde_json::json!(record.name)),
        )
        .await?;

    Ok(TurnClosed {
        record,
        summary,
        report_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;

    #[tokio::test]
    async fn test_start_then_end_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.turn = None;
        let ledger = TurnLedger::new(&ctx.rig_dir());
        let hooks = HookManager::disabled();

        let record = start(&mut ctx, &ledger, &hooks, "sprint-2").await.unwrap();
        assert_eq!(ctx.turn_id(), Some(record.id.as_str()));
        assert_eq!(ledger.active().unwrap().id, record.id);
        let item = ctx.store.get_work_item(&record.id).unwrap().unwrap();
        assert_eq!(item.kind, WorkKind::Turn);
        assert_eq!(item.status, WorkStatus::InProgress);

        let closed = end(&mut ctx, &ledger, &hooks, true).await.unwrap();
        assert!(ctx.turn.is_none());
        assert!(ledger.active().is_none());
        assert!(closed.record.ended_at.is_some());
        assert!(closed.report_path.unwrap().is_file());

        let history = ledger.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, record.id);
        let item = ctx.store.get_work_item(&record.id).unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Closed);
    }

    #[tokio::test]
    async fn test_starting_a_turn_closes_the_active_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.turn = None;
        let ledger = TurnLedger::new(&ctx.rig_dir());
        let hooks = HookManager::disabled();

        let first = start(&mut ctx, &ledger, &hooks, "one").await.unwrap();
        let second = start(&mut ctx, &ledger, &hooks, "two").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(ledger.active().unwrap().id, second.id);
        assert_eq!(ledger.history().unwrap()[0].id, first.id);
    }

    #[tokio::test]
    async fn test_end_without_turn_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.turn = None;
        let ledger = TurnLedger::new(&ctx.rig_dir());
        let err = end(&mut ctx, &ledger, &HookManager::disabled(), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::errors::RigError>(),
            Some(crate::errors::RigError::NoActiveTurn)
        ));
    }

    #[test]
    fn test_window_end() {
        let now = Utc::now();
        let mut record = TurnRecord {
            id: "t".into(),
            name: "t".into(),
            started_at: now,
            ended_at: None,
        };
        assert!(record.is_active());
        assert_eq!(record.window_end(now), now);
        let ended = now - chrono::Duration::minutes(5);
        record.ended_at = Some(ended);
        assert_eq!(record.window_end(now), ended);
    }
}
