//! Read-side aggregation of what happened during a turn.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::TurnRecord;
use crate::router;
use crate::store::{Cell, WorkItem, WorkItemFilter, WorkKind, WorkStore};
use crate::tracker::git::GitTracker;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CellSummary {
    pub cell: String,
    pub commits: usize,
    pub items_done: usize,
    pub items_open: usize,
    /// False when the worktree could not be read as a git repository.
    pub tracked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnSummary {
    pub turn_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub window_end: DateTime<Utc>,
    pub commits: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub done_by_kind: BTreeMap<String, usize>,
    pub open_by_kind: BTreeMap<String, usize>,
    pub cells: Vec<CellSummary>,
}

impl TurnSummary {
    pub fn items_done(&self) -> usize {
        self.done_by_kind.values().sum()
    }

    pub fn items_open(&self) -> usize {
        self.open_by_kind.values().sum()
    }
}

/// Compute the summary for `turn`. Nothing is written.
///
/// Commits are counted once even when several cell worktrees share history.
/// Work items count as done when they finished inside the window and as open
/// when they existed by the window end and have not finished.
pub fn compute(
    store: &dyn WorkStore,
    cells: &[Cell],
    turn: &TurnRecord,
    now: DateTime<Utc>,
) -> Result<TurnSummary> {
    let since = turn.started_at;
    let until = turn.window_end(now);

    let items: Vec<WorkItem> = store
        .list_work_items(&WorkItemFilter::default())?
        .into_iter()
        .filter(|item| item.kind != WorkKind::Turn)
        .collect();
    let done: Vec<&WorkItem> = items
        .iter()
        .filter(|i| i.status.is_finished() && i.updated_at >= since && i.updated_at <= until)
        .collect();
    let open: Vec<&WorkItem> = items
        .iter()
        .filter(|i| !i.status.is_finished() && i.created_at <= until)
        .collect();

    let mut summary = TurnSummary {
        turn_id: turn.id.clone(),
        name: turn.name.clone(),
        started_at: since,
        ended_at: turn.ended_at,
        window_end: until,
        commits: 0,
        lines_added: 0,
        lines_removed: 0,
        done_by_kind: count_by_kind(&done),
        open_by_kind: count_by_kind(&open),
        cells: Vec::new(),
    };

    let mut seen = HashSet::new();
    for cell in cells {
        let mut cell_summary = CellSummary {
            cell: cell.name.clone(),
            items_done: done.iter().filter(|i| owner(i, cells) == Some(&cell.name)).count(),
            items_open: open.iter().filter(|i| owner(i, cells) == Some(&cell.name)).count(),
            ..Default::default()
        };

        match GitTracker::new(&cell.worktree_path) {
            Ok(tracker) => {
                let stats = tracker.window_stats_excluding(since, until, &seen)?;
                cell_summary.tracked = true;
                cell_summary.commits = stats.commits.len();
                summary.commits += stats.commits.len();
                summary.lines_added += stats.lines_added;
                summary.lines_removed += stats.lines_removed;
                seen.extend(stats.commits);
            }
            Err(e) => {
                tracing::debug!(cell = %cell.name, error = %e, "Cell worktree is not a git repository");
            }
        }
        summary.cells.push(cell_summary);
    }

    Ok(summary)
}

fn count_by_kind(items: &[&WorkItem]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(item.kind.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Cell a work item belongs to: its metadata cell, else its routed scope.
fn owner<'a>(item: &'a WorkItem, cells: &'a [Cell]) -> Option<&'a String> {
    if let Some(cell) = cells
        .iter()
        .find(|c| item.metadata().cell.as_deref() == Some(c.name.as_str()))
    {
        return Some(&cell.name);
    }
    if item.scope.is_empty() {
        return None;
    }
    router::route(&item.scope, cells).map(|c| &c.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewWorkItem, SqliteStore, WorkStatus};
    use crate::tracker::git::testing::{commit_at, init_repo};
    use chrono::Duration;
    use tempfile::tempdir;

    fn turn(hours_ago: i64) -> TurnRecord {
        TurnRecord {
            id: "wi-turn".into(),
            name: "sprint".into(),
            started_at: Utc::now() - Duration::hours(hours_ago),
            ended_at: None,
        }
    }

    #[test]
    fn test_counts_items_by_kind_and_cell() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        let cells = vec![
            Cell::new("alpha", "apps/alpha", dir.path().join("alpha")),
            Cell::new("beta", "apps/beta", dir.path().join("beta")),
        ];
        let done = store
            .create_work_item(&NewWorkItem::new(WorkKind::Task, "a").with_scope("apps/alpha/x"))
            .unwrap();
        store.advance_work_item(&done.id, WorkStatus::Done).unwrap();
        store
            .create_work_item(&NewWorkItem::new(WorkKind::Review, "b").with_scope("apps/beta"))
            .unwrap();
        store
            .create_work_item(&NewWorkItem::new(WorkKind::Turn, "sprint"))
            .unwrap();

        let summary = compute(&store, &cells, &turn(1), Utc::now()).unwrap();
        assert_eq!(summary.done_by_kind.get("task"), Some(&1));
        assert_eq!(summary.open_by_kind.get("review"), Some(&1));
        assert!(!summary.open_by_kind.contains_key("turn"));
        assert_eq!(summary.items_done(), 1);
        assert_eq!(summary.cells[0].items_done, 1);
        assert_eq!(summary.cells[1].items_open, 1);
        assert!(!summary.cells[0].tracked);
        assert_eq!(summary.commits, 0);
    }

    #[test]
    fn test_commits_in_window_per_cell() {
        let dir = tempdir().unwrap();
        let alpha = dir.path().join("alpha");
        std::fs::create_dir_all(&alpha).unwrap();
        init_repo(&alpha);
        let now = Utc::now();
        commit_at(&alpha, "old.txt", "x\n", "old", (now - Duration::days(2)).timestamp());
        commit_at(&alpha, "new.txt", "a\nb\n", "new", (now - Duration::minutes(10)).timestamp());

        let store = SqliteStore::open_in_memory().unwrap();
        let cells = vec![Cell::new("alpha", "apps/alpha", alpha)];
        let summary = compute(&store, &cells, &turn(1), now).unwrap();
        assert_eq!(summary.commits, 1);
        assert_eq!(summary.lines_added, 2);
        assert_eq!(summary.cells[0].commits, 1);
        assert!(summary.cells[0].tracked);
    }

    #[test]
    fn test_closed_turn_uses_recorded_end() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = store
            .create_work_item(&NewWorkItem::new(WorkKind::Task, "late"))
            .unwrap();
        store.advance_work_item(&item.id, WorkStatus::Done).unwrap();

        let mut closed = turn(3);
        closed.ended_at = Some(Utc::now() - Duration::hours(2));
        let summary = compute(&store, &[], &closed, Utc::now()).unwrap();
        assert_eq!(summary.window_end, closed.ended_at.unwrap());
        assert_eq!(summary.items_done(), 0);
        assert_eq!(summary.items_open(), 0);
    }
}
