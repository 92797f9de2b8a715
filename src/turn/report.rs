use anyhow::Result;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::TurnSummary;
use crate::util::write_atomic;

/// Path of the report for a turn.
pub fn report_path(rig_dir: &Path, turn_id: &str) -> PathBuf {
    rig_dir.join("reports").join(format!("{}.md", turn_id))
}

/// Render a summary as markdown.
pub fn render(summary: &TurnSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Turn report: {}", summary.name);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Turn: `{}`", summary.turn_id);
    let _ = writeln!(out, "- Started: {}", summary.started_at.to_rfc3339());
    match summary.ended_at {
        Some(ended) => {
            let _ = writeln!(out, "- Ended: {}", ended.to_rfc3339());
        }
        None => {
            let _ = writeln!(out, "- Ended: (open, as of {})", summary.window_end.to_rfc3339());
        }
    }
    let _ = writeln!(
        out,
        "- Commits: {} (+{} / -{})",
        summary.commits, summary.lines_added, summary.lines_removed
    );
    let _ = writeln!(
        out,
        "- Work items: {} done, {} open",
        summary.items_done(),
        summary.items_open()
    );

    if !summary.done_by_kind.is_empty() || !summary.open_by_kind.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Work items by kind");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Kind | Done | Open |");
        let _ = writeln!(out, "|------|------|------|");
        let mut kinds: Vec<&String> = summary
            .done_by_kind
            .keys()
            .chain(summary.open_by_kind.keys())
            .collect();
        kinds.sort();
        kinds.dedup();
        for kind in kinds {
            let _ = writeln!(
                out,
                "| {} | {} | {} |",
                kind,
                summary.done_by_kind.get(kind).unwrap_or(&0),
                summary.open_by_kind.get(kind).unwrap_or(&0)
            );
        }
    }

    if !summary.cells.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Cells");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Cell | Commits | Done | Open |");
        let _ = writeln!(out, "|------|---------|------|------|");
        for cell in &summary.cells {
            let commits = if cell.tracked {
                cell.commits.to_string()
            } else {
                "n/a".to_string()
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} |",
                cell.cell, commits, cell.items_done, cell.items_open
            );
        }
    }
    out
}

/// Write the report under `.rig/reports/` and return its path.
pub fn write(rig_dir: &Path, summary: &TurnSummary) -> Result<PathBuf> {
    let path = report_path(rig_dir, &summary.turn_id);
    write_atomic(&path, &render(summary))?;
    tracing::info!(path = %path.display(), "Turn report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::summary::CellSummary;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn summary() -> TurnSummary {
        let now = Utc::now();
        TurnSummary {
            turn_id: "wi-1".into(),
            name: "sprint-1".into(),
            started_at: now,
            ended_at: Some(now),
            window_end: now,
            commits: 3,
            lines_added: 40,
            lines_removed: 7,
            done_by_kind: BTreeMap::from([("task".to_string(), 2)]),
            open_by_kind: BTreeMap::from([("review".to_string(), 1), ("task".to_string(), 1)]),
            cells: vec![
                CellSummary {
                    cell: "alpha".into(),
                    commits: 3,
                    items_done: 2,
                    items_open: 1,
                    tracked: true,
                },
                CellSummary {
                    cell: "beta".into(),
                    tracked: false,
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn test_render_sections() {
        let text = render(&summary());
        assert!(text.starts_with("# Turn report: sprint-1"));
        assert!(text.contains("- Commits: 3 (+40 / -7)"));
        assert!(text.contains("- Work items: 2 done, 2 open"));
        assert!(text.contains("| task | 2 | 1 |"));
        assert!(text.contains("| review | 0 | 1 |"));
        assert!(text.contains("| alpha | 3 | 2 | 1 |"));
        assert!(text.contains("| beta | n/a | 0 | 0 |"));
    }

    #[test]
    fn test_write_places_report_by_turn_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &summary()).unwrap();
        assert_eq!(path, dir.path().join("reports/wi-1.md"));
        assert!(std::fs::read_to_string(path).unwrap().contains("sprint-1"));
    }
}
