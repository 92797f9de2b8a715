//! Turn and round commands: `cellrig turn ...` and `cellrig round ...`.

use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::time::Duration;

use cellrig::session::TmuxSessions;
use cellrig::turn::{self, TurnSummary, report, round::Round, summary};

use super::super::{Cli, RoundCommands, TurnCommands};
use super::open;

pub async fn cmd_turn(cli: &Cli, root: &Path, command: TurnCommands) -> Result<()> {
    let (config, mut ctx) = open(cli, root)?;
    let ledger = config.ledger();
    let hooks = config.hook_manager();

    match command {
        TurnCommands::Start { name } => {
            let previous = ctx.turn.clone();
            let record = turn::start(&mut ctx, &ledger, &hooks, &name).await?;
            if let Some(previous) = previous {
                println!("Ended turn {} ({})", previous.name, previous.id);
            }
            println!("Started turn {} ({})", record.name, record.id);
        }
        TurnCommands::Status => {
            let Some(record) = ctx.turn.clone() else {
                println!("No active turn. Start one with 'cellrig turn start <name>'.");
                return Ok(());
            };
            let cells = ctx.store.list_cells()?;
            let summary = summary::compute(ctx.store.as_ref(), &cells, &record, Utc::now())?;
            print_summary(&summary);
        }
        TurnCommands::End { report: write_report } => {
            let closed = turn::end(&mut ctx, &ledger, &hooks, write_report).await?;
            println!("Ended turn {} ({})", closed.record.name, closed.record.id);
            if let Some(summary) = &closed.summary {
                print_summary(summary);
            }
            if let Some(path) = &closed.report_path {
                println!("Report written to {}", path.display());
            }
        }
        TurnCommands::History => {
            let history = ledger.history()?;
            if history.is_empty() {
                println!("No closed turns.");
                return Ok(());
            }
            println!("{:<14} {:<20} {:<20} {:<20} Report", "ID", "Name", "Started", "Ended");
            for record in &history {
                let ended = record
                    .ended_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let report = report::report_path(&ctx.rig_dir(), &record.id);
                let report = if report.exists() {
                    report.display().to_string()
                } else {
                    "-".to_string()
                };
                println!(
                    "{:<14} {:<20} {:<20} {:<20} {}",
                    record.id,
                    record.name,
                    record.started_at.format("%Y-%m-%d %H:%M").to_string(),
                    ended,
                    report
                );
            }
        }
    }

    Ok(())
}

pub async fn cmd_round(cli: &Cli, root: &Path, command: RoundCommands) -> Result<()> {
    let (config, ctx) = open(cli, root)?;
    let hooks = config.hook_manager();
    let sessions = TmuxSessions::default();
    let round = Round::new(&ctx, &sessions, &hooks);

    match command {
        RoundCommands::Start => {
            let report = round.start().await?;
            println!("Queued {} assignment(s)", report.assigned.len());
            for assignment in &report.assigned {
                println!("  {} -> {}", assignment.work_item_id, assignment.agent_id);
            }
            if report.already_bound > 0 {
                println!("{} item(s) already assigned", report.already_bound);
            }
            if !report.unroutable.is_empty() {
                println!(
                    "{} no cell owns: {}",
                    console::style("Unroutable:").yellow(),
                    report.unroutable.join(", ")
                );
            }
            if !report.over_quota.is_empty() {
                println!(
                    "{} {}",
                    console::style("Over quota:").yellow(),
                    report.over_quota.join(", ")
                );
            }
            if !report.woken.is_empty() {
                println!("Woke {} session(s)", report.woken.len());
            }
        }
        RoundCommands::Review { all } => {
            let round = if all { round.review_all() } else { round };
            let report = round.review().await?;
            for (cell, id) in &report.created {
                println!("Review {} opened for {}", id, cell);
            }
            if !report.already_open.is_empty() {
                println!("Already under review: {}", report.already_open.join(", "));
            }
            if !report.unchanged.is_empty() {
                println!("No changes: {}", report.unchanged.join(", "));
            }
            if !report.over_quota.is_empty() {
                println!(
                    "{} {}",
                    console::style("Over quota:").yellow(),
                    report.over_quota.join(", ")
                );
            }
            if report.created.is_empty() && report.already_open.is_empty() {
                println!("Nothing to review.");
            }
        }
        RoundCommands::Merge { timeout } => {
            let round = round.with_merge_timeout(Duration::from_secs(timeout.max(1)));
            let report = round.merge().await?;
            for cell in &report.merged {
                println!("{} {}", console::style("Merged").green(), cell);
            }
            for (cell, id) in &report.conflicts {
                println!(
                    "{} {} diverted to {}",
                    console::style("Conflict").red(),
                    cell,
                    id
                );
            }
            if !report.waiting.is_empty() {
                println!("Waiting on review: {}", report.waiting.join(", "));
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &TurnSummary) {
    println!();
    println!(
        "{}",
        console::style(format!("Turn {} ({})", summary.name, summary.turn_id)).bold()
    );
    println!();
    println!(
        "Commits:    {} (+{} / -{})",
        summary.commits, summary.lines_added, summary.lines_removed
    );
    println!(
        "Work items: {} done, {} open",
        summary.items_done(),
        summary.items_open()
    );
    if !summary.cells.is_empty() {
        println!();
        println!("{:<16} {:>8} {:>6} {:>6}", "Cell", "Commits", "Done", "Open");
        for cell in &summary.cells {
            let commits = if cell.tracked {
                cell.commits.to_string()
            } else {
                "n/a".to_string()
            };
            println!(
                "{:<16} {:>8} {:>6} {:>6}",
                cell.cell, commits, cell.items_done, cell.items_open
            );
        }
    }
    println!();
}
