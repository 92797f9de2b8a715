//! Reconciliation loop: `cellrig manager tick`.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

use cellrig::context::RigContext;
use cellrig::hooks::{HookContext, HookEvent, HookManager};
use cellrig::lifecycle::{self, ReconcileReport};

use super::super::{Cli, ManagerCommands};
use super::open;

pub async fn cmd_manager(cli: &Cli, root: &Path, command: ManagerCommands) -> Result<()> {
    let ManagerCommands::Tick {
        watch: keep_watching,
        interval,
    } = command;
    let (config, ctx) = open(cli, root)?;
    let hooks = config.hook_manager();

    if !keep_watching {
        let report = tick(&ctx, &hooks).await?;
        print_report(&report);
        return Ok(());
    }

    let interval = interval
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| config.tick_interval());
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });

    println!(
        "Manager watching {} every {}s (Ctrl-C to stop)",
        ctx.name,
        interval.as_secs()
    );
    tracing::info!(interval_secs = interval.as_secs(), "Manager started");

    // Each pass completes before the next sleep starts, so passes never overlap.
    loop {
        match tick(&ctx, &hooks).await {
            Ok(report) if !report.promoted.is_empty() || report.skipped > 0 => print_report(&report),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %format!("{:#}", e), "Reconciliation pass failed"),
        }

        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::info!("Manager stopped");
    println!("Manager stopped.");
    Ok(())
}

/// One reconciliation pass, then `assignment_done` hooks for what it promoted.
async fn tick(ctx: &RigContext, hooks: &HookManager) -> Result<ReconcileReport> {
    let report = lifecycle::reconcile(ctx)?;
    for assignment in &report.promoted {
        let mut hook = HookContext::new(HookEvent::AssignmentDone, &ctx.name)
            .with_turn(assignment.turn_id.as_deref())
            .with_work_item(&assignment.work_item_id)
            .with_assignment(&assignment.id)
            .with_extra("outbox", serde_json::json!(assignment.outbox_rel_path));
        if let Some((cell, role)) = assignment.agent_id.split_once('/') {
            hook = hook.with_cell(cell).with_role(role);
        }
        hooks.fire(&hook).await?;
    }
    Ok(report)
}

fn print_report(report: &ReconcileReport) {
    for assignment in &report.promoted {
        println!(
            "{} {} ({})",
            console::style("Done").green(),
            assignment.work_item_id,
            assignment.agent_id
        );
    }
    println!(
        "Reconciled: {} done, {} pending, {} skipped",
        report.promoted.len(),
        report.pending,
        report.skipped
    );
}
