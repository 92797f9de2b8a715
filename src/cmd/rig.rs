//! Rig initialization and status commands.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use cellrig::config::RigConfig;
use cellrig::init::init_rig;
use cellrig::store::{AssignmentFilter, AssignmentStatus, StoreBackend, WorkItemFilter};

use super::super::Cli;

pub fn cmd_init(root: &Path, name: Option<&str>, store: Option<StoreBackend>) -> Result<()> {
    let backend = RigConfig::new(root)?
        .with_cli_args(store, false)
        .store_backend()?;
    let result = init_rig(root, name, backend)?;

    println!();
    if result.created {
        println!(
            "Initialized rig at {} ({} store)",
            result.rig_dir.display(),
            result.store
        );
        println!();
        println!("Next steps:");
        println!("  cellrig cell add <name> --scope <path> --worktree <dir>");
        println!("  cellrig task create \"<title>\" --scope <path>");
        println!("  cellrig turn start <name>");
    } else {
        println!(
            "Rig already initialized at {} ({} store); layout checked.",
            result.rig_dir.display(),
            result.store
        );
    }
    println!();
    Ok(())
}

pub fn cmd_status(cli: &Cli, root: &Path) -> Result<()> {
    let config = RigConfig::new(root)?.with_cli_args(cli.store, cli.verbose);

    println!();
    println!("{}", console::style("Rig Status").bold().cyan());
    println!("==========");
    println!();

    if !config.is_initialized() {
        println!("Rig: Not initialized");
        println!();
        println!("Run 'cellrig init' to initialize a rig here.");
        println!();
        return Ok(());
    }

    let ctx = config.context()?;
    println!("Rig:     {}", ctx.name);
    println!("Root:    {}", ctx.root.display());
    println!("Store:   {}", config.store_backend()?);
    match &ctx.turn {
        Some(turn) => println!(
            "Turn:    {} ({}), started {}",
            turn.name,
            turn.id,
            turn.started_at.format("%Y-%m-%d %H:%M UTC")
        ),
        None => println!("Turn:    {}", console::style("none").dim()),
    }
    match ctx.quota {
        Some(limit) => println!("Quota:   {} per cell per turn", limit),
        None => println!("Quota:   unbounded"),
    }
    println!();

    let cells = ctx.store.list_cells()?;
    let agents = ctx.store.list_agents()?;
    println!("Cells: {}", cells.len());
    for cell in &cells {
        let scope = if cell.scope_prefix.is_empty() {
            "(everything)"
        } else {
            &cell.scope_prefix
        };
        println!("  {:<16} {}", cell.name, scope);
        for agent in agents.iter().filter(|a| a.cell == cell.name) {
            println!(
                "    {:<12} {}",
                agent.role.as_str(),
                console::style(agent.status.as_str()).dim()
            );
        }
    }
    println!();

    let items = ctx.store.list_work_items(&WorkItemFilter::default())?;
    let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
    for item in &items {
        *by_status.entry(item.status.as_str()).or_default() += 1;
    }
    println!("Work items: {}", items.len());
    for (status, count) in &by_status {
        println!("  {:<12} {}", status, count);
    }

    let active = ctx.store.list_assignments(&AssignmentFilter::active())?;
    let queued = active
        .iter()
        .filter(|a| a.status == AssignmentStatus::Queued)
        .count();
    println!();
    println!(
        "Assignments: {} queued, {} running",
        queued,
        active.len() - queued
    );
    println!();
    Ok(())
}
