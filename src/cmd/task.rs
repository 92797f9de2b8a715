//! Work item commands: `cellrig task ...` and `cellrig assign`.

use anyhow::{Context, Result, bail};
use std::path::Path;

use cellrig::errors::RigError;
use cellrig::hooks::{HookContext, HookEvent};
use cellrig::lifecycle;
use cellrig::metadata::{self, Metadata};
use cellrig::session;
use cellrig::store::{
    self, AssignmentFilter, AssignmentStatus, DepRef, NewAgent, NewWorkItem, Role, WorkItem,
    WorkItemFilter, WorkStatus,
};

use super::super::{Cli, TaskCommands};
use super::open;

pub fn cmd_task(cli: &Cli, root: &Path, command: TaskCommands) -> Result<()> {
    let (_config, ctx) = open(cli, root)?;

    match command {
        TaskCommands::Create {
            title,
            kind,
            scope,
            priority,
            description,
            deps,
            cell,
            role,
            turn,
        } => {
            let turn_id = if turn {
                Some(ctx.require_turn()?.id.clone())
            } else {
                None
            };
            let meta = Metadata {
                cell,
                role: role.map(|r| r.as_str().to_string()),
                turn_id,
                ..Default::default()
            };

            let mut new = NewWorkItem::new(kind, title)
                .with_scope(scope)
                .with_priority(priority)
                .with_description(metadata::with_metadata(&description, &meta));
            for raw in &deps {
                let dep: DepRef = raw.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                new = new.with_dep(dep);
            }

            let item = lifecycle::create_work_item(&ctx, &new)?;
            println!("Created {} {}: {}", item.kind, item.id, item.title);
        }
        TaskCommands::List {
            status,
            kind,
            ready,
            json,
        } => {
            let mut items = if ready {
                store::ready_work_items(ctx.store.as_ref())?
            } else {
                ctx.store.list_work_items(&WorkItemFilter::default())?
            };
            let filter = WorkItemFilter {
                statuses: status.into_iter().collect(),
                kind,
            };
            items.retain(|item| filter.matches(item));

            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
                return Ok(());
            }
            if items.is_empty() {
                println!("No work items.");
                return Ok(());
            }
            println!(
                "{:<12} {:<12} {:<12} {:>4}  {:<24} Title",
                "ID", "Kind", "Status", "Pri", "Scope"
            );
            for item in &items {
                println!(
                    "{:<12} {:<12} {:<12} {:>4}  {:<24} {}",
                    item.id,
                    item.kind.as_str(),
                    item.status.as_str(),
                    item.priority,
                    item.scope,
                    item.title
                );
            }
        }
        TaskCommands::Show { id } => {
            let item = get(ctx.store.as_ref(), &id)?;
            print_item(&item);

            let assignments = ctx
                .store
                .list_assignments(&AssignmentFilter::default().for_work_item(&item.id))?;
            if !assignments.is_empty() {
                println!();
                println!("Assignments:");
                for a in &assignments {
                    println!(
                        "  {}  {:<20} {:<8} outbox {}",
                        a.id,
                        a.agent_id,
                        a.status.as_str(),
                        a.outbox_rel_path
                    );
                }
            }
            println!();
        }
        TaskCommands::Close { id } => {
            let item = get(ctx.store.as_ref(), &id)?;
            if ctx.store.advance_work_item(&item.id, WorkStatus::Closed)? {
                println!("Closed {}", item.id);
            } else {
                println!("{} is already {}", item.id, item.status);
            }
        }
        TaskCommands::Meta { id, fields } => {
            let item = get(ctx.store.as_ref(), &id)?;
            let mut meta = item.metadata();
            for field in &fields {
                let Some((key, value)) = field.split_once('=') else {
                    bail!("Expected key=value, got '{}'", field);
                };
                if !meta.set(key.trim(), value) {
                    bail!(
                        "Unknown metadata field '{}'. Valid fields: {}",
                        key.trim(),
                        Metadata::fields().join(", ")
                    );
                }
            }
            ctx.store
                .update_description(&item.id, &metadata::with_metadata(&item.description, &meta))
                .with_context(|| format!("Failed to update {}", item.id))?;
            println!("Updated metadata of {}", item.id);
        }
    }

    Ok(())
}

pub async fn cmd_assign(
    cli: &Cli,
    root: &Path,
    work_item: &str,
    cell_name: &str,
    role: Role,
) -> Result<()> {
    let (config, ctx) = open(cli, root)?;
    let item = get(ctx.store.as_ref(), work_item)?;
    if item.status.is_finished() {
        bail!("{} is already {}", item.id, item.status);
    }
    let bound = ctx
        .store
        .list_assignments(&AssignmentFilter::active().for_work_item(&item.id))?;
    if let Some(existing) = bound.first() {
        bail!(
            "{} already has an active assignment ({} for {})",
            item.id,
            existing.id,
            existing.agent_id
        );
    }

    let cell = ctx
        .store
        .get_cell(cell_name)?
        .ok_or_else(|| RigError::not_found("Cell", cell_name))?;
    let agent = ctx.store.create_agent(&NewAgent {
        cell: cell.name.clone(),
        role,
        session_handle: session::handle_for(&ctx.session_prefix, &ctx.name, &cell.name, role),
    })?;

    let assignment = lifecycle::create_assignment(
        &ctx,
        &item,
        &agent,
        &cell.worktree_path,
        AssignmentStatus::Queued,
    )?;
    config
        .hook_manager()
        .fire(
            &HookContext::new(HookEvent::AssignmentCreated, &ctx.name)
                .with_cell(&cell.name)
                .with_role(role.as_str())
                .with_turn(ctx.turn_id())
                .with_work_item(&item.id)
                .with_assignment(&assignment.id),
        )
        .await?;

    println!(
        "Queued {} for {} ({} -> {})",
        item.id, agent.id, assignment.inbox_rel_path, assignment.outbox_rel_path
    );
    Ok(())
}

fn get(store: &dyn store::WorkStore, id: &str) -> Result<WorkItem> {
    Ok(store
        .get_work_item(id)?
        .ok_or_else(|| RigError::not_found("Work item", id))?)
}

fn print_item(item: &WorkItem) {
    println!();
    println!("{}", console::style(&item.title).bold());
    println!();
    println!("  ID:       {}", item.id);
    println!("  Kind:     {}", item.kind);
    println!("  Status:   {}", item.status);
    println!("  Priority: {}", item.priority);
    if !item.scope.is_empty() {
        println!("  Scope:    {}", item.scope);
    }
    if !item.deps.is_empty() {
        let deps: Vec<String> = item.deps.iter().map(|d| d.to_string()).collect();
        println!("  Deps:     {}", deps.join(", "));
    }
    println!("  Created:  {}", item.created_at.to_rfc3339());
    println!("  Updated:  {}", item.updated_at.to_rfc3339());

    let meta = item.metadata();
    if !meta.is_empty() {
        println!();
        println!("Metadata:");
        for line in meta.encode().lines().filter(|l| *l != metadata::MARKER) {
            println!("  {}", line);
        }
    }
    let body = metadata::strip(&item.description);
    if !body.is_empty() {
        println!();
        println!("{}", body);
    }
}
