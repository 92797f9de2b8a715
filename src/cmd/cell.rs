//! Cell and agent commands: `cellrig cell ...` and `cellrig agent ...`.

use anyhow::{Context, Result};
use std::path::Path;

use cellrig::context::RigContext;
use cellrig::errors::RigError;
use cellrig::heartbeat::{self, Heartbeat};
use cellrig::router;
use cellrig::session::{self, SessionBackend, SessionSpec, TmuxSessions};
use cellrig::store::{Agent, AgentStatus, Cell, NewAgent, Role};

use super::super::{AgentCommands, CellCommands, Cli};
use super::open;

pub fn cmd_cell(cli: &Cli, root: &Path, command: CellCommands) -> Result<()> {
    let (_config, ctx) = open(cli, root)?;

    match command {
        CellCommands::Add {
            name,
            scope,
            worktree,
            roles,
        } => {
            let worktree = match worktree {
                Some(path) if path.is_absolute() => path,
                Some(path) => ctx.root.join(path),
                None => ctx.root.clone(),
            };
            if !worktree.is_dir() {
                tracing::warn!(worktree = %worktree.display(), "Worktree does not exist yet");
            }
            let scope = scope.trim_matches('/').to_string();
            let cell = ctx
                .store
                .create_cell(&Cell::new(&name, &scope, &worktree))
                .with_context(|| format!("Failed to add cell {}", name))?;
            for role in &roles {
                register(&ctx, &cell.name, *role)?;
            }
            println!(
                "Added cell {} (scope '{}', worktree {})",
                cell.name,
                cell.scope_prefix,
                cell.worktree_path.display()
            );
        }
        CellCommands::List => {
            let cells = ctx.store.list_cells()?;
            if cells.is_empty() {
                println!("No cells. Add one with 'cellrig cell add <name> --scope <path>'.");
                return Ok(());
            }
            println!("{:<16} {:<28} Worktree", "Cell", "Scope");
            for cell in &cells {
                println!(
                    "{:<16} {:<28} {}",
                    cell.name,
                    cell.scope_prefix,
                    cell.worktree_path.display()
                );
            }
        }
        CellCommands::Route { scope } => {
            let cells = ctx.store.list_cells()?;
            let cell = router::resolve(&scope, &cells)?;
            println!("{}", cell.name);
        }
    }

    Ok(())
}

pub async fn cmd_agent(cli: &Cli, root: &Path, command: AgentCommands) -> Result<()> {
    let (config, ctx) = open(cli, root)?;
    let sessions = TmuxSessions::default();

    match command {
        AgentCommands::Add { cell, role } => {
            require_cell(&ctx, &cell)?;
            let agent = register(&ctx, &cell, role)?;
            println!("Registered {} (session {})", agent.id, agent.session_handle);
        }
        AgentCommands::List => {
            let agents = ctx.store.list_agents()?;
            if agents.is_empty() {
                println!("No agents.");
                return Ok(());
            }
            println!(
                "{:<24} {:<8} {:<20} {:<36} Last heartbeat",
                "Agent", "Status", "Assignment", "Session"
            );
            let rig_dir = ctx.rig_dir();
            for agent in &agents {
                let beat = heartbeat::load(&rig_dir, &agent.cell, agent.role);
                let last = agent
                    .last_heartbeat
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let assignment = beat
                    .as_ref()
                    .and_then(|b| b.assignment_id.clone())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<8} {:<20} {:<36} {}",
                    agent.id,
                    agent.status.as_str(),
                    assignment,
                    agent.session_handle,
                    last
                );
            }
        }
        AgentCommands::Start { cell, role } => {
            let cell = require_cell(&ctx, &cell)?;
            let agent = register(&ctx, &cell.name, role)?;
            if sessions.is_live(&agent.session_handle).await? {
                println!("{} is already running ({})", agent.id, agent.session_handle);
                return Ok(());
            }
            let command = config.agent_cmd();
            sessions
                .start(&SessionSpec {
                    handle: &agent.session_handle,
                    command: &command,
                    working_dir: &cell.worktree_path,
                    env: session::worker_env(&ctx.root, &ctx.name, &cell, role),
                })
                .await?;
            record(&ctx, &cell.name, role, AgentStatus::Running, "session started");
            println!("Started {} in session {}", agent.id, agent.session_handle);
        }
        AgentCommands::Stop { cell, role } => {
            let agent = require_agent(&ctx, &cell, role)?;
            if !sessions.is_live(&agent.session_handle).await? {
                println!("{} is not running", agent.id);
                return Ok(());
            }
            sessions.stop(&agent.session_handle).await?;
            record(&ctx, &cell, role, AgentStatus::Idle, "session stopped");
            println!("Stopped {}", agent.id);
        }
        AgentCommands::Wake {
            cell,
            role,
            message,
        } => {
            let agent = require_agent(&ctx, &cell, role)?;
            let text = message.as_deref().unwrap_or(session::WAKE_MESSAGE);
            sessions.send_keys(&agent.session_handle, text).await?;
            println!("Woke {}", agent.id);
        }
    }

    Ok(())
}

fn require_cell(ctx: &RigContext, name: &str) -> Result<Cell> {
    Ok(ctx
        .store
        .get_cell(name)?
        .ok_or_else(|| RigError::not_found("Cell", name))?)
}

fn require_agent(ctx: &RigContext, cell: &str, role: Role) -> Result<Agent> {
    let id = Agent::id_for(cell, role);
    Ok(ctx
        .store
        .get_agent(&id)?
        .ok_or_else(|| RigError::not_found("Agent", id))?)
}

/// Register (or look up) the agent for (cell, role).
fn register(ctx: &RigContext, cell: &str, role: Role) -> Result<Agent> {
    ctx.store.create_agent(&NewAgent {
        cell: cell.to_string(),
        role,
        session_handle: session::handle_for(&ctx.session_prefix, &ctx.name, cell, role),
    })
}

fn record(ctx: &RigContext, cell: &str, role: Role, status: AgentStatus, message: &str) {
    let beat = Heartbeat::new(cell, role, status).with_message(message);
    if let Err(e) = heartbeat::record(&ctx.rig_dir(), ctx.store.as_ref(), &beat) {
        tracing::warn!(agent = %Agent::id_for(cell, role), error = %e, "Failed to record heartbeat");
    }
}
