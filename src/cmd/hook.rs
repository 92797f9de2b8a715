//! Worker hook endpoints: `cellrig hook stop` and `cellrig hook guard`.
//!
//! Both read one JSON request on stdin and write exactly one JSON reply on
//! stdout. Failures are logged to stderr and still produce a reply: the stop
//! hook goes idle and the guard fails open.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use cellrig::claim::{self, ClaimOutcome, StopReply, StopRequest, WorkerIdentity};
use cellrig::context::RigContext;
use cellrig::guardrails::{self, Action, Decision, GuardRequest, Identity, Verdict};
use cellrig::hooks::{HookContext, HookEvent, HookManager};
use cellrig::session;
use cellrig::store::{Cell, Role};
use cellrig::util::extract_json_object;

use super::super::{Cli, HookCommands};
use super::open;

pub async fn cmd_hook(cli: &Cli, root: &Path, command: HookCommands) -> Result<()> {
    let raw = read_stdin().await;

    match command {
        HookCommands::Stop => {
            let request: StopRequest = parse_request(&raw);
            let reply = match stop(cli, root, &request).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(error = %format!("{:#}", e), "Stop hook failed");
                    StopReply {
                        proceed: false,
                        decision: None,
                        reason: format!("cellrig could not claim work: {:#}", e),
                    }
                }
            };
            emit(&reply)
        }
        HookCommands::Guard => {
            let request: GuardRequest = parse_request(&raw);
            let verdict = match guard(cli, root, &request) {
                Ok(verdict) => verdict,
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "Guard failed, allowing");
                    Verdict {
                        decision: Decision::Allow,
                        reason: format!("guard unavailable: {:#}", e),
                    }
                }
            };
            emit(&verdict)
        }
    }
}

async fn stop(cli: &Cli, root: &Path, request: &StopRequest) -> Result<StopReply> {
    let (config, ctx) = open(cli, root)?;
    let cwd = request_dir(request.cwd.as_deref());
    let Some((cell, role)) = worker(&ctx, &cwd)? else {
        return Ok(StopReply {
            proceed: false,
            decision: None,
            reason: format!("No cell owns {}.", cwd.display()),
        });
    };
    let identity = WorkerIdentity {
        cell: cell.name.clone(),
        role,
        worktree: env_path(session::WORKTREE_ENV).unwrap_or_else(|| cell.worktree_path.clone()),
        turn_id: ctx.turn_id().map(str::to_string),
    };

    let outcome = claim::claim(&ctx, &identity)?;
    notify(&ctx, &config.hook_manager(), &identity, &outcome).await;
    Ok(claim::stop_reply(&outcome, &identity, config.clear_context()))
}

/// Fire the claim hooks. A failing rule must not cost the worker its reply.
async fn notify(ctx: &RigContext, hooks: &HookManager, identity: &WorkerIdentity, outcome: &ClaimOutcome) {
    let base = |event| {
        HookContext::new(event, &ctx.name)
            .with_cell(&identity.cell)
            .with_role(identity.role.as_str())
            .with_turn(ctx.turn_id())
    };
    let hook = match outcome {
        ClaimOutcome::Claimed(claim) => base(HookEvent::AssignmentClaimed)
            .with_work_item(&claim.work_item.id)
            .with_assignment(&claim.assignment.id),
        ClaimOutcome::Idle => base(HookEvent::AgentIdle),
    };
    if let Err(e) = hooks.fire(&hook).await {
        tracing::warn!(event = %hook.event, error = %format!("{:#}", e), "Claim hook failed");
    }
}

fn guard(cli: &Cli, root: &Path, request: &GuardRequest) -> Result<Verdict> {
    let (config, ctx) = open(cli, root)?;
    let cwd = request_dir(request.cwd.as_deref());
    let Some((cell, role)) = worker(&ctx, &cwd)? else {
        return Ok(Verdict {
            decision: Decision::Allow,
            reason: format!("no cell owns {}", cwd.display()),
        });
    };

    let identity = Identity {
        role,
        worktree: env_path(session::WORKTREE_ENV).unwrap_or_else(|| cell.worktree_path.clone()),
        scope: cell.scope_prefix.clone(),
    };
    let action = Action::from_tool(&request.tool_name, &request.tool_input);
    let verdict = guardrails::decide(&action, &identity, &config.policy());
    if !verdict.is_allowed() {
        tracing::info!(cell = %cell.name, role = %role, reason = %verdict.reason, "Action denied");
    }
    Ok(verdict)
}

/// The worker making the call: `RIG_CELL`/`RIG_ROLE` from the session
/// environment, else the cell whose worktree contains `cwd` as a builder.
fn worker(ctx: &RigContext, cwd: &Path) -> Result<Option<(Cell, Role)>> {
    let role = match std::env::var(session::ROLE_ENV) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .parse::<Role>()
            .map_err(|e| anyhow::anyhow!("{}: {}", session::ROLE_ENV, e))?,
        _ => Role::Builder,
    };
    if let Ok(name) = std::env::var(session::CELL_ENV)
        && !name.trim().is_empty()
    {
        let cell = ctx
            .store
            .get_cell(name.trim())?
            .with_context(|| format!("{} names unknown cell '{}'", session::CELL_ENV, name))?;
        return Ok(Some((cell, role)));
    }
    let cells = ctx.store.list_cells()?;
    Ok(claim::cell_for_dir(&cells, cwd).map(|cell| (cell.clone(), role)))
}

fn request_dir(cwd: Option<&str>) -> PathBuf {
    cwd.filter(|c| !c.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

async fn read_stdin() -> String {
    let mut raw = String::new();
    if let Err(e) = tokio::io::stdin().read_to_string(&mut raw).await {
        tracing::warn!(error = %e, "Failed to read hook input");
    }
    raw
}

/// Parse the first JSON object in `raw`. Malformed or missing input yields
/// the default request.
fn parse_request<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    let Some(json) = extract_json_object(raw) else {
        if !raw.trim().is_empty() {
            tracing::warn!("Hook input has no JSON object");
        }
        return T::default();
    };
    serde_json::from_str(&json).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Malformed hook input");
        T::default()
    })
}

fn emit<T: Serialize>(reply: &T) -> Result<()> {
    println!("{}", serde_json::to_string(reply)?);
    Ok(())
}
