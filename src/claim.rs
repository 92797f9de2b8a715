//! Stop-hook claim protocol.
//!
//! Each time a worker goes idle its stop hook asks for the next thing to do.
//! Assignments queued for the worker by a round are taken first through the
//! store's conditional `claim_next`. Otherwise the ready work items are
//! scanned in store order and the first one whose metadata matches the
//! worker is taken with a conditional `open -> in_progress` transition.
//! Losing that race moves on to the next candidate, so two workers can never
//! both win the same item.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::RigContext;
use crate::errors::RigError;
use crate::heartbeat::{self, Heartbeat};
use crate::lifecycle;
use crate::mailbox::MailPaths;
use crate::metadata::Metadata;
use crate::session;
use crate::store::{
    self, Agent, AgentStatus, Assignment, AssignmentFilter, AssignmentStatus, Cell, NewAgent,
    Role, WorkItem, WorkStatus,
};

pub const BEGIN_MARKER: &str = "=== BEGIN ASSIGNMENT ===";
pub const END_MARKER: &str = "=== END ASSIGNMENT ===";

/// Environment toggle for the clear-context preamble (default on).
pub const CLEAR_CONTEXT_ENV: &str = "RIG_CLAIM_CLEAR_CONTEXT";

const CLEAR_CONTEXT_PREAMBLE: &str = "Before starting, discard all prior conversation context. \
Treat this as a fresh session: earlier tasks, files and decisions do not apply.";

/// The worker asking for work.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub cell: String,
    pub role: Role,
    pub worktree: PathBuf,
    pub turn_id: Option<String>,
}

impl WorkerIdentity {
    pub fn agent_id(&self) -> String {
        Agent::id_for(&self.cell, self.role)
    }

    /// Unset metadata fields are wildcards. The turn is only compared when
    /// the worker has one.
    pub fn matches(&self, meta: &Metadata) -> bool {
        let cell_ok = meta.cell.as_deref().is_none_or(|c| c == self.cell);
        let role_ok = meta
            .role
            .as_deref()
            .is_none_or(|r| r.eq_ignore_ascii_case(self.role.as_str()));
        let turn_ok = match (&self.turn_id, meta.turn_id.as_deref()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        };
        cell_ok && role_ok && turn_ok
    }
}

/// How the claimed work was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimSource {
    /// A queued assignment created for this worker.
    Queued,
    /// A matching ready work item.
    Scan,
}

#[derive(Debug, Clone)]
pub struct Claim {
    pub assignment: Assignment,
    pub work_item: WorkItem,
    pub paths: MailPaths,
    pub document: String,
    pub source: ClaimSource,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(Box<Claim>),
    Idle,
}

/// Stop hook input. Only the fields the protocol uses are read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Stop hook reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReply {
    #[serde(rename = "continue")]
    pub proceed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    pub reason: String,
}

/// Claim the next piece of work for `identity`.
pub fn claim(ctx: &RigContext, identity: &WorkerIdentity) -> Result<ClaimOutcome> {
    let store = ctx.store.as_ref();
    let agent = store
        .create_agent(&NewAgent {
            cell: identity.cell.clone(),
            role: identity.role,
            session_handle: session::handle_for(
                &ctx.session_prefix,
                &ctx.name,
                &identity.cell,
                identity.role,
            ),
        })
        .context("Failed to register agent")?;

    let claimed = match claim_queued(ctx, identity, &agent)? {
        Some(claim) => Some(claim),
        None => claim_scanned(ctx, identity, &agent)?,
    };

    let Some(claim) = claimed else {
        debug!(agent = %agent.id, "No eligible work");
        beat(
            ctx,
            Heartbeat::new(&identity.cell, identity.role, AgentStatus::Idle)
                .with_message("no eligible work"),
        );
        return Ok(ClaimOutcome::Idle);
    };

    info!(
        agent = %agent.id,
        assignment = %claim.assignment.id,
        work_item = %claim.work_item.id,
        source = ?claim.source,
        "Work claimed"
    );
    beat(
        ctx,
        Heartbeat::new(&identity.cell, identity.role, AgentStatus::Claimed)
            .with_assignment(&claim.assignment.id)
            .with_message(format!("claimed {}", claim.work_item.id)),
    );
    Ok(ClaimOutcome::Claimed(Box::new(claim)))
}

fn beat(ctx: &RigContext, heartbeat: Heartbeat) {
    if let Err(e) = heartbeat::record(&ctx.rig_dir(), ctx.store.as_ref(), &heartbeat) {
        warn!(cell = %heartbeat.cell, role = %heartbeat.role, error = %e, "Failed to record heartbeat");
    }
}

fn claim_queued(
    ctx: &RigContext,
    identity: &WorkerIdentity,
    agent: &Agent,
) -> Result<Option<Claim>> {
    let store = ctx.store.as_ref();
    let Some(assignment) = store.claim_next(&agent.id)? else {
        return Ok(None);
    };
    let mut item = store
        .get_work_item(&assignment.work_item_id)?
        .ok_or_else(|| RigError::not_found("Work item", assignment.work_item_id.clone()))?;
    if store.advance_work_item(&item.id, WorkStatus::InProgress)? {
        item.status = WorkStatus::InProgress;
    }

    let paths = MailPaths {
        inbox: assignment.inbox_rel_path.clone(),
        outbox: assignment.outbox_rel_path.clone(),
        promise: assignment.completion_promise.clone(),
    };
    let document = lifecycle::write_inbox(&item, agent, &identity.worktree, &paths)
        .inspect_err(|e| {
            warn!(
                assignment = %assignment.id,
                work_item = %item.id,
                error = %e,
                "Claimed assignment has no inbox"
            )
        })
        .with_context(|| format!("Failed to write inbox for assignment {}", assignment.id))?;
    Ok(Some(Claim {
        assignment,
        work_item: item,
        paths,
        document,
        source: ClaimSource::Queued,
    }))
}

fn claim_scanned(
    ctx: &RigContext,
    identity: &WorkerIdentity,
    agent: &Agent,
) -> Result<Option<Claim>> {
    let store = ctx.store.as_ref();
    let candidates = store::ready_work_items(store)?
        .into_iter()
        .filter(|item| item.kind.is_claimable())
        .filter(|item| identity.matches(&item.metadata()));

    for mut item in candidates {
        let bound = store.list_assignments(&AssignmentFilter::active().for_work_item(&item.id))?;
        if !bound.is_empty() {
            continue;
        }
        if !store.transition_work_item(&item.id, WorkStatus::Open, WorkStatus::InProgress)? {
            debug!(work_item = %item.id, "Lost claim race, trying next candidate");
            continue;
        }
        item.status = WorkStatus::InProgress;

        let assignment = lifecycle::create_assignment(
            ctx,
            &item,
            agent,
            &identity.worktree,
            AssignmentStatus::Running,
        )?;
        let paths = MailPaths {
            inbox: assignment.inbox_rel_path.clone(),
            outbox: assignment.outbox_rel_path.clone(),
            promise: assignment.completion_promise.clone(),
        };
        let document = crate::mailbox::render(&item, agent.role, &paths);
        return Ok(Some(Claim {
            assignment,
            work_item: item,
            paths,
            document,
            source: ClaimSource::Scan,
        }));
    }
    Ok(None)
}

/// Cell whose worktree contains `dir`. The deepest worktree wins, so a cell
/// nested inside another cell's worktree is found first.
pub fn cell_for_dir<'a>(cells: &'a [Cell], dir: &Path) -> Option<&'a Cell> {
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    cells
        .iter()
        .filter(|cell| {
            let worktree = cell
                .worktree_path
                .canonicalize()
                .unwrap_or_else(|_| cell.worktree_path.clone());
            dir.starts_with(worktree)
        })
        .max_by_key(|cell| cell.worktree_path.components().count())
}

/// Build the stop hook reply for an outcome.
pub fn stop_reply(outcome: &ClaimOutcome, identity: &WorkerIdentity, clear_context: bool) -> StopReply {
    match outcome {
        ClaimOutcome::Idle => StopReply {
            proceed: false,
            decision: None,
            reason: format!("No eligible work for {}.", identity.agent_id()),
        },
        ClaimOutcome::Claimed(claim) => StopReply {
            proceed: true,
            decision: Some("block".to_string()),
            reason: assignment_text(claim, clear_context),
        },
    }
}

/// The instruction handed to the worker for a claim.
pub fn assignment_text(claim: &Claim, clear_context: bool) -> String {
    let mut text = String::new();
    if clear_context {
        text.push_str(CLEAR_CONTEXT_PREAMBLE);
        text.push_str("\n\n");
    }
    text.push_str(&format!(
        "You have a new assignment ({}).\n\n{}\n{}\n{}\n\n",
        claim.work_item.id,
        BEGIN_MARKER,
        claim.document.trim_end(),
        END_MARKER
    ));
    text.push_str(&format!(
        "The assignment is also saved at {}. When the work is complete, write a summary to {} \
and include the exact token {} in that file.",
        claim.paths.inbox, claim.paths.outbox, claim.paths.promise
    ));
    text
}

/// Read the clear-context toggle. Anything other than an explicit false
/// value leaves it on.
pub fn clear_context_enabled(raw: Option<&str>) -> bool {
    match raw.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) => !matches!(v.as_str(), "0" | "false" | "no" | "off"),
        None => true,
    }
}
