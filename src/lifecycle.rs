//! Assignment creation and promise-token reconciliation.
//!
//! Completion is only ever detected by polling: an assignment is done when
//! its outbox file contains its completion promise verbatim. [`reconcile`]
//! is idempotent, and concurrent passes cannot both promote the same
//! assignment because the store's completion update is conditional.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::context::RigContext;
use crate::errors::RigError;
use crate::mailbox::{self, MailPaths};
use crate::quota;
use crate::store::{
    Agent, Assignment, AssignmentFilter, AssignmentStatus, Cell, NewAssignment, NewWorkItem,
    WorkItem, WorkStatus, WorkStore,
};

/// Create a work item, refusing it when its metadata targets a (cell, turn)
/// pair that is already at the rig's quota.
pub fn create_work_item(ctx: &RigContext, item: &NewWorkItem) -> Result<WorkItem> {
    let meta = crate::metadata::Metadata::decode(&item.description);
    if let (Some(cell), Some(turn)) = (meta.cell.as_deref(), meta.turn_id.as_deref()) {
        quota::check(ctx.store.as_ref(), cell, turn, ctx.quota)?;
    }
    let created = ctx
        .store
        .create_work_item(item)
        .with_context(|| format!("Failed to create work item '{}'", item.title))?;
    debug!(work_item = %created.id, kind = %created.kind, "Work item created");
    Ok(created)
}

/// Write the inbox document for `item` into `worktree`, then persist the
/// assignment of `item` to `agent`.
///
/// Mail paths and promise come from the item's metadata when set, otherwise
/// from the rig's mail layout and the item id.
pub fn create_assignment(
    ctx: &RigContext,
    item: &WorkItem,
    agent: &Agent,
    worktree: &Path,
    status: AssignmentStatus,
) -> Result<Assignment> {
    let meta = item.metadata();
    let paths = ctx.mail.resolve(
        &item.id,
        meta.inbox.as_deref(),
        meta.outbox.as_deref(),
        meta.promise.as_deref(),
    );
    let turn_id = ctx
        .turn_id()
        .map(str::to_string)
        .or_else(|| meta.turn_id.clone());

    // The inbox must exist before the assignment row binds the item.
    write_inbox(item, agent, worktree, &paths)?;
    let assignment = ctx
        .store
        .create_assignment(&NewAssignment {
            work_item_id: item.id.clone(),
            agent_id: agent.id.clone(),
            status,
            inbox_rel_path: paths.inbox.clone(),
            outbox_rel_path: paths.outbox.clone(),
            completion_promise: paths.promise.clone(),
            turn_id,
        })
        .with_context(|| format!("Failed to create assignment for {}", item.id))?;
    info!(
        assignment = %assignment.id,
        work_item = %item.id,
        agent = %agent.id,
        status = %assignment.status,
        "Assignment created"
    );
    Ok(assignment)
}

/// Render and atomically write the inbox document for `item`.
pub fn write_inbox(
    item: &WorkItem,
    agent: &Agent,
    worktree: &Path,
    paths: &MailPaths,
) -> Result<String> {
    let document = mailbox::render(item, agent.role, paths);
    mailbox::deliver(worktree, paths, &document)?;
    Ok(document)
}

/// Cell that owns an agent. Agent ids are `<cell>/<role>`, so a missing
/// agent row still names its cell.
pub fn cell_of_agent(store: &dyn WorkStore, agent_id: &str) -> Result<Option<Cell>> {
    let cell_name = match store.get_agent(agent_id)? {
        Some(agent) => agent.cell,
        None => match agent_id.split_once('/') {
            Some((cell, _)) => cell.to_string(),
            None => return Ok(None),
        },
    };
    store.get_cell(&cell_name)
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Assignments moved to done by this pass.
    pub promoted: Vec<Assignment>,
    /// Active assignments whose promise has not appeared yet.
    pub pending: usize,
    /// Assignments that could not be inspected.
    pub skipped: usize,
}

/// Promote every active assignment whose outbox contains its promise.
pub fn reconcile(ctx: &RigContext) -> Result<ReconcileReport> {
    let active = ctx
        .store
        .list_assignments(&AssignmentFilter::active())
        .context("Failed to list active assignments")?;
    let mut report = ReconcileReport::default();

    for assignment in active {
        match reconcile_one(ctx.store.as_ref(), &assignment) {
            Ok(Some(promoted)) => report.promoted.push(promoted),
            Ok(None) => report.pending += 1,
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(assignment = %assignment.id, error = %reason, "Skipping assignment");
                report.skipped += 1;
            }
        }
    }

    if !report.promoted.is_empty() {
        info!(promoted = report.promoted.len(), "Reconciliation pass complete");
    }
    Ok(report)
}

fn reconcile_one(store: &dyn WorkStore, assignment: &Assignment) -> Result<Option<Assignment>> {
    let cell = cell_of_agent(store, &assignment.agent_id)?
        .ok_or_else(|| RigError::not_found("Cell for agent", assignment.agent_id.clone()))?;
    let worktree = &cell.worktree_path;

    let Some(outbox) = mailbox::read_outbox(worktree, &assignment.outbox_rel_path) else {
        return Ok(None);
    };
    if !outbox.contains(&assignment.completion_promise) {
        debug!(assignment = %assignment.id, "Outbox present without promise");
        return Ok(None);
    }
    if !store.complete_assignment(&assignment.id)? {
        // Another pass got there first.
        return Ok(None);
    }

    if let Err(e) = store.advance_work_item(&assignment.work_item_id, WorkStatus::Done) {
        warn!(work_item = %assignment.work_item_id, error = %e, "Failed to mark work item done");
    }
    for rel in [&assignment.inbox_rel_path, &assignment.outbox_rel_path] {
        if let Err(e) = mailbox::archive(worktree, rel) {
            warn!(path = %rel, error = %e, "Failed to archive mail");
        }
    }

    info!(
        assignment = %assignment.id,
        work_item = %assignment.work_item_id,
        "Assignment done"
    );
    let mut promoted = assignment.clone();
    promoted.status = AssignmentStatus::Done;
    Ok(Some(promoted))
}
