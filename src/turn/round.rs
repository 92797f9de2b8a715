//! Round phases run inside an open turn: start, review and merge.
//!
//! Each phase is a single pass over the store. A failure that concerns one
//! work item or one cell (no owning cell, quota reached, merge conflict) is
//! recorded in the phase report and the pass moves on.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::context::RigContext;
use crate::errors::RigError;
use crate::hooks::{HookContext, HookEvent, HookManager};
use crate::lifecycle;
use crate::metadata::{Metadata, with_metadata};
use crate::router;
use crate::session::{self, SessionBackend};
use crate::store::{
    self, Agent, Assignment, AssignmentFilter, AssignmentStatus, Cell, NewAgent, NewWorkItem,
    Role, WorkItem, WorkItemFilter, WorkKind, WorkStatus,
};
use crate::tracker::git::{self, GitTracker, MergeOutcome};
use crate::turn::TurnRecord;

/// Default bound on a single `git merge`.
pub const DEFAULT_MERGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs round phases against a rig.
pub struct Round<'a> {
    ctx: &'a RigContext,
    sessions: &'a dyn SessionBackend,
    hooks: &'a HookManager,
    merge_timeout: Duration,
    skip_unchanged: bool,
}

#[derive(Debug, Default)]
pub struct StartReport {
    pub assigned: Vec<Assignment>,
    /// Work item ids whose scope no cell owns.
    pub unroutable: Vec<String>,
    /// Work item ids refused because their cell is at quota.
    pub over_quota: Vec<String>,
    /// Work items skipped because an active assignment already exists.
    pub already_bound: usize,
    /// Session handles that were sent a wake-up line.
    pub woken: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ReviewReport {
    /// (cell, review work item id)
    pub created: Vec<(String, String)>,
    pub unchanged: Vec<String>,
    pub already_open: Vec<String>,
    pub over_quota: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MergeReport {
    pub merged: Vec<String>,
    /// (cell, conflict-resolution work item id)
    pub conflicts: Vec<(String, String)>,
    /// Cells whose review is not finished yet.
    pub waiting: Vec<String>,
}

impl<'a> Round<'a> {
    pub fn new(ctx: &'a RigContext, sessions: &'a dyn SessionBackend, hooks: &'a HookManager) -> Self {
        Self {
            ctx,
            sessions,
            hooks,
            merge_timeout: DEFAULT_MERGE_TIMEOUT,
            skip_unchanged: true,
        }
    }

    pub fn with_merge_timeout(mut self, timeout: Duration) -> Self {
        self.merge_timeout = timeout;
        self
    }

    /// Create review items even for cells with no changes.
    pub fn review_all(mut self) -> Self {
        self.skip_unchanged = false;
        self
    }

    /// Route every ready, unbound task/request/observation to its cell and
    /// queue an assignment for the responsible agent.
    pub async fn start(&self) -> Result<StartReport> {
        let turn = self.ctx.require_turn()?;
        let store = self.ctx.store.as_ref();
        let cells = store.list_cells()?;
        let mut report = StartReport::default();
        let mut to_wake = BTreeSet::new();

        let candidates = store::ready_work_items(store)?
            .into_iter()
            .filter(|item| item.kind.is_round_schedulable());

        for item in candidates {
            let bound = store.list_assignments(&AssignmentFilter::active().for_work_item(&item.id))?;
            if !bound.is_empty() {
                report.already_bound += 1;
                continue;
            }

            let meta = item.metadata();
            let scope = if item.scope.is_empty() {
                meta.scope.clone().unwrap_or_default()
            } else {
                item.scope.clone()
            };
            let cell = match router::resolve(&scope, &cells) {
                Ok(cell) => cell,
                Err(e) => {
                    warn!(work_item = %item.id, error = %e, "Work item is unschedulable");
                    report.unroutable.push(item.id.clone());
                    continue;
                }
            };

            let item = match self.stamp(&item, &meta, cell, turn) {
                Ok(item) => item,
                Err(e) if is_quota(&e) => {
                    warn!(work_item = %item.id, cell = %cell.name, error = %e, "Skipping work item");
                    report.over_quota.push(item.id.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let role = meta
                .role
                .as_deref()
                .and_then(|r| r.parse::<Role>().ok())
                .unwrap_or(Role::Builder);
            let agent = self.agent(cell, role)?;
            let assignment = lifecycle::create_assignment(
                self.ctx,
                &item,
                &agent,
                &cell.worktree_path,
                AssignmentStatus::Queued,
            )?;
            self.hooks
                .fire(
                    &HookContext::new(HookEvent::AssignmentCreated, &self.ctx.name)
                        .with_cell(&cell.name)
                        .with_role(role.as_str())
                        .with_turn(Some(&turn.id))
                        .with_work_item(&item.id)
                        .with_assignment(&assignment.id),
                )
                .await?;
            to_wake.insert(agent.session_handle.clone());
            report.assigned.push(assignment);
        }

        for handle in to_wake {
            if self.wake(&handle).await {
                report.woken.push(handle);
            }
        }

        info!(
            turn = %turn.id,
            assigned = report.assigned.len(),
            unroutable = report.unroutable.len(),
            over_quota = report.over_quota.len(),
            "Round start complete"
        );
        self.hooks
            .fire(
                &HookContext::new(HookEvent::RoundStart, &self.ctx.name)
                    .with_turn(Some(&turn.id))
                    .with_extra("assigned", serde_json::json!(report.assigned.len())),
            )
            .await?;
        Ok(report)
    }

    /// Open a review for every cell that has changes and no open review for
    /// this turn yet, and queue it for the cell's reviewer.
    pub async fn review(&self) -> Result<ReviewReport> {
        let turn = self.ctx.require_turn()?;
        let store = self.ctx.store.as_ref();
        let cells = store.list_cells()?;
        let reviews = self.reviews_for(turn)?;
        let base = self.base_branch();
        let mut report = ReviewReport::default();

        for cell in &cells {
            let has_open = reviews.iter().any(|r| {
                !r.status.is_finished() && r.metadata().cell.as_deref() == Some(cell.name.as_str())
            });
            if has_open {
                report.already_open.push(cell.name.clone());
                continue;
            }

            let branch = GitTracker::new(&cell.worktree_path)
                .ok()
                .and_then(|t| t.head_ref());
            if self.skip_unchanged
                && let Some(base) = base.as_deref()
                && !cell_has_changes(cell, base)
            {
                debug!(cell = %cell.name, base, "No changes to review");
                report.unchanged.push(cell.name.clone());
                continue;
            }

            let meta = Metadata {
                rig: Some(self.ctx.name.clone()),
                cell: Some(cell.name.clone()),
                role: Some(Role::Reviewer.to_string()),
                scope: Some(cell.scope_prefix.clone()),
                turn_id: Some(turn.id.clone()),
                kind: Some(WorkKind::Review.to_string()),
                branch: branch.clone(),
                base: base.clone(),
                ..Default::default()
            };
            let body = format!(
                "Review the changes in cell {} for turn {}.\n\nCompare {} against {} and \
report findings. Set `conflict: true` on this item if the work cannot merge cleanly.",
                cell.name,
                turn.name,
                branch.as_deref().unwrap_or("HEAD"),
                base.as_deref().unwrap_or("the base branch"),
            );
            let new_item = NewWorkItem::new(WorkKind::Review, format!("Review {}", cell.name))
                .with_scope(&cell.scope_prefix)
                .with_description(with_metadata(&body, &meta));
            let item = match lifecycle::create_work_item(self.ctx, &new_item) {
                Ok(item) => item,
                Err(e) if is_quota(&e) => {
                    warn!(cell = %cell.name, error = %e, "Review not created");
                    report.over_quota.push(cell.name.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let reviewer = self.agent(cell, Role::Reviewer)?;
            let assignment = lifecycle::create_assignment(
                self.ctx,
                &item,
                &reviewer,
                &cell.worktree_path,
                AssignmentStatus::Queued,
            )?;
            self.hooks
                .fire(
                    &HookContext::new(HookEvent::AssignmentCreated, &self.ctx.name)
                        .with_cell(&cell.name)
                        .with_role(Role::Reviewer.as_str())
                        .with_turn(Some(&turn.id))
                        .with_work_item(&item.id)
                        .with_assignment(&assignment.id),
                )
                .await?;
            self.wake(&reviewer.session_handle).await;
            report.created.push((cell.name.clone(), item.id));
        }

        info!(turn = %turn.id, created = report.created.len(), "Round review complete");
        self.hooks
            .fire(
                &HookContext::new(HookEvent::RoundReview, &self.ctx.name)
                    .with_turn(Some(&turn.id))
                    .with_extra("created", serde_json::json!(report.created.len())),
            )
            .await?;
        Ok(report)
    }

    /// Merge every cell whose review for this turn is done.
    ///
    /// Reviews flagged `conflict`, and merges that stop on conflicts, are
    /// diverted to a conflict-resolution task for the cell instead.
    pub async fn merge(&self) -> Result<MergeReport> {
        let turn = self.ctx.require_turn()?;
        let store = self.ctx.store.as_ref();
        let mut report = MergeReport::default();

        for review in self.reviews_for(turn)? {
            let meta = review.metadata();
            let Some(cell_name) = meta.cell.clone() else {
                continue;
            };
            match review.status {
                WorkStatus::Closed => continue,
                WorkStatus::Open | WorkStatus::InProgress => {
                    report.waiting.push(cell_name);
                    continue;
                }
                WorkStatus::Done => {}
            }
            let cell = store
                .get_cell(&cell_name)?
                .ok_or_else(|| RigError::not_found("Cell", cell_name.clone()))?;

            let detail = if meta.conflict {
                Some("review flagged a conflict".to_string())
            } else {
                let branch = meta.branch.clone().or_else(|| {
                    GitTracker::new(&cell.worktree_path)
                        .ok()
                        .and_then(|t| t.head_ref())
                });
                let Some(branch) = branch else {
                    warn!(cell = %cell.name, "Cell has no branch to merge");
                    report.waiting.push(cell.name.clone());
                    continue;
                };
                let message = format!("Merge cell {} ({})", cell.name, turn.name);
                match git::merge_no_ff(&self.ctx.root, &branch, &message, self.merge_timeout).await? {
                    MergeOutcome::Merged => None,
                    MergeOutcome::Conflict { detail } => Some(detail),
                }
            };

            match detail {
                None => {
                    info!(cell = %cell.name, "Cell merged");
                    report.merged.push(cell.name.clone());
                }
                Some(detail) => {
                    let task = self.divert(&cell, turn, &review, &detail)?;
                    report.conflicts.push((cell.name.clone(), task.id));
                }
            }
            store.advance_work_item(&review.id, WorkStatus::Closed)?;
        }

        info!(
            turn = %turn.id,
            merged = report.merged.len(),
            conflicts = report.conflicts.len(),
            "Round merge complete"
        );
        self.hooks
            .fire(
                &HookContext::new(HookEvent::RoundMerge, &self.ctx.name)
                    .with_turn(Some(&turn.id))
                    .with_extra("merged", serde_json::json!(report.merged)),
            )
            .await?;
        Ok(report)
    }

    /// Record the routing decision on the item. Items not yet counted against
    /// (cell, turn) are checked against the quota first.
    fn stamp(&self, item: &WorkItem, meta: &Metadata, cell: &Cell, turn: &TurnRecord) -> Result<WorkItem> {
        let counted = meta.cell.as_deref() == Some(cell.name.as_str())
            && meta.turn_id.as_deref() == Some(turn.id.as_str());
        if counted {
            return Ok(item.clone());
        }
        crate::quota::check(self.ctx.store.as_ref(), &cell.name, &turn.id, self.ctx.quota)?;

        let mut stamped = meta.clone();
        stamped.cell = Some(cell.name.clone());
        stamped.turn_id = Some(turn.id.clone());
        let description = with_metadata(&item.description, &stamped);
        self.ctx
            .store
            .update_description(&item.id, &description)
            .with_context(|| format!("Failed to record routing for {}", item.id))?;
        let mut updated = item.clone();
        updated.description = description;
        Ok(updated)
    }

    fn agent(&self, cell: &Cell, role: Role) -> Result<Agent> {
        self.ctx.store.create_agent(&NewAgent {
            cell: cell.name.clone(),
            role,
            session_handle: session::handle_for(
                &self.ctx.session_prefix,
                &self.ctx.name,
                &cell.name,
                role,
            ),
        })
    }

    /// Review items belonging to `turn`, in store order.
    fn reviews_for(&self, turn: &TurnRecord) -> Result<Vec<WorkItem>> {
        Ok(self
            .ctx
            .store
            .list_work_items(&WorkItemFilter::default().of_kind(WorkKind::Review))?
            .into_iter()
            .filter(|r| r.metadata().turn_id.as_deref() == Some(turn.id.as_str()))
            .collect())
    }

    fn base_branch(&self) -> Option<String> {
        match GitTracker::new(&self.ctx.root) {
            Ok(tracker) => tracker.base_branch(),
            Err(e) => {
                debug!(error = %e, "Rig root is not a git repository, reviewing every cell");
                None
            }
        }
    }

    fn divert(&self, cell: &Cell, turn: &TurnRecord, review: &WorkItem, detail: &str) -> Result<WorkItem> {
        let meta = Metadata {
            rig: Some(self.ctx.name.clone()),
            cell: Some(cell.name.clone()),
            role: Some(Role::Builder.to_string()),
            scope: Some(cell.scope_prefix.clone()),
            turn_id: Some(turn.id.clone()),
            conflict: true,
            ..Default::default()
        };
        let body = format!(
            "Cell {} could not be merged: {}\n\nRebase onto the base branch, resolve the \
conflicts and leave the branch ready to merge.",
            cell.name, detail
        );
        let new_item = NewWorkItem::new(
            WorkKind::Task,
            format!("Resolve merge conflict in {}", cell.name),
        )
        .with_scope(&cell.scope_prefix)
        .with_priority(0)
        .with_dep(store::DepRef::related(review.id.clone()))
        .with_description(with_metadata(&body, &meta));
        // Conflict work is never refused by the quota.
        let item = self
            .ctx
            .store
            .create_work_item(&new_item)
            .context("Failed to create conflict-resolution task")?;
        warn!(cell = %cell.name, work_item = %item.id, %detail, "Merge diverted to conflict resolution");
        Ok(item)
    }

    /// Nudge a live session so its stop hook picks up new work. Returns
    /// whether a line was sent; an absent session is not an error.
    async fn wake(&self, handle: &str) -> bool {
        match self.sessions.is_live(handle).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(handle, "Session not live, work waits for its next start");
                return false;
            }
            Err(e) => {
                debug!(handle, error = %e, "Session check failed");
                return false;
            }
        }
        match self.sessions.send_keys(handle, session::WAKE_MESSAGE).await {
            Ok(()) => true,
            Err(e) => {
                warn!(handle, error = %e, "Failed to wake session");
                false
            }
        }
    }
}

fn cell_has_changes(cell: &Cell, base: &str) -> bool {
    match GitTracker::new(&cell.worktree_path).and_then(|t| t.has_changes_against(base)) {
        Ok(changed) => changed,
        Err(e) => {
            debug!(cell = %cell.name, error = %e, "Change detection failed, treating as changed");
            true
        }
    }
}

fn is_quota(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RigError>().is_some_and(RigError::is_quota)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{add_cell, context};
    use crate::session::fake::FakeSessions;
    use crate::tracker::git::testing::{commit_now, commit_to_branch, init_repo};
    use std::fs;

    fn task(ctx: &RigContext, title: &str, scope: &str) -> WorkItem {
        ctx.store
            .create_work_item(&NewWorkItem::new(WorkKind::Task, title).with_scope(scope))
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_routes_assigns_and_wakes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let alpha = add_cell(&ctx, "alpha", "apps/alpha", &[Role::Builder]);
        add_cell(&ctx, "beta", "apps/beta", &[Role::Builder]);
        let t = task(&ctx, "T", "apps/alpha");
        let stray = task(&ctx, "stray", "billing");
        ctx.store
            .create_work_item(&NewWorkItem::new(WorkKind::Epic, "epic").with_scope("apps/alpha"))
            .unwrap();

        let sessions = FakeSessions::with_live(&["rig-demo-alpha-builder"]);
        let hooks = HookManager::disabled();
        let report = Round::new(&ctx, &sessions, &hooks).start().await.unwrap();

        assert_eq!(report.assigned.len(), 1);
        let assignment = &report.assigned[0];
        assert_eq!(assignment.work_item_id, t.id);
        assert_eq!(assignment.agent_id, "alpha/builder");
        assert_eq!(assignment.status, AssignmentStatus::Queued);
        assert_eq!(report.unroutable, vec![stray.id]);
        assert_eq!(report.woken, vec!["rig-demo-alpha-builder".to_string()]);
        assert_eq!(sessions.sent().len(), 1);

        let inbox = fs::read_to_string(alpha.worktree_path.join(format!("mail/inbox/{}.md", t.id)))
            .unwrap();
        assert!(inbox.contains("completion_promise: DONE"));

        let stamped = ctx.store.get_work_item(&t.id).unwrap().unwrap().metadata();
        assert_eq!(stamped.cell.as_deref(), Some("alpha"));
        assert_eq!(stamped.turn_id.as_deref(), Some("wi-turn0001"));

        let again = Round::new(&ctx, &sessions, &hooks).start().await.unwrap();
        assert!(again.assigned.is_empty());
        assert_eq!(again.already_bound, 1);
    }

    #[tokio::test]
    async fn test_start_respects_quota() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.quota = Some(1);
        add_cell(&ctx, "alpha", "apps/alpha", &[Role::Builder]);
        task(&ctx, "one", "apps/alpha/a");
        let second = task(&ctx, "two", "apps/alpha/b");

        let sessions = FakeSessions::default();
        let hooks = HookManager::disabled();
        let report = Round::new(&ctx, &sessions, &hooks).start().await.unwrap();
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.over_quota, vec![second.id]);
        assert!(report.woken.is_empty());
    }

    #[tokio::test]
    async fn test_start_requires_turn() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.turn = None;
        let sessions = FakeSessions::default();
        let hooks = HookManager::disabled();
        let err = Round::new(&ctx, &sessions, &hooks).start().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<RigError>(), Some(RigError::NoActiveTurn)));
    }

    #[tokio::test]
    async fn test_review_creates_once_per_cell_and_turn() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        add_cell(&ctx, "alpha", "apps/alpha", &[Role::Builder]);
        let sessions = FakeSessions::default();
        let hooks = HookManager::disabled();

        let round = Round::new(&ctx, &sessions, &hooks);
        let first = round.review().await.unwrap();
        assert_eq!(first.created.len(), 1);
        let (cell, review_id) = &first.created[0];
        assert_eq!(cell, "alpha");
        let review = ctx.store.get_work_item(review_id).unwrap().unwrap();
        assert_eq!(review.kind, WorkKind::Review);
        assert_eq!(review.metadata().role.as_deref(), Some("reviewer"));

        let active = ctx
            .store
            .list_assignments(&AssignmentFilter::active().for_agent("alpha/reviewer"))
            .unwrap();
        assert_eq!(active.len(), 1);

        let second = round.review().await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.already_open, vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_review_skips_unchanged_cells() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let repo = init_repo(dir.path());
        repo.set_head("refs/heads/main").unwrap();
        commit_now(dir.path(), "README.md", "rig\n", "init");
        // The cell's worktree is the rig repository itself, sitting on main.
        ctx.store
            .create_cell(&crate::store::Cell::new("alpha", "apps/alpha", dir.path()))
            .unwrap();

        let sessions = FakeSessions::default();
        let hooks = HookManager::disabled();
        let report = Round::new(&ctx, &sessions, &hooks).review().await.unwrap();
        assert_eq!(report.unchanged, vec!["alpha".to_string()]);
        assert!(report.created.is_empty());

        let forced = Round::new(&ctx, &sessions, &hooks)
            .review_all()
            .review()
            .await
            .unwrap();
        assert_eq!(forced.created.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_diverts_flagged_reviews() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        add_cell(&ctx, "alpha", "apps/alpha", &[Role::Builder]);
        let sessions = FakeSessions::default();
        let hooks = HookManager::disabled();
        let round = Round::new(&ctx, &sessions, &hooks);

        let (_, review_id) = round.review().await.unwrap().created.remove(0);
        let waiting = round.merge().await.unwrap();
        assert_eq!(waiting.waiting, vec!["alpha".to_string()]);

        let review = ctx.store.get_work_item(&review_id).unwrap().unwrap();
        let mut meta = review.metadata();
        meta.conflict = true;
        ctx.store
            .update_description(&review_id, &with_metadata(&review.description, &meta))
            .unwrap();
        ctx.store.advance_work_item(&review_id, WorkStatus::Done).unwrap();

        let report = round.merge().await.unwrap();
        assert!(report.merged.is_empty());
        assert_eq!(report.conflicts.len(), 1);
        let (_, task_id) = &report.conflicts[0];
        let task = ctx.store.get_work_item(task_id).unwrap().unwrap();
        assert_eq!(task.kind, WorkKind::Task);
        assert!(task.metadata().conflict);
        assert!(task.has_dep(store::DepRef::RELATED, &review_id));

        let closed = ctx.store.get_work_item(&review_id).unwrap().unwrap();
        assert_eq!(closed.status, WorkStatus::Closed);
        assert!(round.merge().await.unwrap().conflicts.is_empty());
    }

    /// A done review for `cell` in the active turn, pointing at `branch`.
    fn done_review(ctx: &RigContext, cell: &str, branch: &str) -> WorkItem {
        let meta = Metadata {
            cell: Some(cell.into()),
            turn_id: ctx.turn_id().map(str::to_string),
            branch: Some(branch.into()),
            ..Default::default()
        };
        let review = ctx
            .store
            .create_work_item(
                &NewWorkItem::new(WorkKind::Review, format!("Review {}", cell))
                    .with_description(with_metadata("Looks good.", &meta)),
            )
            .unwrap();
        ctx.store.advance_work_item(&review.id, WorkStatus::Done).unwrap();
        review
    }

    /// Rig root that is also a repository, with cell `alpha` working in it.
    fn merge_fixture(dir: &std::path::Path) -> RigContext {
        init_repo(dir);
        commit_now(dir, "README.md", "rig\n", "init");
        let ctx = context(dir);
        ctx.store
            .create_cell(&crate::store::Cell::new("alpha", "apps/alpha", dir))
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_merge_integrates_clean_branch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = merge_fixture(dir.path());
        commit_to_branch(dir.path(), "cell/alpha", "alpha.txt", "alpha\n", "alpha work");
        let review = done_review(&ctx, "alpha", "cell/alpha");

        let sessions = FakeSessions::default();
        let hooks = HookManager::disabled();
        let report = Round::new(&ctx, &sessions, &hooks).merge().await.unwrap();

        assert_eq!(report.merged, vec!["alpha".to_string()]);
        assert!(report.conflicts.is_empty());
        assert!(dir.path().join("alpha.txt").is_file());
        let closed = ctx.store.get_work_item(&review.id).unwrap().unwrap();
        assert_eq!(closed.status, WorkStatus::Closed);
    }

    #[tokio::test]
    async fn test_merge_conflict_aborts_and_diverts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = merge_fixture(dir.path());
        commit_to_branch(dir.path(), "cell/alpha", "README.md", "alpha\n", "alpha edit");
        commit_now(dir.path(), "README.md", "base\n", "base edit");
        let review = done_review(&ctx, "alpha", "cell/alpha");

        let sessions = FakeSessions::default();
        let hooks = HookManager::disabled();
        let report = Round::new(&ctx, &sessions, &hooks).merge().await.unwrap();

        assert!(report.merged.is_empty());
        assert_eq!(report.conflicts.len(), 1);
        assert!(!dir.path().join(".git/MERGE_HEAD").exists());
        assert_eq!(fs::read_to_string(dir.path().join("README.md")).unwrap(), "base\n");

        let task = ctx.store.get_work_item(&report.conflicts[0].1).unwrap().unwrap();
        assert!(task.metadata().conflict);
        assert!(task.has_dep(store::DepRef::RELATED, &review.id));
        let closed = ctx.store.get_work_item(&review.id).unwrap().unwrap();
        assert_eq!(closed.status, WorkStatus::Closed);
    }

    #[tokio::test]
    async fn test_merge_git_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = merge_fixture(dir.path());
        let review = done_review(&ctx, "alpha", "cell/missing");

        let sessions = FakeSessions::default();
        let hooks = HookManager::disabled();
        let err = Round::new(&ctx, &sessions, &hooks).merge().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RigError>(),
            Some(RigError::ExternalCommand { .. })
        ));

        // Nothing was diverted and the review is still waiting to merge.
        let review = ctx.store.get_work_item(&review.id).unwrap().unwrap();
        assert_eq!(review.status, WorkStatus::Done);
        let tasks = ctx
            .store
            .list_work_items(&WorkItemFilter::default().of_kind(WorkKind::Task))
            .unwrap();
        assert!(tasks.is_empty());
    }
}
