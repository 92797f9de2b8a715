use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use git2::{DiffOptions, Oid, Repository, RepositoryState, Sort};
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::errors::RigError;

/// Candidate base branches, in preference order.
pub const BASE_BRANCHES: &[&str] = &["main", "master", "trunk"];

/// Commit statistics for one repository within a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub commits: Vec<Oid>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Read-only queries against a repository or worktree.
pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(dir: &Path) -> Result<Self> {
        let repo = Repository::open(dir)
            .with_context(|| format!("Failed to open git repository at {}", dir.display()))?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    /// Branch name HEAD points at, or the commit SHA when detached.
    pub fn head_ref(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if head.is_branch() {
            head.shorthand().map(str::to_string)
        } else {
            head.target().map(|oid| oid.to_string())
        }
    }

    /// First of `main`, `master`, `trunk` that exists locally, else HEAD's branch.
    pub fn base_branch(&self) -> Option<String> {
        BASE_BRANCHES
            .iter()
            .find(|name| {
                self.repo
                    .find_branch(name, git2::BranchType::Local)
                    .is_ok()
            })
            .map(|name| name.to_string())
            .or_else(|| self.head_ref())
    }

    /// Whether HEAD's tree differs from the merge base with `base`.
    ///
    /// An unborn HEAD or an unknown base counts as no changes.
    pub fn has_changes_against(&self, base: &str) -> Result<bool> {
        let Some(head) = self.head_commit() else {
            return Ok(false);
        };
        let Ok(base_obj) = self.repo.revparse_single(base) else {
            tracing::debug!(base, "Base revision not found");
            return Ok(false);
        };
        let base_commit = base_obj
            .peel_to_commit()
            .with_context(|| format!("'{}' does not name a commit", base))?;
        let merge_base = self
            .repo
            .merge_base(base_commit.id(), head.id())
            .context("Failed to compute merge base")?;
        let base_tree = self.repo.find_commit(merge_base)?.tree()?;
        let head_tree = head.tree()?;
        let diff = self
            .repo
            .diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;
        Ok(diff.deltas().len() > 0)
    }

    /// Commits reachable from HEAD whose commit time lies in `[since, until]`,
    /// with line counts against each commit's first parent.
    pub fn window_stats(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<WindowStats> {
        self.window_stats_excluding(since, until, &HashSet::new())
    }

    /// As [`window_stats`](Self::window_stats), skipping commits in `seen`.
    pub fn window_stats_excluding(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        seen: &HashSet<Oid>,
    ) -> Result<WindowStats> {
        let mut stats = WindowStats::default();
        if self.head_commit().is_none() {
            return Ok(stats);
        }

        let mut walk = self.repo.revwalk()?;
        walk.set_sorting(Sort::TIME)?;
        walk.push_head()?;

        for oid in walk {
            let oid = oid?;
            if seen.contains(&oid) {
                continue;
            }
            let commit = self.repo.find_commit(oid)?;
            let Some(when) = DateTime::from_timestamp(commit.time().seconds(), 0) else {
                continue;
            };
            if when > until {
                continue;
            }
            if when < since {
                // Sorted by time: everything after this is older.
                break;
            }

            let tree = commit.tree()?;
            let parent_tree = match commit.parent(0) {
                Ok(parent) => Some(parent.tree()?),
                Err(_) => None,
            };
            let mut opts = DiffOptions::new();
            let diff = self
                .repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;
            let diff_stats = diff.stats()?;
            stats.lines_added += diff_stats.insertions();
            stats.lines_removed += diff_stats.deletions();
            stats.commits.push(oid);
        }

        Ok(stats)
    }
}

/// Result of integrating a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge stopped on conflicts and was aborted.
    Conflict { detail: String },
}

/// `git merge --no-ff <branch>` in `repo_dir`, bounded by `timeout`.
///
/// A merge that stops on conflicts is aborted so the repository is left as
/// it was. Any other failure is an error carrying git's stderr.
pub async fn merge_no_ff(
    repo_dir: &Path,
    branch: &str,
    message: &str,
    timeout: Duration,
) -> Result<MergeOutcome> {
    let args = ["merge", "--no-ff", "-m", message, branch];
    let output = run_git(repo_dir, &args, timeout).await?;
    if output.status.success() {
        return Ok(MergeOutcome::Merged);
    }

    let detail = {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        }
    };
    if !stopped_on_conflicts(repo_dir)? {
        return Err(RigError::ExternalCommand {
            command: format!("git merge --no-ff {}", branch),
            stderr: detail,
        }
        .into());
    }

    let abort = run_git(repo_dir, &["merge", "--abort"], timeout).await?;
    if !abort.status.success() {
        return Err(RigError::ExternalCommand {
            command: "git merge --abort".to_string(),
            stderr: String::from_utf8_lossy(&abort.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(MergeOutcome::Conflict { detail })
}

/// True when a merge is in progress with unmerged paths.
fn stopped_on_conflicts(repo_dir: &Path) -> Result<bool> {
    let repo = Repository::open(repo_dir)
        .with_context(|| format!("Failed to open git repository at {}", repo_dir.display()))?;
    let unmerged = repo.index().map(|index| index.has_conflicts()).unwrap_or(false);
    Ok(unmerged || repo.state() == RepositoryState::Merge)
}

async fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<std::process::Output> {
    let rendered = format!("git {}", args.join(" "));
    let child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn `{}`", rendered))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("Failed to wait for `{}`", rendered)),
        Err(_) => Err(RigError::Timeout {
            command: rendered,
            secs: timeout.as_secs(),
        }
        .into()),
    }
}
