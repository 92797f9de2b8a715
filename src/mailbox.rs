//! Inbox/outbox documents exchanged with workers.
//!
//! Paths are relative to the owning cell's worktree. The inbox document is
//! written atomically; the outbox is written by the worker and only read here.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::metadata;
use crate::store::{Role, WorkItem};
use crate::util::write_atomic;

pub const DEFAULT_PROMISE: &str = "DONE";
const ARCHIVE_DIR: &str = "archive";

/// Where mail lives inside a worktree and which token signals completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailLayout {
    pub inbox_dir: String,
    pub outbox_dir: String,
    pub promise: String,
}

impl Default for MailLayout {
    fn default() -> Self {
        Self {
            inbox_dir: "mail/inbox".to_string(),
            outbox_dir: "mail/outbox".to_string(),
            promise: DEFAULT_PROMISE.to_string(),
        }
    }
}

/// Effective mail paths and promise for one assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPaths {
    pub inbox: String,
    pub outbox: String,
    pub promise: String,
}

impl MailLayout {
    /// Fill in whatever the caller left blank from the work item id.
    pub fn resolve(
        &self,
        work_item_id: &str,
        inbox: Option<&str>,
        outbox: Option<&str>,
        promise: Option<&str>,
    ) -> MailPaths {
        let pick = |value: Option<&str>, fallback: String| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .unwrap_or(fallback)
        };
        let promise_fallback = if self.promise.trim().is_empty() {
            DEFAULT_PROMISE.to_string()
        } else {
            self.promise.clone()
        };
        MailPaths {
            inbox: pick(inbox, format!("{}/{}.md", self.inbox_dir, work_item_id)),
            outbox: pick(outbox, format!("{}/{}.md", self.outbox_dir, work_item_id)),
            promise: pick(promise, promise_fallback),
        }
    }
}

/// Render the inbox document for `item` as seen by `role`.
pub fn render(item: &WorkItem, role: Role, paths: &MailPaths) -> String {
    let scope = if item.scope.is_empty() {
        item.metadata().scope.unwrap_or_default()
    } else {
        item.scope.clone()
    };
    let body = metadata::strip(&item.description);
    let details = if body.is_empty() {
        "(no details provided)".to_string()
    } else {
        body
    };

    let mut doc = String::new();
    doc.push_str("---\n");
    doc.push_str(&format!("task_id: {}\n", item.id));
    doc.push_str(&format!("kind: {}\n", item.kind));
    doc.push_str(&format!("role: {}\n", role));
    doc.push_str(&format!("scope: {}\n", scope));
    doc.push_str(&format!("out_file: {}\n", paths.outbox));
    doc.push_str(&format!("completion_promise: {}\n", paths.promise));
    doc.push_str("---\n\n");
    doc.push_str(&format!("# Goal\n\n{}\n\n", item.title));
    doc.push_str(&format!("## Details\n\n{}\n\n", details));
    doc.push_str("## Deliverables\n\n");
    if scope.is_empty() {
        doc.push_str("- Complete the goal above.\n");
    } else {
        doc.push_str(&format!("- Complete the goal above within `{}`.\n", scope));
    }
    doc.push_str(&format!(
        "- Write a short summary to `{}` that contains the exact token `{}`.\n",
        paths.outbox, paths.promise
    ));
    doc
}

/// Atomically write the inbox document under `worktree`.
pub fn deliver(worktree: &Path, paths: &MailPaths, document: &str) -> Result<PathBuf> {
    let target = worktree.join(&paths.inbox);
    write_atomic(&target, document)
        .with_context(|| format!("Failed to write inbox {}", target.display()))?;
    Ok(target)
}

/// Contents of an outbox file, or `None` when it cannot be read yet.
pub fn read_outbox(worktree: &Path, rel_path: &str) -> Option<String> {
    fs::read_to_string(worktree.join(rel_path)).ok()
}

/// Move a mail file into the `archive/` directory beside it, keeping its name.
/// Returns false when there was nothing to move.
pub fn archive(worktree: &Path, rel_path: &str) -> Result<bool> {
    let source = worktree.join(rel_path);
    if !source.is_file() {
        return Ok(false);
    }
    let parent = source
        .parent()
        .with_context(|| format!("Mail file has no parent: {}", source.display()))?;
    let name = source
        .file_name()
        .with_context(|| format!("Mail file has no name: {}", source.display()))?;
    let archive_dir = parent.join(ARCHIVE_DIR);
    fs::create_dir_all(&archive_dir)
        .with_context(|| format!("Failed to create {}", archive_dir.display()))?;
    let target = archive_dir.join(name);
    fs::rename(&source, &target).with_context(|| {
        format!(
            "Failed to archive {} to {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(true)
}
