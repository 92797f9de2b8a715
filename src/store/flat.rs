//! Flat issue-tracker backend.
//!
//! One JSON record per line in `.rig/issues.jsonl`. A record only has the
//! columns a generic issue tracker offers (id, title, description, status,
//! priority, type, dependencies, timestamps). Cells, agents and assignments
//! are stored as records of a reserved type, and every field without a
//! native column lives in the description header (see [`crate::metadata`]).
//!
//! Every mutation holds an exclusive lock on `issues.lock` for the whole
//! read-modify-write and replaces the file through a temp-file rename.
//! Readers take a shared lock on the same file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::models::*;
use super::{WorkStore, new_id};
use crate::errors::RigError;
use crate::metadata::{self, Metadata};

const TYPE_CELL: &str = "cell";
const TYPE_AGENT: &str = "agent";
const TYPE_ASSIGNMENT: &str = "assignment";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssueRecord {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    status: String,
    #[serde(default = "default_priority")]
    priority: i32,
    issue_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn is_reserved_type(issue_type: &str) -> bool {
    matches!(issue_type, TYPE_CELL | TYPE_AGENT | TYPE_ASSIGNMENT)
}

fn default_priority() -> i32 {
    NewWorkItem::DEFAULT_PRIORITY
}

impl IssueRecord {
    fn new(id: String, title: String, issue_type: &str, meta: &Metadata, body: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            description: metadata::with_metadata(body, meta),
            status: WorkStatus::Open.as_str().to_string(),
            priority: NewWorkItem::DEFAULT_PRIORITY,
            issue_type: issue_type.to_string(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn meta(&self) -> Metadata {
        Metadata::decode(&self.description)
    }

    fn set_meta(&mut self, meta: &Metadata) {
        self.description = metadata::with_metadata(&self.description, meta);
        self.updated_at = Utc::now();
    }

    fn is_work_item(&self) -> bool {
        !is_reserved_type(&self.issue_type)
    }

    fn to_cell(&self) -> Cell {
        let meta = self.meta();
        Cell {
            name: meta.cell.unwrap_or_else(|| self.title.clone()),
            scope_prefix: meta.scope.unwrap_or_default(),
            worktree_path: PathBuf::from(meta.worktree.unwrap_or_default()),
        }
    }

    fn to_agent(&self) -> Result<Agent> {
        let meta = self.meta();
        let role = meta.role.as_deref().unwrap_or_default();
        Ok(Agent {
            id: self.id.clone(),
            cell: meta.cell.clone().unwrap_or_default(),
            role: Role::from_str(role).map_err(|e| anyhow::anyhow!(e))?,
            session_handle: meta.session.clone().unwrap_or_default(),
            status: match meta.status.as_deref() {
                Some(status) => AgentStatus::from_str(status).map_err(|e| anyhow::anyhow!(e))?,
                None => AgentStatus::Idle,
            },
            last_heartbeat: meta
                .heartbeat
                .as_deref()
                .map(|raw| {
                    DateTime::parse_from_rfc3339(raw)
                        .map(|t| t.with_timezone(&Utc))
                        .with_context(|| format!("Invalid heartbeat '{}'", raw))
                })
                .transpose()?,
        })
    }

    fn to_work_item(&self) -> Result<WorkItem> {
        let deps = self
            .dependencies
            .iter()
            .map(|d| DepRef::from_str(d).map_err(|e| anyhow::anyhow!(e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkItem {
            id: self.id.clone(),
            kind: WorkKind::from_str(&self.issue_type).map_err(|e| anyhow::anyhow!(e))?,
            title: self.title.clone(),
            description: self.description.clone(),
            status: WorkStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            priority: self.priority,
            scope: self.meta().scope.unwrap_or_default(),
            deps,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    fn to_assignment(&self) -> Result<Assignment> {
        let meta = self.meta();
        let status = meta.status.as_deref().unwrap_or("queued");
        Ok(Assignment {
            id: self.id.clone(),
            work_item_id: meta.work_item.clone().unwrap_or_default(),
            agent_id: meta.agent.clone().unwrap_or_default(),
            status: AssignmentStatus::from_str(status).map_err(|e| anyhow::anyhow!(e))?,
            inbox_rel_path: meta.inbox.clone().unwrap_or_default(),
            outbox_rel_path: meta.outbox.clone().unwrap_or_default(),
            completion_promise: meta.promise.clone().unwrap_or_default(),
            turn_id: meta.turn_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    fn set_assignment_status(&mut self, status: AssignmentStatus) {
        let mut meta = self.meta();
        meta.status = Some(status.as_str().to_string());
        self.status = match status {
            AssignmentStatus::Queued => WorkStatus::Open,
            AssignmentStatus::Running => WorkStatus::InProgress,
            AssignmentStatus::Done => WorkStatus::Done,
        }
        .as_str()
        .to_string();
        self.set_meta(&meta);
    }
}

/// A line of the issues file. Lines that fail to parse are kept verbatim so
/// a rewrite never drops data written by another tool.
enum Line {
    Record(IssueRecord),
    Raw(String),
}

/// JSONL-backed store.
pub struct FlatStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FlatStore {
    /// Open the issues file at `path`, creating it and its lock file if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let dir = path
            .parent()
            .context("Issues file has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: path.with_extension("lock"),
        })
    }

    fn lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file {}", self.lock_path.display()))
    }

    fn read_lines(&self) -> Result<Vec<Line>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };
        let mut lines = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IssueRecord>(line) {
                Ok(record) => lines.push(Line::Record(record)),
                Err(e) => {
                    tracing::warn!(
                        file = %self.path.display(),
                        line = n + 1,
                        error = %e,
                        "Skipping unreadable issue record"
                    );
                    lines.push(Line::Raw(line.to_string()));
                }
            }
        }
        Ok(lines)
    }

    fn write_lines(&self, lines: &[Line]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("Issues file has no parent directory")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temp file for issues")?;
        for line in lines {
            let text = match line {
                Line::Record(record) => {
                    serde_json::to_string(record).context("Failed to serialize issue record")?
                }
                Line::Raw(raw) => raw.clone(),
            };
            writeln!(tmp, "{}", text).context("Failed to write issue record")?;
        }
        tmp.flush().context("Failed to flush issues")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Run `f` over the parsed records under a shared lock.
    fn read<R>(&self, f: impl FnOnce(Vec<IssueRecord>) -> Result<R>) -> Result<R> {
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock).context("Failed to acquire shared issues lock")?;
        let result = self.read_lines().and_then(|lines| {
            f(lines
                .into_iter()
                .filter_map(|line| match line {
                    Line::Record(record) => Some(record),
                    Line::Raw(_) => None,
                })
                .collect())
        });
        FileExt::unlock(&lock).context("Failed to release issues lock")?;
        result
    }

    /// Run `f` under the exclusive lock. The file is rewritten when `f`
    /// reports a change.
    fn mutate<R>(&self, f: impl FnOnce(&mut Records<'_>) -> Result<(R, bool)>) -> Result<R> {
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock).context("Failed to acquire exclusive issues lock")?;
        let result = (|| {
            let mut lines = self.read_lines()?;
            let (value, changed) = f(&mut Records(&mut lines))?;
            if changed {
                self.write_lines(&lines)?;
            }
            Ok(value)
        })();
        FileExt::unlock(&lock).context("Failed to release issues lock")?;
        result
    }
}

/// Mutable view over the parsed records of the issues file.
struct Records<'a>(&'a mut Vec<Line>);

impl Records<'_> {
    fn iter_mut(&mut self) -> impl Iterator<Item = &mut IssueRecord> {
        self.0.iter_mut().filter_map(|line| match line {
            Line::Record(record) => Some(record),
            Line::Raw(_) => None,
        })
    }

    fn iter(&self) -> impl Iterator<Item = &IssueRecord> {
        self.0.iter().filter_map(|line| match line {
            Line::Record(record) => Some(record),
            Line::Raw(_) => None,
        })
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut IssueRecord> {
        self.iter_mut().find(|r| r.id == id)
    }

    fn push(&mut self, record: IssueRecord) {
        self.0.push(Line::Record(record));
    }
}

fn cell_record_id(name: &str) -> String {
    format!("cell-{}", name)
}

impl WorkStore for FlatStore {
    fn create_cell(&self, cell: &Cell) -> Result<Cell> {
        self.mutate(|records| {
            let id = cell_record_id(&cell.name);
            if records.iter().any(|r| r.id == id) {
                anyhow::bail!("Cell '{}' already exists", cell.name);
            }
            let meta = Metadata {
                cell: Some(cell.name.clone()),
                scope: Some(cell.scope_prefix.clone()),
                worktree: Some(cell.worktree_path.to_string_lossy().into_owned()),
                ..Default::default()
            };
            records.push(IssueRecord::new(
                id,
                cell.name.clone(),
                TYPE_CELL,
                &meta,
                "",
            ));
            Ok((cell.clone(), true))
        })
    }

    fn get_cell(&self, name: &str) -> Result<Option<Cell>> {
        let id = cell_record_id(name);
        self.read(|records| {
            Ok(records
                .iter()
                .find(|r| r.issue_type == TYPE_CELL && r.id == id)
                .map(IssueRecord::to_cell))
        })
    }

    fn list_cells(&self) -> Result<Vec<Cell>> {
        self.read(|records| {
            Ok(records
                .iter()
                .filter(|r| r.issue_type == TYPE_CELL)
                .map(IssueRecord::to_cell)
                .collect())
        })
    }

    fn create_agent(&self, agent: &NewAgent) -> Result<Agent> {
        let id = Agent::id_for(&agent.cell, agent.role);
        self.mutate(|records| {
            if let Some(existing) = records
                .iter()
                .find(|r| r.issue_type == TYPE_AGENT && r.id == id)
            {
                return Ok((existing.to_agent()?, false));
            }
            let meta = Metadata {
                cell: Some(agent.cell.clone()),
                role: Some(agent.role.as_str().to_string()),
                session: Some(agent.session_handle.clone()),
                status: Some(AgentStatus::Idle.as_str().to_string()),
                ..Default::default()
            };
            let record = IssueRecord::new(id.clone(), id.clone(), TYPE_AGENT, &meta, "");
            let created = record.to_agent()?;
            records.push(record);
            Ok((created, true))
        })
    }

    fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        self.read(|records| {
            records
                .iter()
                .find(|r| r.issue_type == TYPE_AGENT && r.id == id)
                .map(IssueRecord::to_agent)
                .transpose()
        })
    }

    fn list_agents(&self) -> Result<Vec<Agent>> {
        self.read(|records| {
            records
                .iter()
                .filter(|r| r.issue_type == TYPE_AGENT)
                .map(IssueRecord::to_agent)
                .collect()
        })
    }

    fn update_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|records| {
            let record = records
                .find_mut(id)
                .filter(|r| r.issue_type == TYPE_AGENT)
                .ok_or_else(|| RigError::not_found("Agent", id))?;
            let mut meta = record.meta();
            meta.status = Some(status.as_str().to_string());
            meta.heartbeat = Some(at.to_rfc3339());
            record.set_meta(&meta);
            Ok(((), true))
        })
    }

    fn create_work_item(&self, item: &NewWorkItem) -> Result<WorkItem> {
        if is_reserved_type(item.kind.as_str()) {
            anyhow::bail!("Work item kind '{}' is reserved", item.kind);
        }
        self.mutate(|records| {
            let mut meta = Metadata::decode(&item.description);
            if !item.scope.is_empty() {
                meta.scope = Some(item.scope.clone());
            }
            let mut record = IssueRecord::new(
                new_id("wi"),
                item.title.clone(),
                item.kind.as_str(),
                &meta,
                &item.description,
            );
            record.priority = item.priority;
            record.dependencies = item.deps.iter().map(ToString::to_string).collect();
            let created = record.to_work_item()?;
            records.push(record);
            Ok((created, true))
        })
    }

    fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        self.read(|records| {
            records
                .iter()
                .find(|r| r.is_work_item() && r.id == id)
                .map(IssueRecord::to_work_item)
                .transpose()
        })
    }

    fn list_work_items(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>> {
        self.read(|records| {
            let mut items = Vec::new();
            for record in records.iter().filter(|r| r.is_work_item()) {
                match record.to_work_item() {
                    Ok(item) if filter.matches(&item) => items.push(item),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(id = %record.id, error = %e, "Skipping malformed work item");
                    }
                }
            }
            Ok(items)
        })
    }

    fn advance_work_item(&self, id: &str, to: WorkStatus) -> Result<bool> {
        self.mutate(|records| {
            let record = records
                .find_mut(id)
                .filter(|r| r.is_work_item())
                .ok_or_else(|| RigError::not_found("Work item", id))?;
            let current = WorkStatus::from_str(&record.status).map_err(|e| anyhow::anyhow!(e))?;
            if current.rank() >= to.rank() {
                return Ok((false, false));
            }
            record.status = to.as_str().to_string();
            record.updated_at = Utc::now();
            Ok((true, true))
        })
    }

    fn transition_work_item(&self, id: &str, from: WorkStatus, to: WorkStatus) -> Result<bool> {
        self.mutate(|records| {
            let Some(record) = records
                .find_mut(id)
                .filter(|r| r.is_work_item() && r.status == from.as_str())
            else {
                return Ok((false, false));
            };
            record.status = to.as_str().to_string();
            record.updated_at = Utc::now();
            Ok((true, true))
        })
    }

    fn update_description(&self, id: &str, description: &str) -> Result<()> {
        self.mutate(|records| {
            let record = records
                .find_mut(id)
                .filter(|r| r.is_work_item())
                .ok_or_else(|| RigError::not_found("Work item", id))?;
            // Scope has no column of its own here, so it must survive rewrites.
            let mut meta = Metadata::decode(description);
            meta.scope = record.meta().scope;
            record.description = metadata::with_metadata(description, &meta);
            record.updated_at = Utc::now();
            Ok(((), true))
        })
    }

    fn create_assignment(&self, assignment: &NewAssignment) -> Result<Assignment> {
        self.mutate(|records| {
            let meta = Metadata {
                agent: Some(assignment.agent_id.clone()),
                work_item: Some(assignment.work_item_id.clone()),
                inbox: Some(assignment.inbox_rel_path.clone()),
                outbox: Some(assignment.outbox_rel_path.clone()),
                promise: Some(assignment.completion_promise.clone()),
                turn_id: assignment.turn_id.clone(),
                ..Default::default()
            };
            let mut record = IssueRecord::new(
                new_id("as"),
                format!("{} -> {}", assignment.work_item_id, assignment.agent_id),
                TYPE_ASSIGNMENT,
                &meta,
                "",
            );
            record.dependencies = vec![DepRef::related(&assignment.work_item_id).to_string()];
            record.set_assignment_status(assignment.status);
            let created = record.to_assignment()?;
            records.push(record);
            Ok((created, true))
        })
    }

    fn get_assignment(&self, id: &str) -> Result<Option<Assignment>> {
        self.read(|records| {
            records
                .iter()
                .find(|r| r.issue_type == TYPE_ASSIGNMENT && r.id == id)
                .map(IssueRecord::to_assignment)
                .transpose()
        })
    }

    fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>> {
        self.read(|records| {
            let mut assignments = Vec::new();
            for record in records.iter().filter(|r| r.issue_type == TYPE_ASSIGNMENT) {
                match record.to_assignment() {
                    Ok(a) if filter.matches(&a) => assignments.push(a),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(id = %record.id, error = %e, "Skipping malformed assignment");
                    }
                }
            }
            Ok(assignments)
        })
    }

    fn claim_next(&self, agent_id: &str) -> Result<Option<Assignment>> {
        self.mutate(|records| {
            let oldest = records
                .iter()
                .filter(|r| r.issue_type == TYPE_ASSIGNMENT)
                .filter_map(|r| r.to_assignment().ok())
                .filter(|a| a.agent_id == agent_id && a.status == AssignmentStatus::Queued)
                .min_by_key(|a| a.created_at)
                .map(|a| a.id);
            let Some(id) = oldest else {
                return Ok((None, false));
            };
            let Some(record) = records.find_mut(&id) else {
                return Ok((None, false));
            };
            record.set_assignment_status(AssignmentStatus::Running);
            Ok((Some(record.to_assignment()?), true))
        })
    }

    fn complete_assignment(&self, id: &str) -> Result<bool> {
        self.mutate(|records| {
            let Some(record) = records
                .find_mut(id)
                .filter(|r| r.issue_type == TYPE_ASSIGNMENT)
            else {
                return Ok((false, false));
            };
            if !record.to_assignment()?.status.is_active() {
                return Ok((false, false));
            }
            record.set_assignment_status(AssignmentStatus::Done);
            Ok((true, true))
        })
    }
}
