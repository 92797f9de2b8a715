use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// Worker role within a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Builder,
    Monitor,
    Reviewer,
    Architect,
    /// Unified role that both builds and reviews inside its cell.
    Cell,
}

impl Role {
    pub fn all() -> &'static [Role] {
        &[
            Role::Builder,
            Role::Monitor,
            Role::Reviewer,
            Role::Architect,
            Role::Cell,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builder => "builder",
            Self::Monitor => "monitor",
            Self::Reviewer => "reviewer",
            Self::Architect => "architect",
            Self::Cell => "cell",
        }
    }

    /// Roles that may never write files or run shell commands.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Reviewer | Self::Monitor | Self::Architect)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "builder" => Ok(Self::Builder),
            "monitor" => Ok(Self::Monitor),
            "reviewer" => Ok(Self::Reviewer),
            "architect" => Ok(Self::Architect),
            "cell" => Ok(Self::Cell),
            _ => Err(format!(
                "Invalid role '{}'. Valid values: builder, monitor, reviewer, architect, cell",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Claimed,
    Running,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claimed => "claimed",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            _ => Err(format!("Invalid agent status: {}", s)),
        }
    }
}

/// Kind of a work item. Unknown kinds coming from a tracker are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Task,
    Request,
    Observation,
    Review,
    Pr,
    Epic,
    Decision,
    Contract,
    Build,
    Deploy,
    Event,
    Turn,
    Other(String),
}

impl WorkKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Task => "task",
            Self::Request => "request",
            Self::Observation => "observation",
            Self::Review => "review",
            Self::Pr => "pr",
            Self::Epic => "epic",
            Self::Decision => "decision",
            Self::Contract => "contract",
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Event => "event",
            Self::Turn => "turn",
            Self::Other(kind) => kind,
        }
    }

    /// Kinds that Round-start routes to builders.
    pub fn is_round_schedulable(&self) -> bool {
        matches!(self, Self::Task | Self::Request | Self::Observation)
    }

    /// Kinds a worker may pick up through the stop hook.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            Self::Task | Self::Request | Self::Observation | Self::Review | Self::Pr | Self::Build
        )
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_lowercase().as_str() {
            "" => return Err("Work item kind must not be empty".to_string()),
            "task" => Self::Task,
            "request" => Self::Request,
            "observation" => Self::Observation,
            "review" => Self::Review,
            "pr" => Self::Pr,
            "epic" => Self::Epic,
            "decision" => Self::Decision,
            "contract" => Self::Contract,
            "build" => Self::Build,
            "deploy" => Self::Deploy,
            "event" => Self::Event,
            "turn" => Self::Turn,
            other => Self::Other(other.to_string()),
        };
        Ok(kind)
    }
}

/// Work item status. Transitions only move forward through `rank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Open,
    InProgress,
    Done,
    Closed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Closed => "closed",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Open => 0,
            Self::InProgress => 1,
            Self::Done => 2,
            Self::Closed => 3,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Closed)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid work item status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Queued,
    Running,
    Done,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Done)
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid assignment status: {}", s)),
        }
    }
}

/// Typed reference from one work item to another, written `kind:id`.
/// A bare id is a blocking dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepRef {
    pub kind: String,
    pub id: String,
}

impl DepRef {
    pub const BLOCKS: &'static str = "blocks";
    pub const RELATED: &'static str = "related";
    pub const REVIEW: &'static str = "review";

    pub fn new(kind: &str, id: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn related(id: impl Into<String>) -> Self {
        Self::new(Self::RELATED, id)
    }

    pub fn review(id: impl Into<String>) -> Self {
        Self::new(Self::REVIEW, id)
    }

    /// Only blocking references gate readiness.
    pub fn is_blocking(&self) -> bool {
        self.kind == Self::BLOCKS
    }
}

impl fmt::Display for DepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for DepRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty dependency reference".to_string());
        }
        match s.split_once(':') {
            Some((kind, id)) if !kind.trim().is_empty() && !id.trim().is_empty() => {
                Ok(Self::new(kind.trim(), id.trim()))
            }
            Some(_) => Err(format!("Invalid dependency reference: {}", s)),
            None => Ok(Self::new(Self::BLOCKS, s)),
        }
    }
}

/// A named scoped working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub name: String,
    pub scope_prefix: String,
    pub worktree_path: PathBuf,
}

impl Cell {
    pub fn new(
        name: impl Into<String>,
        scope_prefix: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            scope_prefix: scope_prefix.into(),
            worktree_path: worktree_path.into(),
        }
    }
}

/// One (cell, role) worker identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub cell: String,
    pub role: Role,
    pub session_handle: String,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Agent {
    /// Agents are keyed by their (cell, role) pair.
    pub fn id_for(cell: &str, role: Role) -> String {
        format!("{}/{}", cell, role.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub cell: String,
    pub role: Role,
    pub session_handle: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub kind: WorkKind,
    pub title: String,
    pub description: String,
    pub status: WorkStatus,
    pub priority: i32,
    pub scope: String,
    pub deps: Vec<DepRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Decode the metadata header embedded in the description.
    pub fn metadata(&self) -> Metadata {
        Metadata::decode(&self.description)
    }

    pub fn has_dep(&self, kind: &str, id: &str) -> bool {
        self.deps.iter().any(|d| d.kind == kind && d.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub kind: WorkKind,
    pub title: String,
    pub description: String,
    pub priority: i32,
    pub scope: String,
    pub deps: Vec<DepRef>,
}

impl NewWorkItem {
    pub const DEFAULT_PRIORITY: i32 = 2;

    pub fn new(kind: WorkKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            description: String::new(),
            priority: Self::DEFAULT_PRIORITY,
            scope: String::new(),
            deps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dep(mut self, dep: DepRef) -> Self {
        self.deps.push(dep);
        self
    }
}

/// Binding of one work item to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub work_item_id: String,
    pub agent_id: String,
    pub status: AssignmentStatus,
    pub inbox_rel_path: String,
    pub outbox_rel_path: String,
    pub completion_promise: String,
    pub turn_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub work_item_id: String,
    pub agent_id: String,
    pub status: AssignmentStatus,
    pub inbox_rel_path: String,
    pub outbox_rel_path: String,
    pub completion_promise: String,
    pub turn_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkItemFilter {
    pub statuses: Vec<WorkStatus>,
    pub kind: Option<WorkKind>,
}

impl WorkItemFilter {
    pub fn with_statuses(statuses: &[WorkStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            kind: None,
        }
    }

    pub fn of_kind(mut self, kind: WorkKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&item.status))
            && self.kind.as_ref().is_none_or(|k| *k == item.kind)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub statuses: Vec<AssignmentStatus>,
    pub agent_id: Option<String>,
    pub work_item_id: Option<String>,
}

impl AssignmentFilter {
    pub fn active() -> Self {
        Self {
            statuses: vec![AssignmentStatus::Queued, AssignmentStatus::Running],
            ..Default::default()
        }
    }

    pub fn for_work_item(mut self, id: impl Into<String>) -> Self {
        self.work_item_id = Some(id.into());
        self
    }

    pub fn for_agent(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    pub fn matches(&self, assignment: &Assignment) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&assignment.status))
            && self
                .agent_id
                .as_ref()
                .is_none_or(|id| *id == assignment.agent_id)
            && self
                .work_item_id
                .as_ref()
                .is_none_or(|id| *id == assignment.work_item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_and_read_only() {
        for role in Role::all() {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), *role);
        }
        assert!(Role::Reviewer.is_read_only());
        assert!(Role::Monitor.is_read_only());
        assert!(Role::Architect.is_read_only());
        assert!(!Role::Builder.is_read_only());
        assert!(!Role::Cell.is_read_only());
        assert!("janitor".parse::<Role>().is_err());
    }

    #[test]
    fn test_work_kind_preserves_unknown() {
        assert_eq!("task".parse::<WorkKind>().unwrap(), WorkKind::Task);
        assert_eq!(
            "spike".parse::<WorkKind>().unwrap(),
            WorkKind::Other("spike".into())
        );
        assert!("".parse::<WorkKind>().is_err());
    }

    #[test]
    fn test_work_status_rank_is_forward() {
        assert!(WorkStatus::Open.rank() < WorkStatus::InProgress.rank());
        assert!(WorkStatus::InProgress.rank() < WorkStatus::Done.rank());
        assert!(WorkStatus::Done.rank() < WorkStatus::Closed.rank());
    }

    #[test]
    fn test_dep_ref_parse() {
        let dep: DepRef = "related:wi-1".parse().unwrap();
        assert_eq!(dep, DepRef::related("wi-1"));
        assert!(!dep.is_blocking());
        let bare: DepRef = "wi-2".parse().unwrap();
        assert!(bare.is_blocking());
        assert_eq!(bare.to_string(), "blocks:wi-2");
        assert!("related:".parse::<DepRef>().is_err());
    }

    #[test]
    fn test_assignment_filter_matches() {
        let now = Utc::now();
        let assignment = Assignment {
            id: "as-1".into(),
            work_item_id: "wi-1".into(),
            agent_id: "alpha/builder".into(),
            status: AssignmentStatus::Running,
            inbox_rel_path: "mail/inbox/wi-1.md".into(),
            outbox_rel_path: "mail/outbox/wi-1.md".into(),
            completion_promise: "DONE".into(),
            turn_id: None,
            created_at: now,
            updated_at: now,
        };
        assert!(AssignmentFilter::active().matches(&assignment));
        assert!(
            AssignmentFilter::active()
                .for_work_item("wi-1")
                .matches(&assignment)
        );
        assert!(
            !AssignmentFilter::active()
                .for_agent("beta/builder")
                .matches(&assignment)
        );
    }
}
