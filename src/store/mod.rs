//! Work item store contract and its two backends.
//!
//! The engine only ever talks to [`WorkStore`]. Two adapters implement it:
//!
//! | Backend      | Module   | Structure                                            |
//! |--------------|----------|------------------------------------------------------|
//! | `sqlite`     | `sqlite` | Native columns in `.rig/rig.db`                      |
//! | `flat`       | `flat`   | JSONL records, all fields in the description header  |
//!
//! `claim_next` is the one operation that must be a single conditional update.
//! Both adapters implement it that way (an `UPDATE … RETURNING` for SQLite,
//! an exclusive file lock around read-modify-write for the flat file).

pub mod flat;
pub mod models;
pub mod sqlite;

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use flat::FlatStore;
pub use models::*;
pub use sqlite::SqliteStore;

/// Persistence contract for cells, agents, work items and assignments.
pub trait WorkStore: Send + Sync {
    fn create_cell(&self, cell: &Cell) -> Result<Cell>;
    fn get_cell(&self, name: &str) -> Result<Option<Cell>>;
    /// Cells in creation order.
    fn list_cells(&self) -> Result<Vec<Cell>>;

    /// Create the agent for (cell, role), or return the existing one.
    fn create_agent(&self, agent: &NewAgent) -> Result<Agent>;
    fn get_agent(&self, id: &str) -> Result<Option<Agent>>;
    fn list_agents(&self) -> Result<Vec<Agent>>;
    fn update_agent_status(&self, id: &str, status: AgentStatus, at: DateTime<Utc>)
    -> Result<()>;

    fn create_work_item(&self, item: &NewWorkItem) -> Result<WorkItem>;
    fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>>;
    /// Work items in the store's natural (creation) order.
    fn list_work_items(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>>;
    /// Move a work item forward to `to`. Returns false when the item is
    /// already at or past `to`.
    fn advance_work_item(&self, id: &str, to: WorkStatus) -> Result<bool>;
    /// Conditional transition: applies only while the item is still `from`.
    fn transition_work_item(&self, id: &str, from: WorkStatus, to: WorkStatus) -> Result<bool>;
    fn update_description(&self, id: &str, description: &str) -> Result<()>;

    fn create_assignment(&self, assignment: &NewAssignment) -> Result<Assignment>;
    fn get_assignment(&self, id: &str) -> Result<Option<Assignment>>;
    /// Assignments in creation order.
    fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>>;
    /// Move the oldest queued assignment of `agent_id` to running, only if it
    /// is still queued, and return it.
    fn claim_next(&self, agent_id: &str) -> Result<Option<Assignment>>;
    /// Move a queued or running assignment to done. Returns false when it was
    /// already done.
    fn complete_assignment(&self, id: &str) -> Result<bool>;
}

/// Available store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Flat,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Flat => "flat",
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sql" => Ok(Self::Sqlite),
            "flat" | "jsonl" => Ok(Self::Flat),
            _ => anyhow::bail!("Invalid store backend '{}'. Valid values: sqlite, flat", s),
        }
    }
}

/// Open the configured backend inside the `.rig` directory.
pub fn open(backend: StoreBackend, rig_dir: &Path) -> Result<Box<dyn WorkStore>> {
    let store: Box<dyn WorkStore> = match backend {
        StoreBackend::Sqlite => Box::new(SqliteStore::open(&rig_dir.join("rig.db"))?),
        StoreBackend::Flat => Box::new(FlatStore::open(&rig_dir.join("issues.jsonl"))?),
    };
    Ok(store)
}

/// Generate a short prefixed identifier such as `wi-3f9a02c1`.
pub fn new_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..8])
}

/// Open items whose blocking dependencies are all finished, in store order.
pub fn ready_work_items(store: &dyn WorkStore) -> Result<Vec<WorkItem>> {
    let all = store.list_work_items(&WorkItemFilter::default())?;
    let finished: std::collections::HashSet<&str> = all
        .iter()
        .filter(|item| item.status.is_finished())
        .map(|item| item.id.as_str())
        .collect();

    Ok(all
        .iter()
        .filter(|item| item.status == WorkStatus::Open)
        .filter(|item| {
            item.deps
                .iter()
                .filter(|dep| dep.is_blocking())
                .all(|dep| finished.contains(dep.id.as_str()))
        })
        .cloned()
        .collect())
}

/// Shared behavioural checks run against every backend.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;

    pub fn new_queued(store: &dyn WorkStore, agent: &str) -> Assignment {
        let item = store
            .create_work_item(&NewWorkItem::new(WorkKind::Task, "work").with_scope("apps/alpha"))
            .unwrap();
        store
            .create_assignment(&NewAssignment {
                work_item_id: item.id.clone(),
                agent_id: agent.to_string(),
                status: AssignmentStatus::Queued,
                inbox_rel_path: format!("mail/inbox/{}.md", item.id),
                outbox_rel_path: format!("mail/outbox/{}.md", item.id),
                completion_promise: "DONE".into(),
                turn_id: Some("wi-turn".into()),
            })
            .unwrap()
    }

    pub fn cells_round_trip(store: &dyn WorkStore) {
        store
            .create_cell(&Cell::new("alpha", "apps/alpha", "/work/alpha"))
            .unwrap();
        store.create_cell(&Cell::new("root", "", "/work/root")).unwrap();

        let alpha = store.get_cell("alpha").unwrap().unwrap();
        assert_eq!(alpha.scope_prefix, "apps/alpha");
        assert_eq!(alpha.worktree_path, std::path::PathBuf::from("/work/alpha"));
        let root = store.get_cell("root").unwrap().unwrap();
        assert_eq!(root.scope_prefix, "");
        assert!(store.get_cell("ghost").unwrap().is_none());

        let names: Vec<String> = store
            .list_cells()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["alpha", "root"]);
        assert!(
            store
                .create_cell(&Cell::new("alpha", "x", "/elsewhere"))
                .is_err()
        );
    }

    pub fn agents_are_unique_per_cell_role(store: &dyn WorkStore) {
        let new = NewAgent {
            cell: "alpha".into(),
            role: Role::Builder,
            session_handle: "rig-demo-alpha-builder".into(),
        };
        let first = store.create_agent(&new).unwrap();
        let again = store.create_agent(&new).unwrap();
        assert_eq!(first.id, "alpha/builder");
        assert_eq!(first.id, again.id);
        assert_eq!(store.list_agents().unwrap().len(), 1);
        assert_eq!(first.status, AgentStatus::Idle);

        let now = Utc::now();
        store
            .update_agent_status(&first.id, AgentStatus::Running, now)
            .unwrap();
        let updated = store.get_agent(&first.id).unwrap().unwrap();
        assert_eq!(updated.status, AgentStatus::Running);
        assert_eq!(
            updated.last_heartbeat.map(|t| t.timestamp()),
            Some(now.timestamp())
        );
    }

    pub fn work_items_only_move_forward(store: &dyn WorkStore) {
        let item = store
            .create_work_item(
                &NewWorkItem::new(WorkKind::Task, "Add login")
                    .with_description("Body text")
                    .with_scope("apps/alpha")
                    .with_dep(DepRef::related("wi-x")),
            )
            .unwrap();
        assert_eq!(item.status, WorkStatus::Open);
        assert_eq!(item.scope, "apps/alpha");
        assert!(item.has_dep("related", "wi-x"));

        assert!(store.advance_work_item(&item.id, WorkStatus::Done).unwrap());
        assert!(
            !store
                .advance_work_item(&item.id, WorkStatus::InProgress)
                .unwrap()
        );
        assert!(!store.advance_work_item(&item.id, WorkStatus::Done).unwrap());
        assert_eq!(
            store.get_work_item(&item.id).unwrap().unwrap().status,
            WorkStatus::Done
        );
        assert!(
            store
                .advance_work_item(&item.id, WorkStatus::Closed)
                .unwrap()
        );
    }

    pub fn conditional_transition(store: &dyn WorkStore) {
        let item = store
            .create_work_item(&NewWorkItem::new(WorkKind::Task, "Claim me"))
            .unwrap();
        assert!(
            store
                .transition_work_item(&item.id, WorkStatus::Open, WorkStatus::InProgress)
                .unwrap()
        );
        assert!(
            !store
                .transition_work_item(&item.id, WorkStatus::Open, WorkStatus::InProgress)
                .unwrap()
        );
    }

    pub fn description_updates_keep_scope(store: &dyn WorkStore) {
        let item = store
            .create_work_item(
                &NewWorkItem::new(WorkKind::Task, "Scoped").with_scope("services/payments"),
            )
            .unwrap();
        let mut meta = item.metadata();
        meta.cell = Some("payments".into());
        let text = crate::metadata::with_metadata(&item.description, &meta);
        store.update_description(&item.id, &text).unwrap();

        let reloaded = store.get_work_item(&item.id).unwrap().unwrap();
        assert_eq!(reloaded.scope, "services/payments");
        assert_eq!(reloaded.metadata().cell.as_deref(), Some("payments"));
    }

    pub fn description_updates_clear_fields(store: &dyn WorkStore) {
        let item = store
            .create_work_item(
                &NewWorkItem::new(WorkKind::Review, "Flagged")
                    .with_scope("apps/alpha")
                    .with_description("---\ncell: alpha\nconflict: true\n---\n\nBody"),
            )
            .unwrap();
        assert!(item.metadata().conflict);

        let mut meta = item.metadata();
        assert!(meta.set("cell", ""));
        assert!(meta.set("conflict", "false"));
        let text = crate::metadata::with_metadata(&item.description, &meta);
        store.update_description(&item.id, &text).unwrap();

        let reloaded = store.get_work_item(&item.id).unwrap().unwrap();
        let meta = reloaded.metadata();
        assert_eq!(meta.cell, None);
        assert!(!meta.conflict);
        assert_eq!(reloaded.scope, "apps/alpha");
        assert_eq!(crate::metadata::strip(&reloaded.description), "Body");
    }

    pub fn list_filters_and_order(store: &dyn WorkStore) {
        let a = store
            .create_work_item(&NewWorkItem::new(WorkKind::Task, "first"))
            .unwrap();
        let b = store
            .create_work_item(&NewWorkItem::new(WorkKind::Review, "second"))
            .unwrap();
        let c = store
            .create_work_item(&NewWorkItem::new(WorkKind::Task, "third"))
            .unwrap();
        store.advance_work_item(&c.id, WorkStatus::Done).unwrap();

        let all: Vec<String> = store
            .list_work_items(&WorkItemFilter::default())
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(all, vec![a.id.clone(), b.id.clone(), c.id.clone()]);

        let open_tasks = store
            .list_work_items(&WorkItemFilter::with_statuses(&[WorkStatus::Open]).of_kind(WorkKind::Task))
            .unwrap();
        assert_eq!(open_tasks.len(), 1);
        assert_eq!(open_tasks[0].id, a.id);
    }

    pub fn claim_next_takes_oldest_once(store: &dyn WorkStore) {
        let first = new_queued(store, "alpha/builder");
        let second = new_queued(store, "alpha/builder");
        new_queued(store, "beta/builder");

        let claimed = store.claim_next("alpha/builder").unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, AssignmentStatus::Running);

        let next = store.claim_next("alpha/builder").unwrap().unwrap();
        assert_eq!(next.id, second.id);
        assert!(store.claim_next("alpha/builder").unwrap().is_none());
        assert!(store.claim_next("gamma/builder").unwrap().is_none());
    }

    pub fn complete_assignment_is_conditional(store: &dyn WorkStore) {
        let assignment = new_queued(store, "alpha/builder");
        assert!(store.complete_assignment(&assignment.id).unwrap());
        assert!(!store.complete_assignment(&assignment.id).unwrap());
        let reloaded = store.get_assignment(&assignment.id).unwrap().unwrap();
        assert_eq!(reloaded.status, AssignmentStatus::Done);
        assert_eq!(reloaded.turn_id.as_deref(), Some("wi-turn"));
        assert!(store.claim_next("alpha/builder").unwrap().is_none());

        let active = store
            .list_assignments(&AssignmentFilter::active().for_work_item(&assignment.work_item_id))
            .unwrap();
        assert!(active.is_empty());
    }

    pub fn run_all(make: impl Fn() -> Box<dyn WorkStore>) {
        cells_round_trip(make().as_ref());
        agents_are_unique_per_cell_role(make().as_ref());
        work_items_only_move_forward(make().as_ref());
        conditional_transition(make().as_ref());
        description_updates_keep_scope(make().as_ref());
        description_updates_clear_fields(make().as_ref());
        list_filters_and_order(make().as_ref());
        claim_next_takes_oldest_once(make().as_ref());
        complete_assignment_is_conditional(make().as_ref());
    }
}
