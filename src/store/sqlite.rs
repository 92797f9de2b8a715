use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::models::*;
use super::{WorkStore, new_id};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Relational backend with native columns for every field.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        run_migrations(&conn).context("Failed to run migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cells (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            scope_prefix TEXT NOT NULL DEFAULT '',
            worktree_path TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            cell TEXT NOT NULL,
            role TEXT NOT NULL,
            session_handle TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'idle',
            last_heartbeat TEXT,
            UNIQUE(cell, role)
        );

        CREATE TABLE IF NOT EXISTS work_items (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'open',
            priority INTEGER NOT NULL DEFAULT 2,
            scope TEXT NOT NULL DEFAULT '',
            deps TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS assignments (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            work_item_id TEXT NOT NULL REFERENCES work_items(id),
            agent_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            inbox_rel_path TEXT NOT NULL,
            outbox_rel_path TEXT NOT NULL,
            completion_promise TEXT NOT NULL,
            turn_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);
        CREATE INDEX IF NOT EXISTS idx_assignments_agent ON assignments(agent_id, status);
        CREATE INDEX IF NOT EXISTS idx_assignments_work_item ON assignments(work_item_id);
        ",
    )
    .context("Failed to create tables")?;
    Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

const WORK_ITEM_COLUMNS: &str =
    "id, kind, title, description, status, priority, scope, deps, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str = "id, work_item_id, agent_id, status, inbox_rel_path, outbox_rel_path, completion_promise, turn_id, created_at, updated_at";

struct AgentRow {
    id: String,
    cell: String,
    role: String,
    session_handle: String,
    status: String,
    last_heartbeat: Option<String>,
}

impl AgentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            cell: row.get(1)?,
            role: row.get(2)?,
            session_handle: row.get(3)?,
            status: row.get(4)?,
            last_heartbeat: row.get(5)?,
        })
    }

    fn into_agent(self) -> Result<Agent> {
        Ok(Agent {
            role: Role::from_str(&self.role).map_err(|e| anyhow::anyhow!(e))?,
            status: AgentStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            last_heartbeat: self
                .last_heartbeat
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            id: self.id,
            cell: self.cell,
            session_handle: self.session_handle,
        })
    }
}

struct WorkItemRow {
    id: String,
    kind: String,
    title: String,
    description: String,
    status: String,
    priority: i32,
    scope: String,
    deps: String,
    created_at: String,
    updated_at: String,
}

impl WorkItemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            priority: row.get(5)?,
            scope: row.get(6)?,
            deps: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_work_item(self) -> Result<WorkItem> {
        let deps: Vec<String> = serde_json::from_str(&self.deps)
            .with_context(|| format!("Invalid deps for work item {}", self.id))?;
        let deps = deps
            .iter()
            .map(|d| DepRef::from_str(d).map_err(|e| anyhow::anyhow!(e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkItem {
            kind: WorkKind::from_str(&self.kind).map_err(|e| anyhow::anyhow!(e))?,
            status: WorkStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            title: self.title,
            description: self.description,
            priority: self.priority,
            scope: self.scope,
            deps,
        })
    }
}

struct AssignmentRow {
    id: String,
    work_item_id: String,
    agent_id: String,
    status: String,
    inbox_rel_path: String,
    outbox_rel_path: String,
    completion_promise: String,
    turn_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl AssignmentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            work_item_id: row.get(1)?,
            agent_id: row.get(2)?,
            status: row.get(3)?,
            inbox_rel_path: row.get(4)?,
            outbox_rel_path: row.get(5)?,
            completion_promise: row.get(6)?,
            turn_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_assignment(self) -> Result<Assignment> {
        Ok(Assignment {
            status: AssignmentStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            work_item_id: self.work_item_id,
            agent_id: self.agent_id,
            inbox_rel_path: self.inbox_rel_path,
            outbox_rel_path: self.outbox_rel_path,
            completion_promise: self.completion_promise,
            turn_id: self.turn_id,
        })
    }
}

fn query_work_item(conn: &Connection, id: &str) -> Result<Option<WorkItem>> {
    let row = conn
        .query_row(
            &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
            params![id],
            WorkItemRow::from_row,
        )
        .optional()
        .context("Failed to query work item")?;
    row.map(WorkItemRow::into_work_item).transpose()
}

fn query_assignment(conn: &Connection, id: &str) -> Result<Option<Assignment>> {
    let row = conn
        .query_row(
            &format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = ?1"),
            params![id],
            AssignmentRow::from_row,
        )
        .optional()
        .context("Failed to query assignment")?;
    row.map(AssignmentRow::into_assignment).transpose()
}

/// SQL expression ranking the stored status so updates can compare order.
const STATUS_RANK: &str = "CASE status WHEN 'open' THEN 0 WHEN 'in_progress' THEN 1 WHEN 'done' THEN 2 ELSE 3 END";

impl WorkStore for SqliteStore {
    fn create_cell(&self, cell: &Cell) -> Result<Cell> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cells (name, scope_prefix, worktree_path) VALUES (?1, ?2, ?3)",
            params![
                cell.name,
                cell.scope_prefix,
                cell.worktree_path.to_string_lossy()
            ],
        )
        .with_context(|| format!("Failed to insert cell '{}'", cell.name))?;
        Ok(cell.clone())
    }

    fn get_cell(&self, name: &str) -> Result<Option<Cell>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT name, scope_prefix, worktree_path FROM cells WHERE name = ?1",
            params![name],
            |row| {
                Ok(Cell {
                    name: row.get(0)?,
                    scope_prefix: row.get(1)?,
                    worktree_path: PathBuf::from(row.get::<_, String>(2)?),
                })
            },
        )
        .optional()
        .context("Failed to query cell")
    }

    fn list_cells(&self) -> Result<Vec<Cell>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT name, scope_prefix, worktree_path FROM cells ORDER BY seq")
            .context("Failed to prepare list_cells")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Cell {
                    name: row.get(0)?,
                    scope_prefix: row.get(1)?,
                    worktree_path: PathBuf::from(row.get::<_, String>(2)?),
                })
            })
            .context("Failed to query cells")?;
        let mut cells = Vec::new();
        for row in rows {
            cells.push(row.context("Failed to read cell row")?);
        }
        Ok(cells)
    }

    fn create_agent(&self, agent: &NewAgent) -> Result<Agent> {
        let id = Agent::id_for(&agent.cell, agent.role);
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO agents (id, cell, role, session_handle, status)
                 VALUES (?1, ?2, ?3, ?4, 'idle')",
                params![id, agent.cell, agent.role.as_str(), agent.session_handle],
            )
            .context("Failed to insert agent")?;
        }
        self.get_agent(&id)?.context("Agent not found after insert")
    }

    fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, cell, role, session_handle, status, last_heartbeat
                 FROM agents WHERE id = ?1",
                params![id],
                AgentRow::from_row,
            )
            .optional()
            .context("Failed to query agent")?;
        row.map(AgentRow::into_agent).transpose()
    }

    fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, cell, role, session_handle, status, last_heartbeat
                 FROM agents ORDER BY seq",
            )
            .context("Failed to prepare list_agents")?;
        let rows = stmt
            .query_map([], AgentRow::from_row)
            .context("Failed to query agents")?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("Failed to read agent row")?.into_agent()?);
        }
        Ok(agents)
    }

    fn update_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE agents SET status = ?2, last_heartbeat = ?3 WHERE id = ?1",
                params![id, status.as_str(), timestamp(at)],
            )
            .context("Failed to update agent status")?;
        if changed == 0 {
            return Err(crate::errors::RigError::not_found("Agent", id).into());
        }
        Ok(())
    }

    fn create_work_item(&self, item: &NewWorkItem) -> Result<WorkItem> {
        let id = new_id("wi");
        let now = timestamp(Utc::now());
        let deps: Vec<String> = item.deps.iter().map(ToString::to_string).collect();
        let deps = serde_json::to_string(&deps).context("Failed to serialize deps")?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO work_items (id, kind, title, description, status, priority, scope, deps, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                item.kind.as_str(),
                item.title,
                item.description,
                item.priority,
                item.scope,
                deps,
                now
            ],
        )
        .context("Failed to insert work item")?;
        query_work_item(&conn, &id)?.context("Work item not found after insert")
    }

    fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let conn = self.lock()?;
        query_work_item(&conn, id)
    }

    fn list_work_items(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {WORK_ITEM_COLUMNS} FROM work_items ORDER BY seq"
            ))
            .context("Failed to prepare list_work_items")?;
        let rows = stmt
            .query_map([], WorkItemRow::from_row)
            .context("Failed to query work items")?;
        let mut items = Vec::new();
        for row in rows {
            let item = row
                .context("Failed to read work item row")?
                .into_work_item()?;
            if filter.matches(&item) {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn advance_work_item(&self, id: &str, to: WorkStatus) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE work_items SET status = ?2, updated_at = ?3
                     WHERE id = ?1 AND {STATUS_RANK} < ?4"
                ),
                params![id, to.as_str(), timestamp(Utc::now()), to.rank()],
            )
            .context("Failed to advance work item")?;
        if changed == 0 && query_work_item(&conn, id)?.is_none() {
            return Err(crate::errors::RigError::not_found("Work item", id).into());
        }
        Ok(changed > 0)
    }

    fn transition_work_item(&self, id: &str, from: WorkStatus, to: WorkStatus) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE work_items SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                params![id, from.as_str(), to.as_str(), timestamp(Utc::now())],
            )
            .context("Failed to transition work item")?;
        Ok(changed > 0)
    }

    fn update_description(&self, id: &str, description: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE work_items SET description = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, description, timestamp(Utc::now())],
            )
            .context("Failed to update work item description")?;
        if changed == 0 {
            return Err(crate::errors::RigError::not_found("Work item", id).into());
        }
        Ok(())
    }

    fn create_assignment(&self, assignment: &NewAssignment) -> Result<Assignment> {
        let id = new_id("as");
        let now = timestamp(Utc::now());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO assignments (id, work_item_id, agent_id, status, inbox_rel_path, outbox_rel_path, completion_promise, turn_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                assignment.work_item_id,
                assignment.agent_id,
                assignment.status.as_str(),
                assignment.inbox_rel_path,
                assignment.outbox_rel_path,
                assignment.completion_promise,
                assignment.turn_id,
                now
            ],
        )
        .context("Failed to insert assignment")?;
        query_assignment(&conn, &id)?.context("Assignment not found after insert")
    }

    fn get_assignment(&self, id: &str) -> Result<Option<Assignment>> {
        let conn = self.lock()?;
        query_assignment(&conn, id)
    }

    fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM assignments ORDER BY seq"
            ))
            .context("Failed to prepare list_assignments")?;
        let rows = stmt
            .query_map([], AssignmentRow::from_row)
            .context("Failed to query assignments")?;
        let mut assignments = Vec::new();
        for row in rows {
            let assignment = row
                .context("Failed to read assignment row")?
                .into_assignment()?;
            if filter.matches(&assignment) {
                assignments.push(assignment);
            }
        }
        Ok(assignments)
    }

    fn claim_next(&self, agent_id: &str) -> Result<Option<Assignment>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin claim transaction")?;
        let claimed: Option<String> = tx
            .query_row(
                "UPDATE assignments SET status = 'running', updated_at = ?2
                 WHERE seq = (
                     SELECT seq FROM assignments
                     WHERE agent_id = ?1 AND status = 'queued'
                     ORDER BY created_at, seq LIMIT 1
                 ) AND status = 'queued'
                 RETURNING id",
                params![agent_id, timestamp(Utc::now())],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to claim assignment")?;
        let assignment = match claimed {
            Some(id) => query_assignment(&tx, &id)?,
            None => None,
        };
        tx.commit().context("Failed to commit claim")?;
        Ok(assignment)
    }

    fn complete_assignment(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE assignments SET status = 'done', updated_at = ?2
                 WHERE id = ?1 AND status IN ('queued', 'running')",
                params![id, timestamp(Utc::now())],
            )
            .context("Failed to complete assignment")?;
        Ok(changed > 0)
    }
}
