//! Explicit state handed to every engine operation.

use std::path::{Path, PathBuf};

use crate::errors::RigError;
use crate::mailbox::MailLayout;
use crate::store::WorkStore;
use crate::turn::TurnRecord;

/// Everything an engine call needs to know about the rig it acts on.
///
/// The active turn is carried here rather than read from disk by the engine,
/// so callers decide where turn state comes from.
pub struct RigContext {
    pub name: String,
    pub root: PathBuf,
    pub store: Box<dyn WorkStore>,
    pub turn: Option<TurnRecord>,
    pub mail: MailLayout,
    /// Work items allowed per (cell, turn). `None` is unbounded.
    pub quota: Option<u32>,
    pub session_prefix: String,
}

impl RigContext {
    pub fn rig_dir(&self) -> PathBuf {
        rig_dir(&self.root)
    }

    pub fn turn_id(&self) -> Option<&str> {
        self.turn.as_ref().map(|t| t.id.as_str())
    }

    pub fn require_turn(&self) -> Result<&TurnRecord, RigError> {
        self.turn.as_ref().ok_or(RigError::NoActiveTurn)
    }
}

/// `.rig` directory under a rig root.
pub fn rig_dir(root: &Path) -> PathBuf {
    root.join(".rig")
}

/// Nearest ancestor of `start` (itself included) that holds an initialized
/// rig.
pub fn find_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| rig_dir(dir).join(crate::config::CONFIG_FILE).is_file())
        .map(Path::to_path_buf)
}


#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::store::{Cell, NewAgent, Role, SqliteStore};
    use chrono::Utc;

    /// Context over an in-memory store rooted at `root`, with an active turn.
    pub fn context(root: &Path) -> RigContext {
        RigContext {
            name: "demo".into(),
            root: root.to_path_buf(),
            store: Box::new(SqliteStore::open_in_memory().unwrap()),
            turn: Some(TurnRecord {
                id: "wi-turn0001".into(),
                name: "sprint-1".into(),
                started_at: Utc::now() - chrono::Duration::hours(1),
                ended_at: None,
            }),
            mail: MailLayout::default(),
            quota: None,
            session_prefix: "rig".into(),
        }
    }

    /// Add a cell whose worktree lives under `root/cells/<name>`, plus agents.
    pub fn add_cell(ctx: &RigContext, name: &str, scope: &str, roles: &[Role]) -> Cell {
        let worktree = ctx.root.join("cells").join(name);
        std::fs::create_dir_all(&worktree).unwrap();
        let cell = ctx
            .store
            .create_cell(&Cell::new(name, scope, worktree))
            .unwrap();
        for role in roles {
            ctx.store
                .create_agent(&NewAgent {
                    cell: name.into(),
                    role: *role,
                    session_handle: crate::session::handle_for(
                        &ctx.session_prefix,
                        &ctx.name,
                        name,
                        *role,
                    ),
                })
                .unwrap();
        }
        cell
    }
}
