//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                  |
//! |-----------|-----------------------------------|
//! | `rig`     | `Init`, `Status`                  |
//! | `config`  | `Config`                          |
//! | `task`    | `Task`, `Assign`                  |
//! | `cell`    | `Cell`, `Agent`                   |
//! | `turn`    | `Turn`, `Round`                   |
//! | `manager` | `Manager`                         |
//! | `hook`    | `Hook`                            |

pub mod cell;
pub mod config;
pub mod hook;
pub mod manager;
pub mod rig;
pub mod task;
pub mod turn;

pub use cell::{cmd_agent, cmd_cell};
pub use config::cmd_config;
pub use hook::cmd_hook;
pub use manager::cmd_manager;
pub use rig::{cmd_init, cmd_status};
pub use task::{cmd_assign, cmd_task};
pub use turn::{cmd_round, cmd_turn};

use anyhow::Result;
use std::path::Path;

use cellrig::config::RigConfig;
use cellrig::context::RigContext;

use super::Cli;

/// Load configuration with CLI overrides and open the rig.
fn open(cli: &Cli, root: &Path) -> Result<(RigConfig, RigContext)> {
    let config = RigConfig::new(root)?.with_cli_args(cli.store, cli.verbose);
    let ctx = config.context()?;
    Ok((config, ctx))
}
