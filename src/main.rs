use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cellrig::store::{Role, StoreBackend, WorkKind, WorkStatus};

mod cmd;

#[derive(Parser)]
#[command(name = "cellrig")]
#[command(version, about = "Coordinate scoped coding-agent workers through turns and rounds")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Rig root. Defaults to the nearest directory above the current one
    /// that holds a `.rig/`.
    #[arg(long, global = true, env = "RIG_ROOT")]
    pub root: Option<PathBuf>,

    /// Store backend override: sqlite or flat
    #[arg(long, global = true)]
    pub store: Option<StoreBackend>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a rig in the current directory
    Init {
        /// Rig name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Create, inspect and close work items
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Assign a work item to a cell's agent
    Assign {
        work_item: String,
        #[arg(long)]
        cell: String,
        #[arg(long, default_value = "builder")]
        role: Role,
    },
    /// Manage cells
    Cell {
        #[command(subcommand)]
        command: CellCommands,
    },
    /// Manage agents and their sessions
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Open, inspect and close turns
    Turn {
        #[command(subcommand)]
        command: TurnCommands,
    },
    /// Run a round phase inside the active turn
    Round {
        #[command(subcommand)]
        command: RoundCommands,
    },
    /// Reconciliation loop
    Manager {
        #[command(subcommand)]
        command: ManagerCommands,
    },
    /// Worker hook endpoints (JSON on stdin, JSON reply on stdout)
    Hook {
        #[command(subcommand)]
        command: HookCommands,
    },
    /// Show rig status
    Status,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default rig.toml file
    Init,
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    /// Create a work item
    Create {
        title: String,
        #[arg(long, default_value = "task")]
        kind: WorkKind,
        /// Repository-relative path the work concerns
        #[arg(long, default_value = "")]
        scope: String,
        #[arg(short, long, default_value_t = 2)]
        priority: i32,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Dependency, `id` (blocking) or `kind:id`; repeatable
        #[arg(long = "dep")]
        deps: Vec<String>,
        /// Restrict the item to a cell
        #[arg(long)]
        cell: Option<String>,
        /// Restrict the item to a role
        #[arg(long)]
        role: Option<Role>,
        /// Stamp the item with the active turn
        #[arg(long)]
        turn: bool,
    },
    /// List work items
    List {
        #[arg(long)]
        status: Option<WorkStatus>,
        #[arg(long)]
        kind: Option<WorkKind>,
        /// Only items that are open with no unfinished blocking dependency
        #[arg(long)]
        ready: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show one work item with its metadata and assignments
    Show { id: String },
    /// Close a work item
    Close { id: String },
    /// Set metadata fields, `key=value`; an empty value clears the field
    Meta {
        id: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum CellCommands {
    /// Register a cell
    Add {
        name: String,
        /// Scope prefix the cell owns (empty owns everything)
        #[arg(long, default_value = "")]
        scope: String,
        /// Worktree directory (defaults to the rig root)
        #[arg(long)]
        worktree: Option<PathBuf>,
        /// Agents to register with the cell; repeatable
        #[arg(long = "role")]
        roles: Vec<Role>,
    },
    /// List cells
    List,
    /// Show which cell owns a scope
    Route { scope: String },
}

#[derive(Subcommand, Clone)]
pub enum AgentCommands {
    /// Register an agent
    Add {
        cell: String,
        #[arg(default_value = "builder")]
        role: Role,
    },
    /// List agents with their last heartbeat
    List,
    /// Start the agent's session
    Start {
        cell: String,
        #[arg(default_value = "builder")]
        role: Role,
    },
    /// Stop the agent's session
    Stop {
        cell: String,
        #[arg(default_value = "builder")]
        role: Role,
    },
    /// Type a line into the agent's session
    Wake {
        cell: String,
        #[arg(default_value = "builder")]
        role: Role,
        #[arg(short, long)]
        message: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TurnCommands {
    /// Start a turn (ends the active one)
    Start { name: String },
    /// Summarize the active turn
    Status,
    /// End the active turn
    End {
        /// Write a markdown report to .rig/reports/
        #[arg(long)]
        report: bool,
    },
    /// List closed turns
    History,
}

#[derive(Subcommand, Clone)]
pub enum RoundCommands {
    /// Route ready work to cells and queue assignments
    Start,
    /// Open reviews for cells with changes
    Review {
        /// Review every cell, changed or not
        #[arg(long)]
        all: bool,
    },
    /// Merge finished reviews
    Merge {
        /// Seconds allowed per merge
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
}

#[derive(Subcommand, Clone)]
pub enum ManagerCommands {
    /// Run one reconciliation pass
    Tick {
        /// Keep running until interrupted
        #[arg(long)]
        watch: bool,
        /// Seconds between passes (overrides configuration)
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand, Clone)]
pub enum HookCommands {
    /// Stop hook: claim the next assignment
    Stop,
    /// Pre-tool hook: allow or deny the action
    Guard,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let root = match cli.root.clone() {
        Some(dir) => dir,
        None if matches!(cli.command, Commands::Init { .. }) => cwd,
        None => cellrig::context::find_root(&cwd).unwrap_or(cwd),
    };

    let quiet = matches!(cli.command, Commands::Hook { .. });
    let log_dir = cellrig::context::rig_dir(&root).join("logs");
    let _guard = cellrig::logging::init(Some(&log_dir), cli.verbose, quiet);

    match &cli.command {
        Commands::Init { name } => cmd::cmd_init(&root, name.as_deref(), cli.store)?,
        Commands::Config { command } => cmd::cmd_config(&root, command.clone())?,
        Commands::Task { command } => cmd::cmd_task(&cli, &root, command.clone())?,
        Commands::Assign {
            work_item,
            cell,
            role,
        } => cmd::cmd_assign(&cli, &root, work_item, cell, *role).await?,
        Commands::Cell { command } => cmd::cmd_cell(&cli, &root, command.clone())?,
        Commands::Agent { command } => cmd::cmd_agent(&cli, &root, command.clone()).await?,
        Commands::Turn { command } => cmd::cmd_turn(&cli, &root, command.clone()).await?,
        Commands::Round { command } => cmd::cmd_round(&cli, &root, command.clone()).await?,
        Commands::Manager { command } => cmd::cmd_manager(&cli, &root, command.clone()).await?,
        Commands::Hook { command } => cmd::cmd_hook(&cli, &root, command.clone()).await?,
        Commands::Status => cmd::cmd_status(&cli, &root)?,
    }

    Ok(())
}
