//! Rig configuration.
//!
//! Settings come from `.rig/rig.toml`, then the environment (including a
//! `.env` file at the rig root), then command-line flags, each layer
//! overriding the one before.
//!
//! # Configuration File Format
//!
//! ```toml
//! [rig]
//! name = "payments"
//! store = "sqlite"            # or "flat"
//! session_prefix = "rig"
//! agent_cmd = "claude"
//!
//! [mail]
//! inbox_dir = "mail/inbox"
//! outbox_dir = "mail/outbox"
//! promise = "DONE"
//!
//! [guardrails]
//! builder_commands = ["go", "make", "git"]
//! read_only_roles = ["reviewer", "monitor", "architect"]
//!
//! [quota]
//! per_cell_turn = 5
//!
//! [claim]
//! clear_context = true
//!
//! [manager]
//! tick_interval_secs = 30
//!
//! [[hooks]]
//! event = "assignment_done"
//! command = "./scripts/notify.sh"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::claim;
use crate::context::{self, RigContext};
use crate::errors::RigError;
use crate::guardrails::{DEFAULT_BUILDER_COMMANDS, Policy};
use crate::hooks::{HookManager, HookRule, HooksConfig};
use crate::mailbox::MailLayout;
use crate::quota;
use crate::session::DEFAULT_SESSION_PREFIX;
use crate::store::{self, Role, StoreBackend};
use crate::turn::TurnLedger;

pub const CONFIG_FILE: &str = "rig.toml";
pub const STORE_ENV: &str = "RIG_STORE";
pub const SESSION_PREFIX_ENV: &str = "RIG_SESSION_PREFIX";
pub const AGENT_CMD_ENV: &str = "RIG_AGENT_CMD";
pub const TICK_INTERVAL_ENV: &str = "RIG_TICK_INTERVAL";

const DEFAULT_AGENT_CMD: &str = "claude";
const DEFAULT_TICK_INTERVAL_SECS: u64 = 30;

/// Environment variables the configuration reads.
const ENV_KEYS: &[&str] = &[
    STORE_ENV,
    SESSION_PREFIX_ENV,
    AGENT_CMD_ENV,
    TICK_INTERVAL_ENV,
    quota::LIMIT_ENV,
    claim::CLEAR_CONTEXT_ENV,
];

/// Rig-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RigSection {
    /// Rig name (optional, defaults to the root directory name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub store: StoreBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_prefix: Option<String>,
    /// Command started in each worker session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_cmd: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_roles: Option<Vec<Role>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaSection {
    /// Work items allowed per (cell, turn). Unset or 0 is unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_cell_turn: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_context: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
        }
    }
}

/// The complete rig.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RigToml {
    #[serde(default)]
    pub rig: RigSection,
    #[serde(default)]
    pub mail: MailLayout,
    #[serde(default)]
    pub guardrails: GuardrailsSection,
    #[serde(default)]
    pub quota: QuotaSection,
    #[serde(default)]
    pub claim: ClaimSection,
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRule>,
}

impl RigToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse rig.toml")
    }

    /// Load `<rig_dir>/rig.toml`, or defaults when it does not exist.
    pub fn load_or_default(rig_dir: &Path) -> Result<Self> {
        let path = rig_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize rig.toml")?;
        crate::util::write_atomic(path, &content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.mail.inbox_dir.trim().is_empty() || self.mail.outbox_dir.trim().is_empty() {
            warnings.push("mail.inbox_dir and mail.outbox_dir must not be empty".to_string());
        }
        if self.mail.inbox_dir == self.mail.outbox_dir {
            warnings.push(format!(
                "mail.inbox_dir and mail.outbox_dir are both '{}'",
                self.mail.inbox_dir
            ));
        }
        if self.mail.promise.trim().is_empty() {
            warnings.push("mail.promise is empty, the default 'DONE' will be used".to_string());
        }
        if let Some(commands) = &self.guardrails.builder_commands
            && commands.is_empty()
        {
            warnings.push("guardrails.builder_commands is empty: builders cannot run any command".to_string());
        }
        if self.manager.tick_interval_secs == 0 {
            warnings.push("manager.tick_interval_secs is 0, using 1".to_string());
        }
        warnings.extend(self.hooks_config().validate());
        warnings
    }

    pub fn hooks_config(&self) -> HooksConfig {
        HooksConfig {
            hooks: self.hooks.clone(),
        }
    }
}

/// Configuration for one invocation: the file plus environment and CLI
/// overrides.
#[derive(Debug, Clone)]
pub struct RigConfig {
    pub root: PathBuf,
    pub rig_dir: PathBuf,
    pub toml: RigToml,
    env: HashMap<String, String>,
    /// CLI override for the store backend
    pub cli_store: Option<StoreBackend>,
    pub verbose: bool,
}

impl RigConfig {
    /// Load configuration for the rig rooted at `root`.
    ///
    /// A `.env` file at the root is loaded into the process environment
    /// first. Variables already set take precedence over it.
    pub fn new(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve rig root {}", root.display()))?;
        let dotenv = root.join(".env");
        if dotenv.is_file()
            && let Err(e) = dotenvy::from_path(&dotenv)
        {
            tracing::warn!(path = %dotenv.display(), error = %e, "Failed to load .env");
        }
        let env = ENV_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        Self::from_parts(root, env)
    }

    /// Build from an explicit environment snapshot.
    pub fn from_parts(root: PathBuf, env: HashMap<String, String>) -> Result<Self> {
        let rig_dir = context::rig_dir(&root);
        let toml = RigToml::load_or_default(&rig_dir)?;
        Ok(Self {
            root,
            rig_dir,
            toml,
            env,
            cli_store: None,
            verbose: false,
        })
    }

    /// Apply CLI overrides.
    pub fn with_cli_args(mut self, store: Option<StoreBackend>, verbose: bool) -> Self {
        self.cli_store = store;
        self.verbose = verbose;
        self
    }

    fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
    }

    pub fn is_initialized(&self) -> bool {
        self.rig_dir.join(CONFIG_FILE).is_file()
    }

    /// Rig name: file, else the root directory name.
    pub fn name(&self) -> String {
        self.toml
            .rig
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                self.root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "rig".to_string())
    }

    /// Store backend (CLI → env → file).
    pub fn store_backend(&self) -> Result<StoreBackend> {
        if let Some(backend) = self.cli_store {
            return Ok(backend);
        }
        match self.env(STORE_ENV) {
            Some(raw) => raw
                .parse()
                .map_err(|e: anyhow::Error| RigError::Config(format!("{}: {}", STORE_ENV, e)).into()),
            None => Ok(self.toml.rig.store),
        }
    }

    /// Session prefix (env → file → default).
    pub fn session_prefix(&self) -> String {
        self.env(SESSION_PREFIX_ENV)
            .map(str::to_string)
            .or_else(|| self.toml.rig.session_prefix.clone())
            .unwrap_or_else(|| DEFAULT_SESSION_PREFIX.to_string())
    }

    /// Worker command (env → file → default).
    pub fn agent_cmd(&self) -> String {
        self.env(AGENT_CMD_ENV)
            .map(str::to_string)
            .or_else(|| self.toml.rig.agent_cmd.clone())
            .unwrap_or_else(|| DEFAULT_AGENT_CMD.to_string())
    }

    /// Per-(cell, turn) creation limit (env → file). `None` is unbounded.
    pub fn quota(&self) -> Result<Option<u32>, RigError> {
        match self.env(quota::LIMIT_ENV) {
            Some(raw) => quota::parse_limit(raw),
            None => Ok(self.toml.quota.per_cell_turn.filter(|l| *l > 0)),
        }
    }

    /// Whether claims tell the worker to drop prior context (env → file → on).
    pub fn clear_context(&self) -> bool {
        match self.env(claim::CLEAR_CONTEXT_ENV) {
            Some(raw) => claim::clear_context_enabled(Some(raw)),
            None => self.toml.claim.clear_context.unwrap_or(true),
        }
    }

    /// Interval between manager passes (env → file), at least one second.
    pub fn tick_interval(&self) -> Duration {
        let secs = self
            .env(TICK_INTERVAL_ENV)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(self.toml.manager.tick_interval_secs);
        Duration::from_secs(secs.max(1))
    }

    pub fn policy(&self) -> Policy {
        let mut policy = Policy::default();
        if let Some(commands) = &self.toml.guardrails.builder_commands {
            policy.builder_commands = commands.clone();
        }
        if let Some(roles) = &self.toml.guardrails.read_only_roles {
            policy.read_only_roles = roles.clone();
        }
        policy
    }

    pub fn hook_manager(&self) -> HookManager {
        HookManager::new(&self.root, self.toml.hooks_config())
    }

    pub fn ledger(&self) -> TurnLedger {
        TurnLedger::new(&self.rig_dir)
    }

    /// Open the store and assemble the engine context.
    pub fn context(&self) -> Result<RigContext> {
        if !self.is_initialized() {
            return Err(RigError::Config(format!(
                "No rig found at {}. Run 'cellrig init' first.",
                self.root.display()
            ))
            .into());
        }
        let backend = self.store_backend()?;
        let store = store::open(backend, &self.rig_dir)
            .with_context(|| format!("Failed to open {} store", backend))?;
        Ok(RigContext {
            name: self.name(),
            root: self.root.clone(),
            store,
            turn: self.ledger().active(),
            mail: self.toml.mail.clone(),
            quota: self.quota()?,
            session_prefix: self.session_prefix(),
        })
    }

    /// Validate and return warnings, including environment problems.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if let Err(e) = self.store_backend() {
            warnings.push(e.to_string());
        }
        if let Err(e) = self.quota() {
            warnings.push(e.to_string());
        }
        warnings
    }
}

/// Default rig.toml written by `cellrig init` and `cellrig config init`.
pub fn default_toml(name: &str, store: StoreBackend) -> RigToml {
    RigToml {
        rig: RigSection {
            name: Some(name.to_string()),
            store,
            session_prefix: Some(DEFAULT_SESSION_PREFIX.to_string()),
            agent_cmd: Some(DEFAULT_AGENT_CMD.to_string()),
        },
        guardrails: GuardrailsSection {
            builder_commands: Some(
                DEFAULT_BUILDER_COMMANDS
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            ),
            read_only_roles: None,
        },
        ..Default::default()
    }
}
