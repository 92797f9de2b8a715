//! Configuration view and validation commands: `cellrig config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(root: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use cellrig::config::{CONFIG_FILE, RigConfig, RigToml, default_toml};

    let config = RigConfig::new(root)?;
    let config_path = config.rig_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Rig Configuration");
            println!("=================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                RigToml::load(&config_path)?
            } else {
                println!("No rig.toml found at {}", config_path.display());
                println!("Using default configuration.");
                println!();
                RigToml::default()
            };

            println!("[rig]");
            if let Some(name) = &toml.rig.name {
                println!("  name = \"{}\"", name);
            }
            println!("  store = \"{}\"", toml.rig.store);
            if let Some(prefix) = &toml.rig.session_prefix {
                println!("  session_prefix = \"{}\"", prefix);
            }
            if let Some(cmd) = &toml.rig.agent_cmd {
                println!("  agent_cmd = \"{}\"", cmd);
            }
            println!();

            println!("[mail]");
            println!("  inbox_dir = \"{}\"", toml.mail.inbox_dir);
            println!("  outbox_dir = \"{}\"", toml.mail.outbox_dir);
            println!("  promise = \"{}\"", toml.mail.promise);
            println!();

            if let Some(commands) = &toml.guardrails.builder_commands {
                println!("[guardrails]");
                println!("  builder_commands = {:?}", commands);
                println!();
            }

            println!("[manager]");
            println!("  tick_interval_secs = {}", toml.manager.tick_interval_secs);
            println!();

            if !toml.hooks.is_empty() {
                println!("Hooks:");
                for rule in &toml.hooks {
                    let status = if rule.enabled { "" } else { " (disabled)" };
                    println!("  {} -> {}{}", rule.event, rule.command, status);
                }
                println!();
            }

            // Effective values after environment and .env overrides
            println!("Effective values (with env/CLI overrides):");
            println!("  name = \"{}\"", config.name());
            match config.store_backend() {
                Ok(backend) => println!("  store = \"{}\"", backend),
                Err(e) => println!("  store = invalid ({})", e),
            }
            println!("  session_prefix = \"{}\"", config.session_prefix());
            println!("  agent_cmd = \"{}\"", config.agent_cmd());
            match config.quota() {
                Ok(Some(limit)) => println!("  quota = {} per cell per turn", limit),
                Ok(None) => println!("  quota = unbounded"),
                Err(e) => println!("  quota = invalid ({})", e),
            }
            println!("  clear_context = {}", config.clear_context());
            println!("  tick_interval = {}s", config.tick_interval().as_secs());
            let policy = config.policy();
            let read_only: Vec<&str> = policy.read_only_roles.iter().map(|r| r.as_str()).collect();
            println!("  read_only_roles = {:?}", read_only);
            println!();

            if !config_path.exists() {
                println!("Run 'cellrig config init' to create a rig.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No rig.toml found. Using defaults.");
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("rig.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            let toml = default_toml(&config.name(), config.store_backend()?);
            toml.save(&config_path)?;

            println!("Created rig.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [rig] name, store, session_prefix, agent_cmd");
            println!("  - [mail] inbox_dir, outbox_dir, promise");
            println!("  - [guardrails] builder_commands, read_only_roles");
            println!("  - [[hooks]] rules for turn, round and assignment events");
            println!();
        }
    }

    Ok(())
}
