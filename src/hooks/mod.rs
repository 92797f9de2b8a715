//! Declarative shell hooks fired on engine events.
//!
//! Rules are evaluated synchronously per event: every enabled rule whose
//! event matches and whose `cell`/`role` globs accept the event's context
//! runs once, in declaration order, under its own timeout. A failing rule
//! either aborts the event or is logged and skipped, chosen per rule.
//!
//! # Events
//!
//! - `turn_start`, `turn_end`
//! - `round_start`, `round_review`, `round_merge`
//! - `assignment_created`, `assignment_claimed`, `assignment_done`
//! - `agent_idle`
//!
//! # Configuration
//!
//! ```toml
//! [[hooks]]
//! event = "assignment_done"
//! role = "builder"
//! command = "./scripts/post-to-chat.sh"
//! timeout_secs = 10
//! on_failure = "continue"
//! ```

pub mod config;
pub mod executor;
pub mod manager;
pub mod types;

pub use config::{HookRule, HooksConfig};
pub use executor::HookExecutor;
pub use manager::HookManager;
pub use types::{HookContext, HookEvent, OnFailure};
