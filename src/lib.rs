pub mod claim;
pub mod config;
pub mod context;
pub mod errors;
pub mod guardrails;
pub mod heartbeat;
pub mod hooks;
pub mod init;
pub mod lifecycle;
pub mod logging;
pub mod mailbox;
pub mod metadata;
pub mod quota;
pub mod router;
pub mod session;
pub mod store;
pub mod tracker;
pub mod turn;
pub mod util;
