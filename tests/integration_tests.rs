//! Integration tests for cellrig
//!
//! These tests drive the binary end to end against temporary rigs.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const RIG_ENV: &[&str] = &[
    "RIG_ROOT",
    "RIG_NAME",
    "RIG_CELL",
    "RIG_ROLE",
    "RIG_WORKTREE",
    "RIG_STORE",
    "RIG_SESSION_PREFIX",
    "RIG_AGENT_CMD",
    "RIG_TICK_INTERVAL",
    "RIG_BEAD_LIMIT_PER_CELL_TURN",
    "RIG_CLAIM_CLEAR_CONTEXT",
];

/// Helper to create a cellrig Command running in `dir` with a clean rig
/// environment
fn rig(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("cellrig");
    cmd.current_dir(dir);
    for key in RIG_ENV {
        cmd.env_remove(key);
    }
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

/// Initialize a rig with one cell `alpha` owning `apps/alpha`.
fn init_rig_with_cell(store: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    rig(dir.path())
        .args(["init", "--name", "demo", "--store", store])
        .assert()
        .success();
    fs::create_dir_all(dir.path().join("cells/alpha")).unwrap();
    rig(dir.path())
        .args([
            "cell",
            "add",
            "alpha",
            "--scope",
            "apps/alpha",
            "--worktree",
            "cells/alpha",
        ])
        .assert()
        .success();
    dir
}

/// `Created task wi-1234abcd: title` -> `wi-1234abcd`
fn created_id(stdout: &str) -> String {
    stdout
        .split_whitespace()
        .nth(2)
        .unwrap()
        .trim_end_matches(':')
        .to_string()
}

/// `Started turn name (wi-1234abcd)` -> `wi-1234abcd`
fn turn_id(stdout: &str) -> String {
    let line = stdout.lines().find(|l| l.starts_with("Started turn")).unwrap();
    let start = line.rfind('(').unwrap() + 1;
    line[start..line.len() - 1].to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        rig(dir.path()).arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        rig(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();
        rig(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized rig"));

        for sub in ["state", "heartbeats", "logs", "reports"] {
            assert!(dir.path().join(".rig").join(sub).is_dir(), "{sub}");
        }
        assert!(dir.path().join(".rig/rig.toml").is_file());
        assert!(dir.path().join(".rig/rig.db").is_file());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = TempDir::new().unwrap();
        rig(dir.path()).arg("init").assert().success();
        rig(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_init_flat_store() {
        let dir = TempDir::new().unwrap();
        rig(dir.path())
            .args(["init", "--store", "flat"])
            .assert()
            .success();
        assert!(dir.path().join(".rig/issues.jsonl").exists());
    }

    #[test]
    fn test_commands_require_a_rig() {
        let dir = TempDir::new().unwrap();
        rig(dir.path())
            .args(["task", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cellrig init"));
    }

    #[test]
    fn test_status_before_init() {
        let dir = TempDir::new().unwrap();
        rig(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Not initialized"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_and_validate() {
        let dir = init_rig_with_cell("sqlite");
        rig(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("name = \"demo\""))
            .stdout(predicate::str::contains("quota = unbounded"));
        rig(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_env_overrides_are_shown() {
        let dir = init_rig_with_cell("sqlite");
        rig(dir.path())
            .env("RIG_BEAD_LIMIT_PER_CELL_TURN", "3")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("quota = 3 per cell per turn"));
    }

    #[test]
    fn test_config_init_refuses_to_overwrite() {
        let dir = init_rig_with_cell("sqlite");
        rig(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }
}

// =============================================================================
// Cells and work items
// =============================================================================

mod cells_and_tasks {
    use super::*;

    #[test]
    fn test_route_longest_prefix() {
        let dir = init_rig_with_cell("sqlite");
        rig(dir.path())
            .args(["cell", "add", "apps", "--scope", "apps"])
            .assert()
            .success();

        rig(dir.path())
            .args(["cell", "route", "apps/alpha/api"])
            .assert()
            .success()
            .stdout("alpha\n");
        rig(dir.path())
            .args(["cell", "route", "apps/beta"])
            .assert()
            .success()
            .stdout("apps\n");
        rig(dir.path())
            .args(["cell", "route", "billing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No cell owns scope 'billing'"));
    }

    #[test]
    fn test_task_create_show_meta_close() {
        let dir = init_rig_with_cell("flat");
        let out = stdout_of(rig(dir.path()).args([
            "task",
            "create",
            "Fix login",
            "--scope",
            "apps/alpha/login",
            "--description",
            "Users cannot log in.",
        ]));
        let id = created_id(&out);

        rig(dir.path())
            .args(["task", "meta", &id, "role=reviewer", "severity=high"])
            .assert()
            .success();
        rig(dir.path())
            .args(["task", "show", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("role: reviewer"))
            .stdout(predicate::str::contains("Users cannot log in."));
        rig(dir.path())
            .args(["task", "meta", &id, "colour=blue"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown metadata field"));

        rig(dir.path())
            .args(["task", "close", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Closed"));
        rig(dir.path())
            .args(["task", "list", "--ready"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No work items."));
    }

    #[test]
    fn test_task_list_json() {
        let dir = init_rig_with_cell("sqlite");
        rig(dir.path())
            .args(["task", "create", "Write docs", "--kind", "request"])
            .assert()
            .success();
        let out = stdout_of(rig(dir.path()).args(["task", "list", "--json"]));
        let items: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(items[0]["title"], "Write docs");
        assert_eq!(items[0]["kind"], "request");
    }

    #[test]
    fn test_quota_refuses_second_item_for_cell_and_turn() {
        let dir = init_rig_with_cell("sqlite");
        rig(dir.path())
            .args(["turn", "start", "sprint-1"])
            .assert()
            .success();

        let create = |title: &str| {
            let mut cmd = rig(dir.path());
            cmd.env("RIG_BEAD_LIMIT_PER_CELL_TURN", "1").args([
                "task", "create", title, "--cell", "alpha", "--turn",
            ]);
            cmd
        };
        create("first").assert().success();
        create("second")
            .assert()
            .failure()
            .stderr(predicate::str::contains("quota exceeded"));
    }
}

// =============================================================================
// Turn, round, claim and reconciliation
// =============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_round_claim_and_reconcile() {
        let dir = init_rig_with_cell("sqlite");
        let worktree = dir.path().join("cells/alpha");
        let out = stdout_of(rig(dir.path()).args([
            "task",
            "create",
            "Fix login",
            "--scope",
            "apps/alpha/login",
        ]));
        let id = created_id(&out);

        rig(dir.path())
            .args(["turn", "start", "sprint-1"])
            .assert()
            .success();
        rig(dir.path())
            .args(["round", "start"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Queued 1 assignment(s)"));
        assert!(worktree.join(format!("mail/inbox/{}.md", id)).is_file());

        // The worker's stop hook claims the queued assignment.
        let request = format!(r#"{{"hook_event_name":"Stop","cwd":"{}"}}"#, worktree.display());
        let reply = stdout_of(
            rig(&worktree)
                .env("RIG_CELL", "alpha")
                .args(["hook", "stop"])
                .write_stdin(request.clone()),
        );
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["continue"], true);
        assert_eq!(reply["decision"], "block");
        let reason = reply["reason"].as_str().unwrap();
        assert!(reason.contains("=== BEGIN ASSIGNMENT ==="));
        assert!(reason.contains(&id));

        // Not done until the promise appears in the outbox.
        rig(dir.path())
            .args(["manager", "tick"])
            .assert()
            .success()
            .stdout(predicate::str::contains("0 done, 1 pending"));

        let outbox = worktree.join(format!("mail/outbox/{}.md", id));
        fs::create_dir_all(outbox.parent().unwrap()).unwrap();
        fs::write(&outbox, "Fixed the session check.\n\nDONE\n").unwrap();
        rig(dir.path())
            .args(["manager", "tick"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 done"));
        assert!(worktree.join(format!("mail/outbox/archive/{}.md", id)).is_file());

        rig(dir.path())
            .args(["task", "show", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Status:   done"));

        // Nothing left: the next stop lets the worker go idle.
        let reply = stdout_of(
            rig(&worktree)
                .env("RIG_CELL", "alpha")
                .args(["hook", "stop"])
                .write_stdin(request),
        );
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["continue"], false);
        assert!(dir.path().join(".rig/heartbeats/alpha-builder.json").is_file());
    }

    #[test]
    fn test_stop_hook_scans_matching_items() {
        let dir = init_rig_with_cell("flat");
        let worktree = dir.path().join("cells/alpha");
        let out = stdout_of(rig(dir.path()).args([
            "task",
            "create",
            "Review schema",
            "--cell",
            "alpha",
            "--role",
            "builder",
        ]));
        let id = created_id(&out);

        // Identity comes from the working directory.
        let reply = stdout_of(rig(&worktree).args(["hook", "stop"]).write_stdin("{}"));
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["continue"], true);
        assert!(reply["reason"].as_str().unwrap().contains(&id));

        rig(dir.path())
            .args(["task", "show", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Status:   in_progress"));
    }

    #[test]
    fn test_turn_end_writes_report_and_history() {
        let dir = init_rig_with_cell("sqlite");
        let out = stdout_of(rig(dir.path()).args(["turn", "start", "sprint-1"]));
        let turn = turn_id(&out);

        rig(dir.path())
            .args(["turn", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Turn sprint-1"));
        rig(dir.path())
            .args(["turn", "end", "--report"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Report written to"));
        assert!(dir.path().join(format!(".rig/reports/{}.md", turn)).is_file());

        rig(dir.path())
            .args(["turn", "history"])
            .assert()
            .success()
            .stdout(predicate::str::contains("sprint-1"));
        rig(dir.path())
            .args(["round", "start"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No active turn"));
    }
}

// =============================================================================
// Hooks
// =============================================================================

mod hooks {
    use super::*;

    fn guard(dir: &Path, role: &str, input: &str) -> serde_json::Value {
        let out = stdout_of(
            rig(&dir.join("cells/alpha"))
                .env("RIG_CELL", "alpha")
                .env("RIG_ROLE", role)
                .args(["hook", "guard"])
                .write_stdin(input.to_string()),
        );
        serde_json::from_str(&out).unwrap()
    }

    #[test]
    fn test_guard_decisions() {
        let dir = init_rig_with_cell("sqlite");

        let denied = guard(
            dir.path(),
            "builder",
            r#"{"tool_name":"Bash","tool_input":{"command":"rm -rf /"}}"#,
        );
        assert_eq!(denied["decision"], "deny");
        assert!(denied["reason"].as_str().unwrap().contains("rm -rf /"));

        let allowed = guard(
            dir.path(),
            "builder",
            r#"{"tool_name":"Write","tool_input":{"file_path":"apps/alpha/main.go"}}"#,
        );
        assert_eq!(allowed["decision"], "allow");

        let escaped = guard(
            dir.path(),
            "builder",
            r#"{"tool_name":"Edit","tool_input":{"file_path":"apps/alpha/../../secrets.txt"}}"#,
        );
        assert_eq!(escaped["decision"], "deny");

        let reviewer = guard(
            dir.path(),
            "reviewer",
            r#"{"tool_name":"Write","tool_input":{"file_path":"apps/alpha/main.go"}}"#,
        );
        assert_eq!(reviewer["decision"], "deny");
    }

    #[test]
    fn test_hooks_reply_outside_a_rig() {
        let dir = TempDir::new().unwrap();
        let stop = stdout_of(rig(dir.path()).args(["hook", "stop"]).write_stdin("not json"));
        let stop: serde_json::Value = serde_json::from_str(&stop).unwrap();
        assert_eq!(stop["continue"], false);

        let guard = stdout_of(
            rig(dir.path())
                .args(["hook", "guard"])
                .write_stdin(r#"{"tool_name":"Bash","tool_input":{"command":"ls"}}"#),
        );
        let guard: serde_json::Value = serde_json::from_str(&guard).unwrap();
        assert_eq!(guard["decision"], "allow");
    }

    #[test]
    fn test_configured_hook_runs_on_turn_start() {
        let dir = init_rig_with_cell("sqlite");
        let config = dir.path().join(".rig/rig.toml");
        let mut toml = fs::read_to_string(&config).unwrap();
        toml.push_str(
            "\n[[hooks]]\nevent = \"turn_start\"\ncommand = \"cat > turn-started.json\"\n",
        );
        fs::write(&config, toml).unwrap();

        rig(dir.path())
            .args(["turn", "start", "sprint-1"])
            .assert()
            .success();
        let context = fs::read_to_string(dir.path().join("turn-started.json")).unwrap();
        assert!(context.contains("\"turn_start\""));
    }
}
