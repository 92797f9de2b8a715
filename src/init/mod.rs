//! `cellrig init`: create the `.rig/` directory of a rig.
//!
//! ```text
//! .rig/
//! ├── rig.toml         # Configuration
//! ├── rig.db           # SQLite store (or issues.jsonl for the flat store)
//! ├── state/           # Active turn pointer and turn history
//! ├── heartbeats/      # One JSON record per worker
//! ├── logs/            # Daily rolling log files
//! └── reports/         # Turn reports
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, CONFIG_FILE};
use crate::context::rig_dir;
use crate::store::{self, StoreBackend};

const SUBDIRS: &[&str] = &["state", "heartbeats", "logs", "reports"];

/// Result of initializing a rig.
#[derive(Debug)]
pub struct InitResult {
    pub rig_dir: PathBuf,
    /// False when the rig already existed; its structure was completed.
    pub created: bool,
    pub store: StoreBackend,
}

/// Initialize a rig in `root`. Safe to run again on an existing rig: missing
/// pieces are created and the existing configuration is kept.
pub fn init_rig(root: &Path, name: Option<&str>, backend: StoreBackend) -> Result<InitResult> {
    let rig_dir = rig_dir(root);
    let config_path = rig_dir.join(CONFIG_FILE);
    let created = !config_path.exists();

    for sub in SUBDIRS {
        let dir = rig_dir.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let store = if created {
        let name = name.map(str::to_string).unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "rig".to_string())
        });
        config::default_toml(&name, backend).save(&config_path)?;
        backend
    } else {
        config::RigToml::load(&config_path)?.rig.store
    };

    // Opening creates the store file and schema.
    store::open(store, &rig_dir)?;
    tracing::info!(rig_dir = %rig_dir.display(), %store, created, "Rig initialized");

    Ok(InitResult {
        rig_dir,
        created,
        store,
    })
}

/// Check if a rig is initialized at `root`.
pub fn is_initialized(root: &Path) -> bool {
    rig_dir(root).join(CONFIG_FILE).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_layout_and_store() {
        let dir = tempdir().unwrap();
        let result = init_rig(dir.path(), Some("demo"), StoreBackend::Sqlite).unwrap();
        assert!(result.created);
        for sub in SUBDIRS {
            assert!(result.rig_dir.join(sub).is_dir(), "{sub}");
        }
        assert!(result.rig_dir.join("rig.db").is_file());
        assert!(is_initialized(dir.path()));

        let toml = config::RigToml::load(&result.rig_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(toml.rig.name.as_deref(), Some("demo"));
    }

    #[test]
    fn test_init_flat_store() {
        let dir = tempdir().unwrap();
        let result = init_rig(dir.path(), None, StoreBackend::Flat).unwrap();
        assert_eq!(result.store, StoreBackend::Flat);
        assert!(result.rig_dir.join("issues.jsonl").exists());
    }

    #[test]
    fn test_init_is_idempotent_and_keeps_config() {
        let dir = tempdir().unwrap();
        init_rig(dir.path(), Some("first"), StoreBackend::Flat).unwrap();
        std::fs::remove_dir_all(dir.path().join(".rig/reports")).unwrap();

        let again = init_rig(dir.path(), Some("second"), StoreBackend::Sqlite).unwrap();
        assert!(!again.created);
        assert_eq!(again.store, StoreBackend::Flat);
        assert!(again.rig_dir.join("reports").is_dir());
        let toml = config::RigToml::load(&again.rig_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(toml.rig.name.as_deref(), Some("first"));
    }

    #[test]
    fn test_is_initialized_false_for_new_dir() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));
    }
}
