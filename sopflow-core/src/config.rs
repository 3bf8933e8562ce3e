//! Configuration system for sopflow.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> environment -> explicit overrides. Configuration is
//! loaded from `~/.config/sopflow/config.toml` and/or `.sopflow/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::workflow::store::StateStore;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SopConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl SopConfig {
    /// Collect human-readable warnings for questionable values.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.executor.validate();
        if self
            .store
            .path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            warnings.push("store.path is empty; the default location will be used".to_string());
        }
        warnings
    }
}

/// Where the workflow database lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. Relative paths resolve against the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Open the database in WAL journal mode.
    pub wal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            wal: true,
        }
    }
}

impl StoreConfig {
    pub const DEFAULT_FILE: &'static str = "workflow.db";

    /// Resolve the database path, defaulting to `.sopflow/workflow.db`.
    pub fn resolve_path(&self, workspace: &Path) -> PathBuf {
        match &self.path {
            Some(path) if !path.as_os_str().is_empty() => {
                if path.is_absolute() {
                    path.clone()
                } else {
                    workspace.join(path)
                }
            }
            _ => workspace.join(".sopflow").join(Self::DEFAULT_FILE),
        }
    }

    /// Open the store this config points at.
    pub fn open(&self, workspace: &Path) -> Result<StateStore, ConfigError> {
        let path = self.resolve_path(workspace);
        StateStore::open_with_options(&path, self.wal).map_err(|e| ConfigError::Invalid {
            message: format!("cannot open store at {}: {e}", path.display()),
        })
    }
}

/// Limits applied by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on chained automatic advances per operation.
    pub max_auto_steps: usize,
    /// History rows scanned by `back`.
    pub back_scan_limit: usize,
    /// Rows returned by `get_history` when no limit is given.
    pub default_history_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_auto_steps: 100,
            back_scan_limit: 20,
            default_history_limit: 20,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_auto_steps == 0 {
            warnings.push(
                "executor.max_auto_steps is 0; automatic steps will never advance".to_string(),
            );
        }
        if self.back_scan_limit == 0 {
            warnings.push("executor.back_scan_limit is 0; back will always fail".to_string());
        }
        if self.default_history_limit == 0 {
            warnings.push(
                "executor.default_history_limit is 0; history queries return nothing by default"
                    .to_string(),
            );
        }
        warnings
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `SOPFLOW_`)
/// 3. Workspace-local config (`.sopflow/config.toml`)
/// 4. User config (`~/.config/sopflow/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&SopConfig>,
) -> Result<SopConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(SopConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "sopflow", "sopflow") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".sopflow").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // SOPFLOW_EXECUTOR__MAX_AUTO_STEPS, SOPFLOW_STORE__PATH, ...
    figment = figment.merge(Env::prefixed("SOPFLOW_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load a single TOML file on top of the defaults.
pub fn load_config_file(path: &Path) -> Result<SopConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Figment::from(Serialized::defaults(SopConfig::default()))
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| ConfigError::Figment(Box::new(e)))
}
