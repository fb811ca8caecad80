use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::TaskSpec;
use crate::{glog_debug, Error, Result};

const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_TARGET_BRANCH: &str = "grove/integration";
const DEFAULT_BRANCH_PREFIX: &str = "grove";
const DEFAULT_TICK_INTERVAL_MS: u64 = 500;

/// Orchestrator settings, passed explicitly into the scheduler at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum simultaneous allocated/active workspaces.
    pub max_concurrent: usize,
    pub worktree_dir: Option<String>,
    pub state_dir: Option<String>,
    /// Branch that completed work is merged into.
    pub target_branch: String,
    pub branch_prefix: String,
    pub default_deadline_secs: Option<u64>,
    /// Commit leftover worktree changes before merging.
    pub auto_commit: bool,
    pub tick_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            worktree_dir: None,
            state_dir: None,
            target_branch: DEFAULT_TARGET_BRANCH.to_string(),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            default_deadline_secs: None,
            auto_commit: true,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl OrchestratorConfig {
    pub fn grove_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".grove"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::grove_dir()?.join("grove.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::grove_dir(),
        }
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(self.state_dir()?.join("worktrees")),
        }
    }

    pub fn registry_path(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("registry.jsonl"))
    }

    pub fn signals_dir(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("signals"))
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_secs.map(Duration::from_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        glog_debug!("OrchestratorConfig::load path={}", path.display());
        if !path.exists() {
            glog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        glog_debug!(
            "Config loaded: max_concurrent={}, target_branch={}, worktree_dir={:?}",
            config.max_concurrent,
            config.target_branch,
            config.worktree_dir
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Configuration(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.target_branch.trim().is_empty() {
            return Err(Error::Configuration(
                "target_branch must not be empty".to_string(),
            ));
        }
        if git2::Branch::name_is_valid(&self.target_branch).ok() != Some(true) {
            return Err(Error::Configuration(format!(
                "target_branch '{}' is not a valid branch name",
                self.target_branch
            )));
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.state_dir()?, self.worktrees_dir()?, self.signals_dir()?] {
            if !dir.exists() {
                glog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

/// Task list as written by the producer: either a bare array or a
/// `tasks` table.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskFile {
    Wrapped { tasks: Vec<TaskSpec> },
    Bare(Vec<TaskSpec>),
}

/// Read task specs from a `.json` or `.toml` file.
pub fn load_task_specs(path: &Path) -> Result<Vec<TaskSpec>> {
    let raw = fs::read_to_string(path)?;
    let file: TaskFile = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw)?,
        Some("json") | None => serde_json::from_str(&raw)?,
        Some(other) => {
            return Err(Error::Configuration(format!(
                "unsupported task file extension '.{}' (expected .json or .toml)",
                other
            )))
        }
    };
    let specs = match file {
        TaskFile::Wrapped { tasks } | TaskFile::Bare(tasks) => tasks,
    };
    glog_debug!("Loaded {} task spec(s) from {}", specs.len(), path.display());
    Ok(specs)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
