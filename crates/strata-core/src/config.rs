//! Build configuration.
//!
//! Resolution order: built-in defaults, then `strata.toml` at the build root,
//! then `STRATA_*` environment variables, then CLI flags (applied by the host).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::registry::{SourceControlBackend, StateStoreBackend};

/// Name of the optional config file at the build root.
pub const CONFIG_FILE_NAME: &str = "strata.toml";

/// Environment variable naming the active broker channel.
pub const BROKER_CHANNEL_ENV: &str = "STRATA_BROKER_CHANNEL";

/// Whether only direct or fully transitive dependencies of the build set are
/// fetched instead of rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    #[default]
    Direct,
    Transitive,
}

impl FromStr for FetchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(FetchMode::Direct),
            "transitive" => Ok(FetchMode::Transitive),
            other => Err(ConfigError::InvalidConfig(format!(
                "unknown fetch mode '{other}' (expected direct|transitive)"
            ))),
        }
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchMode::Direct => "direct",
            FetchMode::Transitive => "transitive",
        })
    }
}

/// Which local changes override the cache.
///
/// Anything other than `None` bypasses the cache entirely, even when the
/// working tree turns out to be clean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesToConsider {
    #[default]
    None,
    PendingChanges,
    Branch,
}

impl FromStr for ChangesToConsider {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(ChangesToConsider::None),
            "pending_changes" | "pending" => Ok(ChangesToConsider::PendingChanges),
            "branch" => Ok(ChangesToConsider::Branch),
            other => Err(ConfigError::InvalidConfig(format!(
                "unknown change mode '{other}' (expected none|pending_changes|branch)"
            ))),
        }
    }
}

impl fmt::Display for ChangesToConsider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangesToConsider::None => "none",
            ChangesToConsider::PendingChanges => "pending_changes",
            ChangesToConsider::Branch => "branch",
        })
    }
}

/// Host switches that select the analysis and caching policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Switches {
    pub resume: bool,
    pub dry_run: bool,
    pub clean: bool,
    pub release: bool,
    pub build_all: bool,
}

/// How module directories are scanned for projects and descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// File name suffixes that mark a buildable project.
    pub project_suffixes: Vec<String>,
    /// File names of orchestration descriptors (matched case-insensitively).
    pub orchestration_files: Vec<String>,
    /// Directory names never descended into.
    pub ignored_dirs: Vec<String>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            project_suffixes: vec!["proj".to_string()],
            orchestration_files: vec!["dirs.proj".to_string(), "build.proj".to_string()],
            ignored_dirs: [".git", ".strata", "bin", "obj", "target", "node_modules"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Full build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build root; relative paths below resolve against it.
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub plan_path: PathBuf,
    pub context_path: PathBuf,
    pub manifest_path: PathBuf,
    pub fetch_mode: FetchMode,
    pub changes_to_consider: ChangesToConsider,
    pub switches: Switches,
    /// Directories always built.
    pub include: Vec<String>,
    /// Directories never built.
    pub exclude: Vec<String>,
    /// Prefix or substring filters; a match excludes the directory.
    pub exclude_filters: Vec<String>,
    pub max_parallelism: usize,
    pub broker_channel: Option<String>,
    pub broker_timeout_secs: u64,
    /// Per-module timeout; `0` disables it.
    pub module_timeout_secs: u64,
    /// Command run in each module directory by the command builder.
    pub build_command: Vec<String>,
    /// Rebuild cache-hit modules whose dependencies are rebuilt.
    pub rebuild_dependents: bool,
    pub layout: LayoutConfig,
    pub branch: Option<String>,
    pub is_pull_request: bool,
    pub source_control: SourceControlBackend,
    pub state_store: StateStoreBackend,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            state_dir: PathBuf::from(".strata/state"),
            plan_path: PathBuf::from(".strata/plan.json"),
            context_path: PathBuf::from(".strata/context.json"),
            manifest_path: PathBuf::from("strata-modules.toml"),
            fetch_mode: FetchMode::default(),
            changes_to_consider: ChangesToConsider::default(),
            switches: Switches::default(),
            include: Vec::new(),
            exclude: Vec::new(),
            exclude_filters: Vec::new(),
            max_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            broker_channel: None,
            broker_timeout_secs: 30,
            module_timeout_secs: 0,
            build_command: Vec::new(),
            rebuild_dependents: true,
            layout: LayoutConfig::default(),
            branch: None,
            is_pull_request: false,
            source_control: SourceControlBackend::default(),
            state_store: StateStoreBackend::default(),
        }
    }
}

impl BuildConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ConfigError::InvalidConfig(format!("{CONFIG_FILE_NAME}: {e}")).into())
    }

    /// Load `strata.toml` from `root` when present and apply environment
    /// overrides. `root` always wins over any `root` key in the file.
    pub fn load(root: &Path) -> Result<Self> {
        let file = root.join(CONFIG_FILE_NAME);
        let mut config = if file.is_file() {
            Self::from_toml_str(&std::fs::read_to_string(&file)?)?
        } else {
            Self::default()
        };
        config.root = root.to_path_buf();
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `STRATA_*` overrides using `lookup` to read variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STRATA_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STRATA_FETCH_MODE") {
            self.fetch_mode = v.parse()?;
        }
        if let Some(v) = lookup("STRATA_CHANGES") {
            self.changes_to_consider = v.parse()?;
        }
        if let Some(v) = lookup(BROKER_CHANNEL_ENV) {
            self.broker_channel = Some(v);
        }
        if let Some(v) = lookup("STRATA_MAX_PARALLELISM") {
            self.max_parallelism = v.parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("STRATA_MAX_PARALLELISM must be a number, got '{v}'"))
            })?;
        }
        if let Some(v) = lookup("STRATA_BRANCH") {
            self.branch = Some(v);
        }
        if let Some(v) = lookup("STRATA_PULL_REQUEST") {
            self.is_pull_request = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Resolve `path` against the build root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Check invariants that would otherwise surface mid-build.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(ConfigError::MissingDirectory {
                path: self.root.display().to_string(),
            }
            .into());
        }
        if self.max_parallelism == 0 {
            return Err(
                ConfigError::InvalidConfig("max_parallelism must be at least 1".to_string()).into(),
            );
        }
        if self.layout.project_suffixes.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "layout.project_suffixes must not be empty".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
