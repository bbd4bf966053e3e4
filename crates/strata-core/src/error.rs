//! Error taxonomy for build planning and execution.
//!
//! Configuration and double-write errors are fatal. Cache misses never reach
//! this type: the cache layer downgrades them to "needs build". Module build
//! failures are recorded as module state rather than returned as errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal input errors detected before any module starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("module '{module}' is in the build set but absent from the manifest")]
    ModuleNotInManifest { module: String },

    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: String, dependency: String },

    #[error("dependency cycle detected: {}", .modules.join(" -> "))]
    DependencyCycle { modules: Vec<String> },

    #[error("duplicate module '{name}' in manifest")]
    DuplicateModule { name: String },

    #[error("duplicate bucket tag '{tag}' in a single fingerprinting pass")]
    DuplicateBucketTag { tag: String },

    #[error("required directory missing: {path}")]
    MissingDirectory { path: String },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// One destination targeted by more than one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleWriteConflict {
    pub destination: String,
    pub sources: Vec<String>,
}

impl fmt::Display for DoubleWriteConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- [{}]", self.destination, self.sources.join(", "))
    }
}

/// Two writes collided on one destination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DoubleWriteError {
    #[error("double write detected for {} destination(s): {}", .conflicts.len(), render_conflicts(.conflicts))]
    Destinations { conflicts: Vec<DoubleWriteConflict> },

    #[error("project outputs recorded twice for '{project_file}'")]
    ProjectOutputs { project_file: String },
}

fn render_conflicts(conflicts: &[DoubleWriteConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced by the planning engine.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    DoubleWrite(#[from] DoubleWriteError),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("broker rejected request: {0}")]
    BrokerRejected(String),

    #[error("source control error: {0}")]
    SourceControl(String),

    #[error("cannot discover projects under {path}: {message}")]
    Discovery { path: String, message: String },

    #[error("invalid state transition for module '{module}': {from} -> {to}")]
    InvalidTransition {
        module: String,
        from: String,
        to: String,
    },

    #[error("module '{0}' is not tracked by this plan")]
    UntrackedModule(String),

    #[error("plan file error: {0}")]
    PlanFile(String),

    #[error("module task aborted: {0}")]
    ModuleTask(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("state store error: {0}")]
    State(#[from] strata_state::StateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrataError {
    /// Whether the error should abort the build before any module starts.
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, StrataError::Config(_))
    }
}

/// Result type for planning operations.
pub type Result<T> = std::result::Result<T, StrataError>;
