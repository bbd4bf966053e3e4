//! Module manifest: the declared modules and who provides what to whom.
//!
//! ```toml
//! [[module]]
//! name = "Core"
//! directory = "src/Core"
//! type = "first_party"
//! dependencies = ["Json"]
//!
//! [[module]]
//! name = "Json"
//! type = "third_party"
//! version = "13.0"
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_state::normalize_key;

use crate::error::{ConfigError, Result};

/// Whether a module is built from this tree or vendored from outside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    #[default]
    FirstParty,
    ThirdParty,
}

/// One module declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub name: String,
    #[serde(rename = "type", default)]
    pub module_type: ModuleType,
    /// Version requirement for vendored modules.
    #[serde(default, rename = "version")]
    pub version_requirement: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Directory relative to the build root; first-party modules only.
    #[serde(default)]
    pub directory: Option<String>,
    /// Names of the modules this one consumes.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl DependencyNode {
    pub fn first_party(name: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module_type: ModuleType::FirstParty,
            version_requirement: None,
            branch: None,
            directory: Some(directory.into()),
            dependencies: Vec::new(),
        }
    }

    pub fn third_party(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module_type: ModuleType::ThirdParty,
            version_requirement: Some(version.into()),
            branch: None,
            directory: None,
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.dependencies
            .extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Case-insensitive identity key.
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn is_third_party(&self) -> bool {
        self.module_type == ModuleType::ThirdParty
    }
}

/// Directed edge: `consumer` needs what `provider` produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub consumer: String,
    pub provider: String,
}

/// Every module known to the build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    #[serde(rename = "module", default)]
    pub modules: Vec<DependencyNode>,
}

impl ModuleManifest {
    pub fn new(modules: Vec<DependencyNode>) -> Result<Self> {
        let manifest = Self { modules };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let manifest: Self =
            toml::from_str(s).map_err(|e| ConfigError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidManifest(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut dirs = HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return Err(ConfigError::InvalidManifest("module with empty name".to_string()).into());
            }
            if !names.insert(module.key()) {
                return Err(ConfigError::DuplicateModule {
                    name: module.name.clone(),
                }
                .into());
            }
            match (&module.module_type, &module.directory) {
                (ModuleType::FirstParty, None) => {
                    return Err(ConfigError::InvalidManifest(format!(
                        "first-party module '{}' has no directory",
                        module.name
                    ))
                    .into())
                }
                (ModuleType::FirstParty, Some(dir)) => {
                    if !dirs.insert(normalize_key(dir)) {
                        return Err(ConfigError::InvalidManifest(format!(
                            "directory '{dir}' is claimed by more than one module"
                        ))
                        .into());
                    }
                }
                (ModuleType::ThirdParty, _) => {}
            }
        }
        Ok(())
    }

    /// Module by name, compared case-insensitively.
    pub fn find(&self, name: &str) -> Option<&DependencyNode> {
        let key = name.to_lowercase();
        self.modules.iter().find(|m| m.key() == key)
    }

    /// First-party module owning `directory`, compared case-insensitively.
    pub fn find_by_directory(&self, directory: &str) -> Option<&DependencyNode> {
        let wanted = normalize_key(directory);
        self.modules.iter().find(|m| {
            m.directory
                .as_deref()
                .is_some_and(|d| normalize_key(d) == wanted)
        })
    }

    /// Directories of first-party modules, in manifest order.
    pub fn module_directories(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| !m.is_third_party())
            .filter_map(|m| m.directory.clone())
            .collect()
    }

    /// All declared edges with self-references dropped.
    pub fn edges(&self) -> Vec<ModuleDependency> {
        self.modules
            .iter()
            .flat_map(|m| {
                m.dependencies
                    .iter()
                    .filter(move |d| d.to_lowercase() != m.key())
                    .map(move |d| ModuleDependency {
                        consumer: m.name.clone(),
                        provider: d.clone(),
                    })
            })
            .collect()
    }
}
