//! Component registry: capability → backend, from a fixed table.
//!
//! Every collaborator the coordinator needs is resolved here at startup. The
//! table is closed; selecting a backend is a config value, not a plugin.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_state::{FsStateStore, MemoryStateStore, StateStore};
use tracing::debug;

use crate::config::BuildConfig;
use crate::error::Result;
use crate::source::{FsSourceControl, GitSourceControl, SourceControl};

/// What kind of collaborator is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    SourceControl,
    StateStore,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::SourceControl => write!(f, "source_control"),
            Capability::StateStore => write!(f, "state_store"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceControlBackend {
    #[default]
    Git,
    /// Plain directory walk; for trees outside version control.
    Filesystem,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStoreBackend {
    #[default]
    Filesystem,
    /// Process-local; nothing survives the build.
    Memory,
}

/// One row of the backend table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendEntry {
    pub capability: Capability,
    pub name: &'static str,
    pub description: &'static str,
}

/// Every backend this build knows about.
pub const BACKENDS: &[BackendEntry] = &[
    BackendEntry {
        capability: Capability::SourceControl,
        name: "git",
        description: "tree ids and status from the git binary",
    },
    BackendEntry {
        capability: Capability::SourceControl,
        name: "filesystem",
        description: "sha-256 over a directory walk",
    },
    BackendEntry {
        capability: Capability::StateStore,
        name: "filesystem",
        description: "one json file per bucket under the state directory",
    },
    BackendEntry {
        capability: Capability::StateStore,
        name: "memory",
        description: "in-process map, discarded at exit",
    },
];

/// Resolved collaborators for one build.
#[derive(Clone)]
pub struct ComponentRegistry {
    source_control: Arc<dyn SourceControl>,
    state_store: Arc<dyn StateStore>,
    selected: Vec<(Capability, &'static str)>,
}

impl ComponentRegistry {
    /// Resolve every capability for `config`.
    pub fn from_config(config: &BuildConfig) -> Result<Self> {
        let root = config.root.as_path();
        let (source_control, sc_name): (Arc<dyn SourceControl>, &'static str) =
            match config.source_control {
                SourceControlBackend::Git => (Arc::new(GitSourceControl::new(root)) as Arc<dyn SourceControl>, "git"),
                SourceControlBackend::Filesystem => {
                    (
                        Arc::new(FsSourceControl::with_ignored_dirs(root, config.layout.ignored_dirs.clone()))
                            as Arc<dyn SourceControl>,
                        "filesystem",
                    )
                }
            };

        let (state_store, store_name): (Arc<dyn StateStore>, &'static str) =
            match config.state_store {
                StateStoreBackend::Filesystem => (
                    Arc::new(FsStateStore::new(config.resolve(&config.state_dir))?) as Arc<dyn StateStore>,
                    "filesystem",
                ),
                StateStoreBackend::Memory => (Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>, "memory"),
            };

        debug!(source_control = sc_name, state_store = store_name, "components resolved");
        Ok(Self {
            source_control,
            state_store,
            selected: vec![
                (Capability::SourceControl, sc_name),
                (Capability::StateStore, store_name),
            ],
        })
    }

    /// Registry over explicitly supplied components.
    pub fn with_components(
        source_control: Arc<dyn SourceControl>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            source_control,
            state_store,
            selected: vec![
                (Capability::SourceControl, "custom"),
                (Capability::StateStore, "custom"),
            ],
        }
    }

    pub fn source_control(&self) -> Arc<dyn SourceControl> {
        Arc::clone(&self.source_control)
    }

    pub fn state_store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.state_store)
    }

    /// Backend name chosen for `capability`.
    pub fn selected(&self, capability: Capability) -> Option<&'static str> {
        self.selected
            .iter()
            .find(|(c, _)| *c == capability)
            .map(|(_, name)| *name)
    }

    /// Backends available for `capability`.
    pub fn available(capability: Capability) -> impl Iterator<Item = &'static BackendEntry> {
        BACKENDS.iter().filter(move |b| b.capability == capability)
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("selected", &self.selected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_capability_has_two_backends() {
        assert_eq!(ComponentRegistry::available(Capability::SourceControl).count(), 2);
        assert_eq!(ComponentRegistry::available(Capability::StateStore).count(), 2);
    }

    #[test]
    fn resolves_configured_backends() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            root: dir.path().to_path_buf(),
            source_control: SourceControlBackend::Filesystem,
            state_store: StateStoreBackend::Memory,
            ..BuildConfig::default()
        };
        let reg = ComponentRegistry::from_config(&config).unwrap();
        assert_eq!(reg.selected(Capability::SourceControl), Some("filesystem"));
        assert_eq!(reg.selected(Capability::StateStore), Some("memory"));
        assert!(reg.state_store().list_tags().unwrap().is_empty());
    }

    #[test]
    fn filesystem_store_lands_under_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            root: dir.path().to_path_buf(),
            ..BuildConfig::default()
        };
        let reg = ComponentRegistry::from_config(&config).unwrap();
        assert_eq!(reg.selected(Capability::StateStore), Some("filesystem"));
        assert!(dir.path().join(".strata/state").is_dir());
    }

    #[test]
    fn backend_names_parse_from_toml() {
        let c = BuildConfig::from_toml_str("source_control = \"filesystem\"\nstate_store = \"memory\"\n")
            .unwrap();
        assert_eq!(c.source_control, SourceControlBackend::Filesystem);
        assert_eq!(c.state_store, StateStoreBackend::Memory);
        assert_eq!(Capability::StateStore.to_string(), "state_store");
    }
}
