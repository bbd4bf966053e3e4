//! Project and orchestration-descriptor discovery.
//!
//! Each included module directory is walked once. Files whose names end with
//! a configured project suffix are projects; files whose names match an
//! orchestration descriptor name are descriptors. A directory holding
//! descriptors but no project is an orchestration node: nothing is compiled
//! there, but it is still visited in the owning module's wave.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::LayoutConfig;
use crate::error::{ConfigError, Result, StrataError};

/// What was found under one module directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredModule {
    /// Module directory relative to the build root.
    pub directory: String,
    /// Project files, relative to the build root, sorted.
    pub project_files: Vec<String>,
    /// Descriptor files in directories without a project, sorted.
    pub orchestration_nodes: Vec<String>,
}

impl DiscoveredModule {
    pub fn is_empty(&self) -> bool {
        self.project_files.is_empty() && self.orchestration_nodes.is_empty()
    }
}

#[derive(Default)]
struct DirEntries {
    projects: Vec<String>,
    descriptors: Vec<String>,
}

/// Walks module directories below a build root.
pub struct Discovery<'a> {
    root: PathBuf,
    layout: &'a LayoutConfig,
}

impl<'a> Discovery<'a> {
    pub fn new(root: impl Into<PathBuf>, layout: &'a LayoutConfig) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    fn is_descriptor(&self, name: &str) -> bool {
        self.layout
            .orchestration_files
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    }

    fn is_project(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.layout
            .project_suffixes
            .iter()
            .any(|s| lower.ends_with(&s.to_ascii_lowercase()))
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.layout.ignored_dirs.iter().any(|d| d.eq_ignore_ascii_case(name))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Discover projects and descriptors under `directory`.
    pub fn discover(&self, directory: &str) -> Result<DiscoveredModule> {
        let base = self.root.join(directory);
        if !base.is_dir() {
            return Err(ConfigError::MissingDirectory {
                path: base.display().to_string(),
            }
            .into());
        }

        let mut by_dir: BTreeMap<PathBuf, DirEntries> = BTreeMap::new();
        let walker = WalkDir::new(&base)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e.file_type().is_dir()
                    || !self.is_ignored(&e.file_name().to_string_lossy())
            });

        for entry in walker {
            let entry = entry.map_err(|e| StrataError::Discovery {
                path: e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| base.display().to_string()),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let parent = entry
                .path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| base.clone());
            let rel = self.relative(entry.path());
            // Descriptor names win over the project suffix ("dirs.proj").
            if self.is_descriptor(&name) {
                by_dir.entry(parent).or_default().descriptors.push(rel);
            } else if self.is_project(&name) {
                by_dir.entry(parent).or_default().projects.push(rel);
            }
        }

        let mut module = DiscoveredModule {
            directory: directory.replace('\\', "/"),
            ..DiscoveredModule::default()
        };
        for (_, entries) in by_dir {
            if entries.projects.is_empty() {
                module.orchestration_nodes.extend(entries.descriptors);
            } else {
                module.project_files.extend(entries.projects);
            }
        }
        module.project_files.sort();
        module.orchestration_nodes.sort();

        debug!(
            module = %directory,
            projects = module.project_files.len(),
            orchestration = module.orchestration_nodes.len(),
            "discovered"
        );
        Ok(module)
    }

    /// Discover every directory in `directories`, skipping duplicates.
    pub fn discover_all(&self, directories: &[String]) -> Result<Vec<DiscoveredModule>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for dir in directories {
            if seen.insert(strata_state::normalize_key(dir)) {
                out.push(self.discover(dir)?);
            }
        }
        Ok(out)
    }
}
