//! The build-wide context aggregate.
//!
//! One [`BuildOperationContext`] exists per build. The coordinator owns it
//! behind a [`SharedContext`]; workers reach it through the pipeline service,
//! in process or over the broker. Every mutation bumps `version`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_state::{BucketId, BuildStateFile, ProjectOutputSnapshot};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::error::{DoubleWriteError, Result, StrataError};
use crate::source::SourceChange;

/// Format version of persisted context checkpoints.
pub const CONTEXT_FORMAT_VERSION: u32 = 1;

/// Host environment of the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub build_id: String,
    pub host: String,
    pub branch: Option<String>,
    pub is_pull_request: bool,
    pub release: bool,
    pub started_at: DateTime<Utc>,
}

impl BuildMetadata {
    pub fn new(branch: Option<String>, is_pull_request: bool, release: bool) -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            build_id: uuid::Uuid::new_v4().to_string(),
            host,
            branch,
            is_pull_request,
            release,
            started_at: Utc::now(),
        }
    }
}

impl Default for BuildMetadata {
    fn default() -> Self {
        Self::new(None, false, false)
    }
}

/// Fingerprinting inputs and results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTreeMetadata {
    pub baseline: String,
    pub buckets: Vec<BucketId>,
    pub changes: Vec<SourceChange>,
}

/// Cached state available to this build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStateMetadata {
    pub available: Vec<BuildStateFile>,
    /// Set when the cache was bypassed.
    pub bypass: Option<String>,
}

/// One file in an artifact manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactItem {
    pub path: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl ArtifactItem {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            checksum: None,
        }
    }
}

/// Named, versioned grouping of files destined for external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub id: String,
    pub publisher: String,
    /// Starts at 1 and increases each time items are appended.
    pub version: u32,
    pub items: Vec<ArtifactItem>,
}

/// Artifact manifests keyed by publisher. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCollection {
    pub by_publisher: BTreeMap<String, Vec<ArtifactManifest>>,
}

impl ArtifactCollection {
    /// Append `items` to `publisher`'s manifest `id`, creating it if needed.
    /// Paths already present are not duplicated.
    pub fn record(&mut self, publisher: &str, id: &str, items: Vec<ArtifactItem>) -> ArtifactManifest {
        let manifests = self.by_publisher.entry(publisher.to_string()).or_default();
        let pos = match manifests.iter().position(|m| m.id == id) {
            Some(pos) => {
                manifests[pos].version += 1;
                pos
            }
            None => {
                manifests.push(ArtifactManifest {
                    id: id.to_string(),
                    publisher: publisher.to_string(),
                    version: 1,
                    items: Vec::new(),
                });
                manifests.len() - 1
            }
        };
        let manifest = &mut manifests[pos];
        for item in items {
            if !manifest.items.iter().any(|i| i.path == item.path) {
                manifest.items.push(item);
            }
        }
        manifest.clone()
    }

    pub fn all(&self) -> Vec<ArtifactManifest> {
        self.by_publisher.values().flatten().cloned().collect()
    }
}

/// Root aggregate of build-wide state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOperationContext {
    pub format_version: u32,
    /// Bumped on every mutation.
    pub version: u64,
    /// `scope → key → value`
    pub variables: BTreeMap<String, BTreeMap<String, String>>,
    pub build_metadata: BuildMetadata,
    pub source_tree_metadata: SourceTreeMetadata,
    pub build_state_metadata: BuildStateMetadata,
    /// Keyed by normalized project file path.
    pub project_outputs: BTreeMap<String, ProjectOutputSnapshot>,
    pub artifacts: ArtifactCollection,
}

impl Default for BuildOperationContext {
    fn default() -> Self {
        Self::new(BuildMetadata::default())
    }
}

impl BuildOperationContext {
    pub fn new(build_metadata: BuildMetadata) -> Self {
        Self {
            format_version: CONTEXT_FORMAT_VERSION,
            version: 0,
            variables: BTreeMap::new(),
            build_metadata,
            source_tree_metadata: SourceTreeMetadata::default(),
            build_state_metadata: BuildStateMetadata::default(),
            project_outputs: BTreeMap::new(),
            artifacts: ArtifactCollection::default(),
        }
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    pub fn put_variable(&mut self, scope: &str, key: &str, value: &str) {
        self.variables
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.touch();
    }

    pub fn get_variable(&self, scope: &str, key: &str) -> Option<&str> {
        self.variables
            .get(scope)
            .and_then(|vars| vars.get(key))
            .map(String::as_str)
    }

    /// Record outputs for one project. A second record for the same project
    /// without an intervening reset is a double write.
    pub fn record_project_outputs(
        &mut self,
        snapshot: ProjectOutputSnapshot,
    ) -> std::result::Result<(), DoubleWriteError> {
        let key = snapshot.key();
        if self.project_outputs.contains_key(&key) {
            return Err(DoubleWriteError::ProjectOutputs {
                project_file: snapshot.project_file,
            });
        }
        self.project_outputs.insert(key, snapshot);
        self.touch();
        Ok(())
    }

    /// Forget the outputs of `project_file`. Returns whether any existed.
    pub fn reset_project_outputs(&mut self, project_file: &str) -> bool {
        let removed = self
            .project_outputs
            .remove(&strata_state::normalize_key(project_file))
            .is_some();
        if removed {
            self.touch();
        }
        removed
    }

    pub fn all_project_outputs(&self) -> Vec<ProjectOutputSnapshot> {
        self.project_outputs.values().cloned().collect()
    }

    pub fn record_artifact(&mut self, publisher: &str, id: &str, items: Vec<ArtifactItem>) -> ArtifactManifest {
        let manifest = self.artifacts.record(publisher, id, items);
        self.touch();
        manifest
    }

    pub fn associated_artifacts(&self) -> Vec<ArtifactManifest> {
        self.artifacts.all()
    }

    /// Persist a checkpoint atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let bytes = serde_json::to_vec_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Load a checkpoint, rejecting unknown format versions.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        decode_context(&bytes)
    }
}

/// Decode a context checkpoint, rejecting unknown format versions.
pub fn decode_context(bytes: &[u8]) -> Result<BuildOperationContext> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let found = value.get("format_version").and_then(|v| v.as_u64());
    if found != Some(u64::from(CONTEXT_FORMAT_VERSION)) {
        return Err(StrataError::PlanFile(format!(
            "context checkpoint has format_version {found:?}, expected {CONTEXT_FORMAT_VERSION}"
        )));
    }
    Ok(serde_json::from_value(value)?)
}

/// The canonical context behind a mutex. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    inner: Arc<Mutex<BuildOperationContext>>,
}

impl SharedContext {
    pub fn new(context: BuildOperationContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    /// Copy of the current aggregate.
    pub async fn snapshot(&self) -> BuildOperationContext {
        self.inner.lock().await.clone()
    }

    /// Replace the aggregate wholesale.
    pub async fn replace(&self, mut context: BuildOperationContext) {
        let mut guard = self.inner.lock().await;
        context.version = guard.version.max(context.version) + 1;
        *guard = context;
    }

    /// Run `f` with exclusive access.
    pub async fn with<R>(&self, f: impl FnOnce(&mut BuildOperationContext) -> R) -> R {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }

    pub async fn checkpoint(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot().await;
        snapshot.save(path)
    }
}
