//! Output recorder: project snapshots in, state files out.
//!
//! During a build each finished project is snapshotted (with SHA-256 per
//! written file) into the shared context. When the build ends, snapshots are
//! grouped by bucket tag and one state file is written per module that
//! succeeded with a hashed bucket. Failed, skipped and dirty modules keep
//! whatever state file they had before.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_state::{normalize_key, BuildStateFile, ProjectOutputSnapshot, StateStore};
use tracing::{debug, warn};

use crate::error::Result;
use crate::fingerprint::BucketSet;
use crate::obs;
use crate::pipeline::PipelineService;
use crate::tracker::{ModuleState, ModuleTracker};

/// What `write_state_files` did per module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReport {
    /// `(tag, location)` of each state file written.
    pub written: Vec<(String, String)>,
    /// `(module, reason)` for modules that got no state file.
    pub skipped: Vec<(String, String)>,
}

/// Records project outputs and persists state files.
#[derive(Debug, Clone)]
pub struct OutputRecorder {
    root: PathBuf,
}

impl OutputRecorder {
    /// `root` resolves relative paths in `files_written`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn checksum(path: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Checksum every written file and record the snapshot in the context.
    ///
    /// Files that cannot be read are left without a checksum.
    pub async fn build_snapshot(
        &self,
        pipeline: &dyn PipelineService,
        mut snapshot: ProjectOutputSnapshot,
    ) -> Result<ProjectOutputSnapshot> {
        for file in &snapshot.files_written {
            let path = self.root.join(file);
            match Self::checksum(&path) {
                Ok(sum) => {
                    snapshot.file_checksums.insert(file.clone(), sum);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "cannot checksum output"),
            }
        }
        pipeline.record_project_outputs(snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Replay cache-hit outputs into the context so consumers see them.
    pub async fn seed_cached_outputs(
        &self,
        pipeline: &dyn PipelineService,
        cached: &[BuildStateFile],
    ) -> Result<usize> {
        let mut seeded = 0;
        for file in cached {
            for snapshot in &file.outputs {
                pipeline.record_project_outputs(snapshot.clone()).await?;
                seeded += 1;
            }
        }
        debug!(seeded, "cached outputs replayed into context");
        Ok(seeded)
    }

    /// Write one state file per succeeded module and move it to `Recorded`.
    pub async fn write_state_files(
        &self,
        pipeline: &dyn PipelineService,
        tracker: &mut ModuleTracker,
        buckets: &BucketSet,
        store: &dyn StateStore,
    ) -> Result<RecordReport> {
        let mut by_tag: BTreeMap<String, Vec<ProjectOutputSnapshot>> = BTreeMap::new();
        for snapshot in pipeline.get_all_project_outputs().await? {
            by_tag
                .entry(normalize_key(&snapshot.tag))
                .or_default()
                .push(snapshot);
        }

        let succeeded: Vec<(String, String)> = tracker
            .in_state(ModuleState::Succeeded)
            .into_iter()
            .map(|m| (m.name.clone(), m.directory.clone()))
            .collect();

        let mut report = RecordReport::default();
        for (name, directory) in succeeded {
            let Some(bucket) = buckets.find(&directory) else {
                report.skipped.push((name, "no bucket".to_string()));
                continue;
            };
            if bucket.is_dirty() {
                report.skipped.push((name, "pending changes".to_string()));
                continue;
            }
            let outputs = by_tag.remove(&bucket.normalized_tag()).unwrap_or_default();
            let file = BuildStateFile::new(bucket.clone(), outputs);
            match store.write(&file) {
                Ok(location) => {
                    obs::emit_state_file_written(&bucket.tag, &location);
                    tracker.transition(&name, ModuleState::Recorded)?;
                    report.written.push((bucket.tag.clone(), location));
                }
                Err(e) => {
                    // Losing a state file only costs a rebuild next time.
                    warn!(module = %name, error = %e, "state file not written");
                    report.skipped.push((name, e.to_string()));
                }
            }
        }

        for m in tracker.modules() {
            match m.state {
                ModuleState::Failed => report.skipped.push((m.name.clone(), "failed".to_string())),
                ModuleState::Unassigned | ModuleState::Queued | ModuleState::Building => {
                    report.skipped.push((m.name.clone(), "not built".to_string()))
                }
                _ => {}
            }
        }
        Ok(report)
    }
}
