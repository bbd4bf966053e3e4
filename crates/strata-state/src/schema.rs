//! Persisted build state schema.
//!
//! These are plain data carriers. Anything that reaches disk goes through
//! [`encode_state_file`] / [`decode_state_file`], which pin the on-disk
//! format to [`STATE_FORMAT_VERSION`] independently of the in-memory layout.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Current on-disk format version for [`BuildStateFile`].
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Normalize a path-like key for case-insensitive comparison.
///
/// Backslashes become forward slashes, `.` segments and duplicate separators
/// are dropped, trailing separators are trimmed and the result is lowercased.
pub fn normalize_key(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let absolute = replaced.starts_with('/');
    let joined = replaced
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/");
    let mut out = if absolute {
        format!("/{joined}")
    } else {
        joined
    };
    if out.is_empty() {
        out.push('.');
    }
    out.to_lowercase()
}

/// Content-addressed fingerprint of one module directory.
///
/// `id` is `None` for the root bucket and for "dirty" modules that carry
/// pending changes; such buckets never match a stored state file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketId {
    /// Module directory identifier, relative to the build root.
    pub tag: String,
    /// Content hash (hex), when the module content is settled.
    pub id: Option<String>,
    /// True for the unscoped bucket that collects non-module paths.
    pub is_root: bool,
}

impl BucketId {
    /// Tag used for the root bucket.
    pub const ROOT_TAG: &'static str = ".";

    /// A hashed module bucket.
    pub fn module(tag: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            id: Some(id.into()),
            is_root: false,
        }
    }

    /// A module bucket with pending changes; always rebuilt.
    pub fn dirty(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            id: None,
            is_root: false,
        }
    }

    /// The root bucket.
    pub fn root() -> Self {
        Self {
            tag: Self::ROOT_TAG.to_string(),
            id: None,
            is_root: true,
        }
    }

    /// Whether this bucket has no content id.
    pub fn is_dirty(&self) -> bool {
        !self.is_root && self.id.is_none()
    }

    /// Tag normalized for case-insensitive comparison.
    pub fn normalized_tag(&self) -> String {
        normalize_key(&self.tag)
    }

    /// Short form of the id (first 12 hex chars), or `dirty`/`root`.
    pub fn short_id(&self) -> &str {
        match &self.id {
            Some(id) => &id[..12.min(id.len())],
            None if self.is_root => "root",
            None => "dirty",
        }
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.tag, self.short_id())
    }
}

/// Outputs produced by one built project.
///
/// Keyed by `project_file` within a build; recorded exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectOutputSnapshot {
    pub project_file: String,
    pub output_path: String,
    pub intermediate_directory: String,
    pub files_written: Vec<String>,
    /// SHA-256 (hex) per written file, keyed by the file path.
    #[serde(default)]
    pub file_checksums: BTreeMap<String, String>,
    pub project_guid: String,
    pub is_test_project: bool,
    /// Bucket tag of the module directory the project lives in.
    pub tag: String,
}

impl ProjectOutputSnapshot {
    /// Snapshot with no recorded files.
    pub fn new(
        project_file: impl Into<String>,
        project_guid: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            project_file: project_file.into(),
            output_path: String::new(),
            intermediate_directory: String::new(),
            files_written: Vec::new(),
            file_checksums: BTreeMap::new(),
            project_guid: project_guid.into(),
            is_test_project: false,
            tag: tag.into(),
        }
    }

    /// Normalized project file key.
    pub fn key(&self) -> String {
        normalize_key(&self.project_file)
    }
}

/// Persisted record of what a module produced the last time its bucket id
/// was built successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStateFile {
    pub format_version: u32,
    pub bucket: BucketId,
    pub outputs: Vec<ProjectOutputSnapshot>,
    /// Where the record lives (filled on read; informational on write).
    #[serde(default)]
    pub location: String,
    pub written_at: DateTime<Utc>,
}

impl BuildStateFile {
    /// New state file stamped with the current time.
    pub fn new(bucket: BucketId, outputs: Vec<ProjectOutputSnapshot>) -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            bucket,
            outputs,
            location: String::new(),
            written_at: Utc::now(),
        }
    }

    /// Content id of the bucket, rejecting roots and dirty buckets.
    pub fn persisted_id(&self) -> StateResult<&str> {
        if self.bucket.is_root {
            return Err(StateError::RootBucket);
        }
        self.bucket
            .id
            .as_deref()
            .ok_or_else(|| StateError::UnhashedBucket {
                tag: self.bucket.tag.clone(),
            })
    }
}

/// Encode a state file as pretty JSON.
pub fn encode_state_file(file: &BuildStateFile) -> StateResult<Vec<u8>> {
    file.persisted_id()?;
    Ok(serde_json::to_vec_pretty(file)?)
}

/// Decode a state file, rejecting unknown format versions.
pub fn decode_state_file(bytes: &[u8], location: &str) -> StateResult<BuildStateFile> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
            location: location.to_string(),
            reason: e.to_string(),
        })?;

    let found = value
        .get("format_version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| StateError::Corrupt {
            location: location.to_string(),
            reason: "missing format_version".to_string(),
        })? as u32;
    if found != STATE_FORMAT_VERSION {
        return Err(StateError::UnsupportedVersion {
            found,
            expected: STATE_FORMAT_VERSION,
        });
    }

    let mut file: BuildStateFile =
        serde_json::from_value(value).map_err(|e| StateError::Corrupt {
            location: location.to_string(),
            reason: e.to_string(),
        })?;
    file.location = location.to_string();
    Ok(file)
}
