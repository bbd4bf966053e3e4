//! Bucket fingerprinting.
//!
//! Every module directory becomes one bucket. A module with pending changes
//! is left unhashed ("dirty") so it is always rebuilt; every other module gets
//! a bucket id derived from its content hash at the baseline commit. The id
//! depends only on the tag and content, so agents on different machines
//! compute identical ids for identical trees.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use strata_state::{normalize_key, BucketId};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::source::{SourceChange, SourceControl};

/// Domain separator mixed into every bucket id.
const BUCKET_DOMAIN: &[u8] = b"strata.bucket.v1";

/// Derive a bucket id from a normalized tag and a content hash.
pub fn bucket_hash(tag: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(BUCKET_DOMAIN);
    hasher.update(b"\0");
    hasher.update(normalize_key(tag).as_bytes());
    hasher.update(b"\0");
    hasher.update(content_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// The buckets computed in one fingerprinting pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSet {
    pub baseline: String,
    buckets: Vec<BucketId>,
}

impl BucketSet {
    pub fn new(baseline: impl Into<String>, buckets: Vec<BucketId>) -> Self {
        Self {
            baseline: baseline.into(),
            buckets,
        }
    }

    /// Module buckets only; the root bucket is filtered out.
    pub fn get_buckets(&self) -> Vec<BucketId> {
        self.buckets.iter().filter(|b| !b.is_root).cloned().collect()
    }

    /// Every bucket including the root.
    pub fn all(&self) -> &[BucketId] {
        &self.buckets
    }

    /// Bucket for `tag`, compared case-insensitively.
    pub fn find(&self, tag: &str) -> Option<&BucketId> {
        let wanted = normalize_key(tag);
        self.buckets
            .iter()
            .find(|b| !b.is_root && b.normalized_tag() == wanted)
    }

    /// Tags of module buckets left unhashed.
    pub fn dirty_tags(&self) -> Vec<&str> {
        self.buckets
            .iter()
            .filter(|b| b.is_dirty())
            .map(|b| b.tag.as_str())
            .collect()
    }
}

/// Computes [`BucketSet`]s from source-control metadata.
pub struct BucketFingerprinter<'a> {
    source: &'a dyn SourceControl,
}

impl<'a> BucketFingerprinter<'a> {
    pub fn new(source: &'a dyn SourceControl) -> Self {
        Self { source }
    }

    /// Fingerprint `module_dirs` at `baseline`.
    ///
    /// `changes` are the unresolved (pending) changes relative to the
    /// baseline; any module owning one of them is left dirty. Changes outside
    /// every module only touch the root bucket.
    pub fn compute_buckets(
        &self,
        baseline: &str,
        changes: &[SourceChange],
        module_dirs: &[String],
    ) -> Result<BucketSet> {
        let mut seen = HashSet::new();
        for dir in module_dirs {
            if !seen.insert(normalize_key(dir)) {
                return Err(ConfigError::DuplicateBucketTag { tag: dir.clone() }.into());
            }
        }

        let dirty: HashSet<String> = changes
            .iter()
            .filter_map(|c| owning_module(&c.full_path, module_dirs))
            .map(|dir| normalize_key(dir))
            .collect();

        let mut buckets = Vec::with_capacity(module_dirs.len() + 1);
        for dir in module_dirs {
            if dirty.contains(&normalize_key(dir)) {
                debug!(module = %dir, "pending changes, leaving bucket unhashed");
                buckets.push(BucketId::dirty(dir.clone()));
                continue;
            }
            match self.source.content_hash(dir, baseline)? {
                Some(content) => buckets.push(BucketId::module(dir.clone(), bucket_hash(dir, &content))),
                None => {
                    debug!(module = %dir, baseline = %baseline, "no content at baseline, leaving bucket unhashed");
                    buckets.push(BucketId::dirty(dir.clone()));
                }
            }
        }
        buckets.push(BucketId::root());

        Ok(BucketSet::new(baseline, buckets))
    }
}

/// The most specific module directory containing `path`.
pub fn owning_module<'m>(path: &str, module_dirs: &'m [String]) -> Option<&'m String> {
    let path = normalize_key(path);
    module_dirs
        .iter()
        .filter(|dir| {
            let dir = normalize_key(dir);
            dir == "." || path == dir || path.starts_with(&format!("{dir}/"))
        })
        .max_by_key(|dir| normalize_key(dir).len())
}
