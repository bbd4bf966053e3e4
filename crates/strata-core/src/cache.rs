//! Cache classification: match current buckets against stored state files.
//!
//! A bucket whose id equals a stored record's id is a cache hit and its
//! recorded outputs are trusted as-is. Everything else is unassigned and goes
//! into the build. Unreadable or corrupt records are logged and treated as
//! misses; nothing in this module aborts a build.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_state::{normalize_key, BucketId, BuildStateFile, StateStore};
use tracing::{debug, warn};

use crate::config::{BuildConfig, ChangesToConsider};
use crate::obs;

/// Why caching was bypassed for this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    /// A change-consideration mode was explicitly requested.
    ChangeMode(ChangesToConsider),
    PendingChanges,
    PullRequest,
    BuildAll,
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassReason::ChangeMode(mode) => write!(f, "changes_to_consider={mode}"),
            BypassReason::PendingChanges => f.write_str("pending_changes"),
            BypassReason::PullRequest => f.write_str("pull_request"),
            BypassReason::BuildAll => f.write_str("build_all"),
        }
    }
}

/// Inputs that decide whether the cache may be consulted at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    pub changes_to_consider: ChangesToConsider,
    pub has_pending_changes: bool,
    pub is_pull_request: bool,
    pub build_all: bool,
}

impl CachePolicy {
    pub fn from_config(config: &BuildConfig, has_pending_changes: bool) -> Self {
        Self {
            changes_to_consider: config.changes_to_consider,
            has_pending_changes,
            is_pull_request: config.is_pull_request,
            build_all: config.switches.build_all,
        }
    }

    /// `Some` when every module must be treated as unassigned.
    pub fn bypass_reason(&self) -> Option<BypassReason> {
        if self.changes_to_consider != ChangesToConsider::None {
            Some(BypassReason::ChangeMode(self.changes_to_consider))
        } else if self.build_all {
            Some(BypassReason::BuildAll)
        } else if self.is_pull_request {
            Some(BypassReason::PullRequest)
        } else if self.has_pending_changes {
            Some(BypassReason::PendingChanges)
        } else {
            None
        }
    }
}

/// Outcome of a cache query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheQuery {
    pub matched: Vec<BuildStateFile>,
    pub unassigned: Vec<BucketId>,
    pub bypass: Option<BypassReason>,
}

impl CacheQuery {
    /// Matched record for `tag`, compared case-insensitively.
    pub fn matched_for(&self, tag: &str) -> Option<&BuildStateFile> {
        let wanted = normalize_key(tag);
        self.matched
            .iter()
            .find(|f| f.bucket.normalized_tag() == wanted)
    }

    pub fn is_unassigned(&self, tag: &str) -> bool {
        let wanted = normalize_key(tag);
        self.unassigned.iter().any(|b| b.normalized_tag() == wanted)
    }
}

/// Coordinator-owned memo of per-tag state lookups.
///
/// Constructed once per build and passed to whoever needs it; each tag is
/// read from the store at most once.
pub struct StateCache<'a> {
    store: &'a dyn StateStore,
    resolved: HashMap<String, Option<BuildStateFile>>,
}

impl<'a> StateCache<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self {
            store,
            resolved: HashMap::new(),
        }
    }

    /// Newest readable record for `bucket`'s tag whose id matches exactly.
    pub fn lookup(&mut self, bucket: &BucketId) -> Option<BuildStateFile> {
        let id = bucket.id.as_deref()?;
        let key = format!("{}\0{}", bucket.normalized_tag(), id);
        if let Some(hit) = self.resolved.get(&key) {
            return hit.clone();
        }

        let candidates = match self.store.candidates(&bucket.tag) {
            Ok(c) => c,
            Err(e) => {
                warn!(tag = %bucket.tag, error = %e, "state lookup failed, treating as cache miss");
                self.resolved.insert(key, None);
                return None;
            }
        };

        let mut best: Option<BuildStateFile> = None;
        for candidate in candidates {
            match candidate {
                Ok(file) if file.bucket.id.as_deref() == Some(id) => {
                    // Last write wins when several records share the id.
                    if best.as_ref().map_or(true, |b| file.written_at > b.written_at) {
                        best = Some(file);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(tag = %bucket.tag, error = %e, "unreadable state file, ignoring");
                }
            }
        }

        self.resolved.insert(key, best.clone());
        best
    }

    /// Classify `buckets` into cache hits and unassigned modules.
    pub fn query_cache_for_buckets(
        &mut self,
        buckets: &[BucketId],
        policy: &CachePolicy,
    ) -> CacheQuery {
        let modules: Vec<&BucketId> = buckets.iter().filter(|b| !b.is_root).collect();

        if let Some(reason) = policy.bypass_reason() {
            debug!(reason = %reason, "cache bypassed, every module is unassigned");
            let query = CacheQuery {
                matched: Vec::new(),
                unassigned: modules.into_iter().cloned().collect(),
                bypass: Some(reason),
            };
            obs::emit_cache_classified(0, query.unassigned.len(), Some(&reason.to_string()));
            return query;
        }

        let mut query = CacheQuery::default();
        for bucket in modules {
            match self.lookup(bucket) {
                Some(file) => {
                    debug!(bucket = %bucket, location = %file.location, "cache hit");
                    query.matched.push(file);
                }
                None => query.unassigned.push(bucket.clone()),
            }
        }
        obs::emit_cache_classified(query.matched.len(), query.unassigned.len(), None);
        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use strata_state::{MemoryStateStore, ProjectOutputSnapshot};

    fn stored(tag: &str, id: &str, project: &str) -> BuildStateFile {
        BuildStateFile::new(
            BucketId::module(tag, id),
            vec![ProjectOutputSnapshot::new(project, "g", tag)],
        )
    }

    #[test]
    fn exact_id_match_is_a_hit() {
        let store = MemoryStateStore::new();
        store.write(&stored("src/Core", "aa", "Core.proj")).unwrap();
        let mut cache = StateCache::new(&store);

        let buckets = vec![
            BucketId::module("SRC/core", "aa"),
            BucketId::module("src/Web", "bb"),
            BucketId::root(),
        ];
        let q = cache.query_cache_for_buckets(&buckets, &CachePolicy::default());
        assert_eq!(q.matched.len(), 1);
        assert_eq!(q.unassigned, vec![BucketId::module("src/Web", "bb")]);
        assert!(q.matched_for("src/core").is_some());
        assert!(q.is_unassigned("src/web"));
    }

    #[test]
    fn different_id_same_tag_is_a_miss() {
        let store = MemoryStateStore::new();
        store.write(&stored("src/Core", "old", "Core.proj")).unwrap();
        let mut cache = StateCache::new(&store);
        let q = cache.query_cache_for_buckets(
            &[BucketId::module("src/Core", "new")],
            &CachePolicy::default(),
        );
        assert!(q.matched.is_empty());
        assert_eq!(q.unassigned.len(), 1);
    }

    #[test]
    fn dirty_bucket_is_never_a_hit() {
        let store = MemoryStateStore::new();
        let mut cache = StateCache::new(&store);
        let q = cache.query_cache_for_buckets(&[BucketId::dirty("src/Core")], &CachePolicy::default());
        assert_eq!(q.unassigned, vec![BucketId::dirty("src/Core")]);
    }

    #[test]
    fn corrupt_records_downgrade_to_miss() {
        let store = MemoryStateStore::new();
        store.insert_corrupt("src/Core", "aa", "truncated");
        let mut cache = StateCache::new(&store);
        let q = cache.query_cache_for_buckets(
            &[BucketId::module("src/Core", "aa")],
            &CachePolicy::default(),
        );
        assert!(q.matched.is_empty());
        assert_eq!(q.unassigned.len(), 1);
    }

    #[test]
    fn explicit_change_mode_bypasses_cache_even_without_changes() {
        let store = MemoryStateStore::new();
        store.write(&stored("src/Core", "aa", "Core.proj")).unwrap();
        let mut cache = StateCache::new(&store);
        let policy = CachePolicy {
            changes_to_consider: ChangesToConsider::PendingChanges,
            has_pending_changes: false,
            ..CachePolicy::default()
        };
        let q = cache.query_cache_for_buckets(&[BucketId::module("src/Core", "aa")], &policy);
        assert!(q.matched.is_empty());
        assert_eq!(q.unassigned.len(), 1);
        assert_eq!(
            q.bypass,
            Some(BypassReason::ChangeMode(ChangesToConsider::PendingChanges))
        );
    }

    #[test]
    fn bypass_reasons_are_ordered() {
        let mut p = CachePolicy::default();
        assert_eq!(p.bypass_reason(), None);
        p.has_pending_changes = true;
        assert_eq!(p.bypass_reason(), Some(BypassReason::PendingChanges));
        p.is_pull_request = true;
        assert_eq!(p.bypass_reason(), Some(BypassReason::PullRequest));
        p.build_all = true;
        assert_eq!(p.bypass_reason(), Some(BypassReason::BuildAll));
    }

    /// Store that returns two records with the same id but different times.
    struct TwoWriters;

    impl StateStore for TwoWriters {
        fn candidates(&self, tag: &str) -> strata_state::StateResult<strata_state::Candidates> {
            let mut older = stored(tag, "aa", "older.proj");
            older.written_at = Utc::now() - Duration::hours(1);
            let newer = stored(tag, "aa", "newer.proj");
            Ok(vec![Ok(newer), Ok(older)])
        }
        fn write(&self, _file: &BuildStateFile) -> strata_state::StateResult<String> {
            Ok(String::new())
        }
        fn list_tags(&self) -> strata_state::StateResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn remove_tag(&self, _tag: &str) -> strata_state::StateResult<usize> {
            Ok(0)
        }
    }

    #[test]
    fn newest_record_wins_ties() {
        let store = TwoWriters;
        let mut cache = StateCache::new(&store);
        let hit = cache.lookup(&BucketId::module("src/Core", "aa")).unwrap();
        assert_eq!(hit.outputs[0].project_file, "newer.proj");
    }
}
