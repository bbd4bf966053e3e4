//! In-memory fake for [`StateStore`] (testing and dry runs)
//!
//! Satisfies the trait contract without touching the filesystem. Corrupt
//! records can be injected to exercise cache-miss downgrades.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{StateError, StateResult};
use crate::schema::{normalize_key, BuildStateFile};
use crate::store::{Candidates, StateStore};

#[derive(Debug, Clone)]
enum Entry {
    Valid(BuildStateFile),
    Corrupt(String),
}

/// In-memory state store backed by `HashMap<normalized tag, records>`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, BTreeMap<String, Entry>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<String, Entry>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a record that will fail to decode on lookup.
    pub fn insert_corrupt(&self, tag: &str, key: &str, reason: &str) {
        self.records()
            .entry(normalize_key(tag))
            .or_default()
            .insert(key.to_string(), Entry::Corrupt(reason.to_string()));
    }

    /// Number of valid records across all tags.
    pub fn len(&self) -> usize {
        self.records()
            .values()
            .flat_map(|m| m.values())
            .filter(|e| matches!(e, Entry::Valid(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn candidates(&self, tag: &str) -> StateResult<Candidates> {
        let records = self.records();
        let Some(entries) = records.get(&normalize_key(tag)) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .map(|(key, entry)| match entry {
                Entry::Valid(file) => Ok(file.clone()),
                Entry::Corrupt(reason) => Err(StateError::Corrupt {
                    location: format!("mem://{tag}/{key}"),
                    reason: reason.clone(),
                }),
            })
            .collect())
    }

    fn write(&self, file: &BuildStateFile) -> StateResult<String> {
        let id = file.persisted_id()?.to_string();
        let tag = file.bucket.normalized_tag();
        let location = format!("mem://{tag}/{id}");
        let mut records = self.records();
        let entries = records.entry(tag).or_default();
        if !entries.contains_key(&id) {
            let mut stored = file.clone();
            stored.location = location.clone();
            entries.insert(id, Entry::Valid(stored));
        }
        Ok(location)
    }

    fn list_tags(&self) -> StateResult<Vec<String>> {
        let mut tags: Vec<String> = self
            .records()
            .values()
            .filter_map(|m| {
                m.values().find_map(|e| match e {
                    Entry::Valid(f) => Some(f.bucket.tag.clone()),
                    Entry::Corrupt(_) => None,
                })
            })
            .collect();
        tags.sort();
        Ok(tags)
    }

    fn remove_tag(&self, tag: &str) -> StateResult<usize> {
        Ok(self
            .records()
            .remove(&normalize_key(tag))
            .map(|m| m.len())
            .unwrap_or(0))
    }
}
