//! Double-write detection for planned file copies.
//!
//! Destinations are grouped by normalized path before any copy runs; a group
//! with more than one distinct source aborts the whole batch with a listing
//! of every offending destination and its sources.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strata_state::normalize_key;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{DoubleWriteConflict, DoubleWriteError, Result, StrataError};
use crate::obs;

/// One planned copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSpec {
    pub source: String,
    pub destination: String,
}

impl PathSpec {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// Fail if any destination is targeted by more than one distinct source.
///
/// Conflicts are sorted by destination; sources keep their input order.
pub fn check_double_writes(specs: &[PathSpec]) -> std::result::Result<(), DoubleWriteError> {
    // normalized destination → (first spelling, distinct sources)
    let mut groups: BTreeMap<String, (String, Vec<String>)> = BTreeMap::new();
    for spec in specs {
        let (_, sources) = groups
            .entry(normalize_key(&spec.destination))
            .or_insert_with(|| (spec.destination.clone(), Vec::new()));
        let normalized = normalize_key(&spec.source);
        if !sources.iter().any(|s| normalize_key(s) == normalized) {
            sources.push(spec.source.clone());
        }
    }

    let conflicts: Vec<DoubleWriteConflict> = groups
        .into_values()
        .filter(|(_, sources)| sources.len() > 1)
        .map(|(destination, sources)| DoubleWriteConflict {
            destination,
            sources,
        })
        .collect();

    if conflicts.is_empty() {
        return Ok(());
    }
    for c in &conflicts {
        obs::emit_double_write(&c.destination, &c.sources);
    }
    Err(DoubleWriteError::Destinations { conflicts })
}

/// Check `specs` for double writes, then copy each source to its
/// destination, creating parent directories. Cancellation is observed
/// before every copy. Returns the number of files copied.
pub async fn copy_batch(specs: &[PathSpec], cancel: &watch::Receiver<bool>) -> Result<usize> {
    check_double_writes(specs)?;

    let mut copied = 0;
    for spec in specs {
        let cancelled = *cancel.borrow();
        if cancelled {
            return Err(StrataError::Cancelled);
        }
        let dest = PathBuf::from(&spec.destination);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&spec.source, &dest).await?;
        debug!(source = %spec.source, destination = %spec.destination, "copied");
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_sources_one_destination_is_reported() {
        let err = check_double_writes(&[PathSpec::new("a", "x"), PathSpec::new("b", "x")]).unwrap_err();
        match err {
            DoubleWriteError::Destinations { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].destination, "x");
                assert_eq!(conflicts[0].sources, vec!["a", "b"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn distinct_destinations_pass() {
        check_double_writes(&[PathSpec::new("a", "x"), PathSpec::new("b", "y")]).unwrap();
    }

    #[test]
    fn destinations_compare_normalized() {
        let err = check_double_writes(&[
            PathSpec::new("a", "out\\Bin\\app.dll"),
            PathSpec::new("b", "out/bin/APP.dll"),
            PathSpec::new("c", "out/other.dll"),
            PathSpec::new("d", "out/other.dll"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("2 destination"));
        assert!(msg.contains("a, b"));
        assert!(msg.contains("c, d"));
    }

    #[test]
    fn same_source_twice_is_not_a_conflict() {
        check_double_writes(&[PathSpec::new("a", "x"), PathSpec::new("./a", "x")]).unwrap();
    }

    #[tokio::test]
    async fn copy_batch_copies_after_check() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, "payload").unwrap();
        let dest = dir.path().join("out/nested/dest.txt");
        let (_tx, rx) = watch::channel(false);

        let n = copy_batch(
            &[PathSpec::new(src.display().to_string(), dest.display().to_string())],
            &rx,
        )
        .await
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "payload");
    }

    #[tokio::test]
    async fn copy_batch_refuses_conflicts_before_copying() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, "a").unwrap();
        let dest = dir.path().join("x");
        let (_tx, rx) = watch::channel(false);
        let specs = vec![
            PathSpec::new(a.display().to_string(), dest.display().to_string()),
            PathSpec::new("b", dest.display().to_string()),
        ];
        let err = copy_batch(&specs, &rx).await.unwrap_err();
        assert!(matches!(err, StrataError::DoubleWrite(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn copy_batch_observes_cancellation() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = copy_batch(&[PathSpec::new("a", "b")], &rx).await.unwrap_err();
        assert!(matches!(err, StrataError::Cancelled));
    }
}
