//! Trait contract tests for StateStore.
//!
//! Every conforming implementation must pass these; they run against both
//! the in-memory fake and the filesystem store.

use strata_state::*;

fn state(tag: &str, id: &str, files: &[&str]) -> BuildStateFile {
    let mut snap = ProjectOutputSnapshot::new(format!("{tag}/module.proj"), "guid-1", tag);
    snap.files_written = files.iter().map(|f| f.to_string()).collect();
    BuildStateFile::new(BucketId::module(tag, id), vec![snap])
}

fn contract_round_trip(store: &dyn StateStore) {
    store.write(&state("libs/Shared", "0001", &["a.dll"])).unwrap();
    let found: Vec<_> = store
        .candidates("libs/shared")
        .unwrap()
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].outputs[0].files_written, vec!["a.dll"]);
    assert!(!found[0].location.is_empty());
}

fn contract_tag_isolation(store: &dyn StateStore) {
    store.write(&state("libs/A", "0002", &[])).unwrap();
    store.write(&state("libs/B", "0003", &[])).unwrap();
    let a = store.candidates("libs/A").unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(
        a[0].as_ref().unwrap().bucket.id.as_deref(),
        Some("0002"),
        "lookup for A must not see B"
    );
}

fn contract_multiple_ids_per_tag(store: &dyn StateStore) {
    store.write(&state("apps/Web", "0004", &[])).unwrap();
    store.write(&state("apps/Web", "0005", &[])).unwrap();
    let ids: Vec<String> = store
        .candidates("apps/web")
        .unwrap()
        .into_iter()
        .filter_map(|c| c.ok())
        .filter_map(|f| f.bucket.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"0004".to_string()));
    assert!(ids.contains(&"0005".to_string()));
}

fn contract_rejects_dirty(store: &dyn StateStore) {
    let dirty = BuildStateFile::new(BucketId::dirty("apps/Dirty"), vec![]);
    assert!(matches!(
        store.write(&dirty),
        Err(StateError::UnhashedBucket { .. })
    ));
    assert!(store.candidates("apps/Dirty").unwrap().is_empty());
}

fn contract_remove(store: &dyn StateStore) {
    store.write(&state("tools/Gen", "0006", &[])).unwrap();
    assert_eq!(store.remove_tag("TOOLS/gen").unwrap(), 1);
    assert!(store.candidates("tools/Gen").unwrap().is_empty());
    assert_eq!(store.remove_tag("tools/Gen").unwrap(), 0);
}

fn run_all(store: &dyn StateStore) {
    contract_round_trip(store);
    contract_tag_isolation(store);
    contract_multiple_ids_per_tag(store);
    contract_rejects_dirty(store);
    contract_remove(store);
}

#[test]
fn memory_store_satisfies_contract() {
    run_all(&MemoryStateStore::new());
}

#[test]
fn fs_store_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStateStore::new(dir.path()).unwrap();
    run_all(&store);
}

#[test]
fn fs_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FsStateStore::new(dir.path()).unwrap();
        store.write(&state("libs/Persist", "0007", &["p.bin"])).unwrap();
    }
    let reopened = FsStateStore::new(dir.path()).unwrap();
    let found = reopened.candidates("libs/Persist").unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].is_ok());
}

#[test]
fn memory_store_reports_injected_corruption() {
    let store = MemoryStateStore::new();
    store.insert_corrupt("libs/Broken", "zz", "truncated");
    let found = store.candidates("libs/Broken").unwrap();
    assert_eq!(found.len(), 1);
    assert!(matches!(found[0], Err(StateError::Corrupt { .. })));
    assert!(store.is_empty());
}
