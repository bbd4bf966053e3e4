//! End-to-end builds over a temporary tree: cache hits, forced dependents,
//! bypass modes, failure propagation and resume.

use std::path::Path;
use std::sync::{Arc, Mutex};

use strata_core::{
    BuildConfig, BuildCoordinator, BuildOutcome, BuildSummary, ChangesToConsider,
    ComponentRegistry, DependencyNode, FnModuleBuilder, FsSourceControl, ModuleBuilder,
    ModuleManifest, ProjectOutputSnapshot, SharedContext, StateStore, StrataError,
};
use strata_state::MemoryStateStore;
use tokio::sync::watch;

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn make_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for module in ["Core", "Web", "Cli"] {
        write(dir.path(), &format!("src/{module}/{module}.proj"), "<Project/>");
        write(dir.path(), &format!("src/{module}/lib.txt"), &format!("{module} v1"));
    }
    dir
}

fn manifest() -> ModuleManifest {
    ModuleManifest::new(vec![
        DependencyNode::third_party("Json", "13.0"),
        DependencyNode::first_party("Core", "src/Core").depends_on(&["Json"]),
        DependencyNode::first_party("Web", "src/Web").depends_on(&["Core"]),
        DependencyNode::first_party("Cli", "src/Cli"),
    ])
    .unwrap()
}

fn config(root: &Path) -> BuildConfig {
    BuildConfig {
        root: root.to_path_buf(),
        max_parallelism: 2,
        ..BuildConfig::default()
    }
}

/// Builder that logs every module it is asked to build and fails the
/// modules named in `failing`.
fn recording_builder(
    log: Arc<Mutex<Vec<String>>>,
    failing: &'static [&'static str],
) -> Arc<dyn ModuleBuilder> {
    Arc::new(FnModuleBuilder::new(move |module: strata_core::PlannedModule| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(module.name.clone());
            if failing.contains(&module.name.as_str()) {
                return Ok(BuildOutcome::failed("boom"));
            }
            let outputs = module
                .project_files
                .iter()
                .map(|p| ProjectOutputSnapshot::new(p.clone(), format!("guid-{}", module.name), module.directory.clone()))
                .collect();
            Ok(BuildOutcome::succeeded(outputs))
        }
    }))
}

struct Harness {
    store: Arc<MemoryStateStore>,
    log: Arc<Mutex<Vec<String>>>,
    _cancel: watch::Sender<bool>,
    cancel: watch::Receiver<bool>,
}

impl Harness {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            store: Arc::new(MemoryStateStore::new()),
            log: Arc::new(Mutex::new(Vec::new())),
            _cancel: tx,
            cancel: rx,
        }
    }

    fn coordinator(&self, config: BuildConfig, failing: &'static [&'static str]) -> BuildCoordinator {
        let registry = ComponentRegistry::with_components(
            Arc::new(FsSourceControl::new(config.root.clone())),
            Arc::clone(&self.store) as Arc<dyn StateStore>,
        );
        BuildCoordinator::new(
            config,
            manifest(),
            registry,
            SharedContext::default(),
            recording_builder(Arc::clone(&self.log), failing),
            self.cancel.clone(),
        )
    }

    async fn run(&self, config: BuildConfig) -> BuildSummary {
        self.coordinator(config, &[]).run().await.unwrap()
    }

    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}

#[tokio::test]
async fn first_build_rebuilds_everything_and_records_state() {
    let tree = make_tree();
    let h = Harness::new();

    let summary = h.run(config(tree.path())).await;
    assert!(summary.success());
    assert_eq!(summary.rebuilt, 3);
    assert_eq!(summary.cached, 0);
    assert_eq!(summary.state_files_written, 3);
    assert_eq!(summary.waves, 2);

    let log = h.take_log();
    let core = log.iter().position(|m| m == "Core").unwrap();
    let web = log.iter().position(|m| m == "Web").unwrap();
    assert!(core < web, "Core must build before Web: {log:?}");

    let mut tags = h.store.list_tags().unwrap();
    tags.sort();
    assert_eq!(tags.len(), 3);
}

#[tokio::test]
async fn unchanged_tree_is_served_from_cache() {
    let tree = make_tree();
    let h = Harness::new();
    h.run(config(tree.path())).await;
    h.take_log();

    let coordinator = h.coordinator(config(tree.path()), &[]);
    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.rebuilt, 0);
    assert_eq!(summary.cached, 3);
    assert_eq!(summary.state_files_written, 0);
    assert!(h.take_log().is_empty(), "cache hits must not invoke the builder");

    let stored = h.store.candidates("src/Core").unwrap();
    let stored = stored.into_iter().next().unwrap().unwrap();
    let ctx = coordinator.shared_context().snapshot().await;
    let seeded: Vec<ProjectOutputSnapshot> = ctx
        .all_project_outputs()
        .into_iter()
        .filter(|s| s.tag == "src/Core")
        .collect();
    assert_eq!(seeded, stored.outputs);
}

#[tokio::test]
async fn outputs_written_into_module_dirs_keep_the_cache_warm() {
    let tree = make_tree();
    let h = Harness::new();
    let root = tree.path().to_path_buf();
    let builds = Arc::new(Mutex::new(0usize));

    let coordinator = |builds: Arc<Mutex<usize>>| {
        let root = root.clone();
        let builder_root = root.clone();
        let builder: Arc<dyn ModuleBuilder> = Arc::new(FnModuleBuilder::new(move |module: strata_core::PlannedModule| {
            let root = builder_root.clone();
            let builds = Arc::clone(&builds);
            async move {
                *builds.lock().unwrap() += 1;
                let bin = root.join(&module.directory).join("bin");
                std::fs::create_dir_all(&bin)?;
                std::fs::write(bin.join(format!("{}.dll", module.name)), "binary")?;
                let outputs = module
                    .project_files
                    .iter()
                    .map(|p| ProjectOutputSnapshot::new(p.clone(), "guid", module.directory.clone()))
                    .collect();
                Ok::<_, StrataError>(BuildOutcome::succeeded(outputs))
            }
        }));
        BuildCoordinator::new(
            config(&root),
            manifest(),
            ComponentRegistry::with_components(
                Arc::new(FsSourceControl::new(root.clone())),
                Arc::clone(&h.store) as Arc<dyn StateStore>,
            ),
            SharedContext::default(),
            builder,
            h.cancel.clone(),
        )
    };

    let first = coordinator(Arc::clone(&builds)).run().await.unwrap();
    assert_eq!(first.rebuilt, 3);
    assert!(tree.path().join("src/Core/bin/Core.dll").is_file());

    let second = coordinator(Arc::clone(&builds)).run().await.unwrap();
    assert_eq!(second.cached, 3, "bin/ output must not change bucket ids");
    assert_eq!(second.rebuilt, 0);
    assert_eq!(*builds.lock().unwrap(), 3);
}

#[tokio::test]
async fn changed_module_rebuilds_with_its_dependents() {
    let tree = make_tree();
    let h = Harness::new();
    h.run(config(tree.path())).await;
    h.take_log();

    write(tree.path(), "src/Core/lib.txt", "Core v2");
    let coordinator = h.coordinator(config(tree.path()), &[]);
    let outcome = coordinator.plan().await.unwrap();
    assert_eq!(outcome.plan.waves.len(), 2);
    assert_eq!(outcome.plan.waves[0].names(), vec!["Core"]);
    assert_eq!(outcome.plan.waves[1].names(), vec!["Web"]);
    assert_eq!(outcome.plan.forced_by_dependency, vec!["Web"]);
    assert_eq!(outcome.plan.cache_hits, vec!["Cli"]);
    let fetched: Vec<&str> = outcome
        .plan
        .dependencies_to_fetch
        .iter()
        .map(|d| d.name.as_str())
        .collect();
    assert_eq!(fetched, vec!["Json"]);

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.rebuilt, 2);
    assert_eq!(summary.cached, 1);
    assert_eq!(h.take_log(), vec!["Core", "Web"]);
    assert_eq!(h.store.candidates("src/Core").unwrap().len(), 2);
}

#[tokio::test]
async fn edited_content_never_hits_a_stale_record() {
    let tree = make_tree();
    let h = Harness::new();
    h.run(config(tree.path())).await;

    write(tree.path(), "src/Cli/extra.txt", "new file");
    let outcome = h.coordinator(config(tree.path()), &[]).plan().await.unwrap();
    assert!(outcome.cache.matched_for("src/Cli").is_none());
    assert!(outcome.cache.is_unassigned("src/Cli"));
    assert!(outcome.cache.matched_for("src/Core").is_some());
}

#[tokio::test]
async fn change_mode_bypasses_the_cache() {
    let tree = make_tree();
    let h = Harness::new();
    h.run(config(tree.path())).await;
    h.take_log();

    let mut cfg = config(tree.path());
    cfg.changes_to_consider = ChangesToConsider::PendingChanges;
    let summary = h.run(cfg).await;
    assert_eq!(summary.cached, 0);
    assert_eq!(summary.rebuilt, 3);
    assert!(summary.bypass.is_some());
    assert_eq!(h.take_log().len(), 3);
}

#[tokio::test]
async fn build_all_bypasses_the_cache() {
    let tree = make_tree();
    let h = Harness::new();
    h.run(config(tree.path())).await;

    let mut cfg = config(tree.path());
    cfg.switches.build_all = true;
    let summary = h.run(cfg).await;
    assert_eq!(summary.rebuilt, 3);
}

#[tokio::test]
async fn failure_blocks_dependents_but_not_independent_modules() {
    let tree = make_tree();
    let h = Harness::new();

    let summary = h
        .coordinator(config(tree.path()), &["Core"])
        .run()
        .await
        .unwrap();
    assert!(!summary.success());
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.rebuilt, 1);
    assert_eq!(summary.state_files_written, 1);

    let failed: Vec<&str> = summary.report.failed.iter().map(|(m, _)| m.as_str()).collect();
    assert!(failed.contains(&"Core"));
    assert!(failed.contains(&"Web"));
    assert!(!h.take_log().contains(&"Web".to_string()), "Web must not start");
    assert_eq!(h.store.list_tags().unwrap(), vec!["src/Cli".to_string()]);
}

#[tokio::test]
async fn dry_run_executes_nothing_and_persists_no_plan() {
    let tree = make_tree();
    let h = Harness::new();
    let mut cfg = config(tree.path());
    cfg.switches.dry_run = true;
    let plan_path = cfg.resolve(&cfg.plan_path);

    let summary = h.run(cfg).await;
    assert!(summary.dry_run);
    assert!(h.take_log().is_empty());
    assert!(h.store.is_empty());
    assert!(!plan_path.exists());
}

#[tokio::test]
async fn resume_reuses_the_saved_plan() {
    let tree = make_tree();
    let h = Harness::new();

    let first = h.coordinator(config(tree.path()), &[]).plan().await.unwrap();

    // Content changes after planning do not alter a resumed plan.
    write(tree.path(), "src/Cli/lib.txt", "Cli v2");
    let mut cfg = config(tree.path());
    cfg.switches.resume = true;
    let resumed = h.coordinator(cfg.clone(), &[]).plan().await.unwrap();
    assert_eq!(resumed.plan.build_id, first.plan.build_id);
    assert_eq!(resumed.plan.waves, first.plan.waves);
    assert_eq!(resumed.plan.cache_hits, first.plan.cache_hits);

    let again = h.coordinator(cfg, &[]).plan().await.unwrap();
    assert_eq!(again.plan.waves, resumed.plan.waves);
}

#[tokio::test]
async fn resume_rejects_a_plan_whose_cache_hits_changed() {
    let tree = make_tree();
    let h = Harness::new();
    h.run(config(tree.path())).await;

    write(tree.path(), "src/Core/lib.txt", "Core v2");
    let planned = h.coordinator(config(tree.path()), &[]).plan().await.unwrap();
    assert_eq!(planned.plan.cache_hits, vec!["Cli"]);
    h.take_log();

    write(tree.path(), "src/Cli/lib.txt", "Cli v2");
    let mut cfg = config(tree.path());
    cfg.switches.resume = true;
    let err = h.coordinator(cfg, &[]).run().await.unwrap_err();
    match err {
        StrataError::PlanFile(message) => assert!(message.contains("Cli"), "{message}"),
        other => panic!("expected a stale plan error, got {other:?}"),
    }
    assert!(h.take_log().is_empty(), "nothing may build from a stale plan");
}

#[tokio::test]
async fn resumed_cache_hits_are_seeded_into_the_context() {
    let tree = make_tree();
    let h = Harness::new();
    h.run(config(tree.path())).await;

    write(tree.path(), "src/Core/lib.txt", "Core v2");
    h.coordinator(config(tree.path()), &[]).plan().await.unwrap();
    h.take_log();

    let mut cfg = config(tree.path());
    cfg.switches.resume = true;
    let coordinator = h.coordinator(cfg, &[]);
    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.cached, 1);
    assert_eq!(h.take_log(), vec!["Core", "Web"]);

    let ctx = coordinator.shared_context().snapshot().await;
    let tags: Vec<String> = ctx.all_project_outputs().into_iter().map(|s| s.tag).collect();
    assert!(tags.contains(&"src/Cli".to_string()), "{tags:?}");
    assert_eq!(tags.len(), 3);
}

#[tokio::test]
async fn resume_and_clean_are_exclusive() {
    let tree = make_tree();
    let h = Harness::new();
    let mut cfg = config(tree.path());
    cfg.switches.resume = true;
    cfg.switches.clean = true;
    let err = h.coordinator(cfg, &[]).plan().await.unwrap_err();
    assert!(err.is_fatal_config());
}

#[tokio::test]
async fn clean_discards_the_previous_plan() {
    let tree = make_tree();
    let h = Harness::new();
    h.coordinator(config(tree.path()), &[]).plan().await.unwrap();

    let mut cfg = config(tree.path());
    cfg.switches.clean = true;
    cfg.switches.dry_run = true;
    let plan_path = cfg.resolve(&cfg.plan_path);
    h.coordinator(cfg, &[]).plan().await.unwrap();
    assert!(!plan_path.exists());

    let mut cfg = config(tree.path());
    cfg.switches.resume = true;
    let err = h.coordinator(cfg, &[]).plan().await.unwrap_err();
    assert!(matches!(err, StrataError::PlanFile(_)));
}

#[tokio::test]
async fn fingerprints_are_deterministic() {
    let tree = make_tree();
    let h = Harness::new();
    let coordinator = h.coordinator(config(tree.path()), &[]);
    let (a, _) = coordinator.compute_buckets().unwrap();
    let (b, _) = coordinator.compute_buckets().unwrap();
    assert_eq!(a, b);
    assert!(a.dirty_tags().is_empty());
}

#[tokio::test]
async fn context_checkpoint_is_written_after_a_build() {
    let tree = make_tree();
    let h = Harness::new();
    let cfg = config(tree.path());
    let checkpoint = cfg.resolve(&cfg.context_path);
    let coordinator = h.coordinator(cfg, &[]);
    let summary = coordinator.run().await.unwrap();

    let saved = strata_core::BuildOperationContext::load(&checkpoint).unwrap();
    assert_eq!(saved.build_metadata.build_id, summary.build_id);
    assert_eq!(saved.all_project_outputs().len(), 3);
    assert_eq!(saved.get_variable("plan", "wave_count"), Some("2"));
}
