//! Build plan generation, persistence and resume.
//!
//! Planning is sequential and deterministic:
//! 1. build set = include ∪ unassigned bucket directories, minus excludes and
//!    exclude filters;
//! 2. cache-hit modules downstream of the build set are pulled in when
//!    `rebuild_dependents` is on (listed in `forced_by_dependency`);
//! 3. the dependency graph restricted to the build set is peeled into waves;
//! 4. projects and orchestration nodes are discovered per module;
//! 5. the plan is written as a versioned JSON document that `--resume` reads
//!    back verbatim.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_state::{normalize_key, BucketId};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cache::CacheQuery;
use crate::config::BuildConfig;
use crate::context::BuildOperationContext;
use crate::discovery::Discovery;
use crate::error::{ConfigError, Result, StrataError};
use crate::fingerprint::BucketSet;
use crate::graph::DependencyGraph;
use crate::manifest::{DependencyNode, ModuleManifest};
use crate::obs;
use crate::pipeline::PipelineService;
use crate::tracker::{ModuleState, ModuleTracker};

/// Format version of persisted plan files.
pub const PLAN_FORMAT_VERSION: u32 = 1;

/// Variable scope holding plan metadata.
pub const PLAN_SCOPE: &str = "plan";

/// One module scheduled for building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedModule {
    pub name: String,
    pub directory: String,
    /// Bucket at planning time; `None` if the directory was only included.
    pub bucket: Option<BucketId>,
    pub project_files: Vec<String>,
    pub orchestration_nodes: Vec<String>,
    /// Content was a cache hit; rebuilt because a dependency is rebuilt.
    #[serde(default)]
    pub forced: bool,
}

/// Modules that may build in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    pub index: usize,
    pub modules: Vec<PlannedModule>,
}

impl Wave {
    pub fn names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }
}

/// Durable, resumable execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub format_version: u32,
    pub build_id: String,
    pub created_at: DateTime<Utc>,
    pub baseline: String,
    /// Directories in wave order, then by name.
    pub directories_in_build: Vec<String>,
    pub waves: Vec<Wave>,
    pub orchestration_nodes: Vec<String>,
    /// Module names whose outputs come from stored state.
    pub cache_hits: Vec<String>,
    /// External modules to fetch instead of build.
    pub dependencies_to_fetch: Vec<DependencyNode>,
    pub forced_by_dependency: Vec<String>,
}

impl BuildPlan {
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn module_count(&self) -> usize {
        self.waves.iter().map(|w| w.modules.len()).sum()
    }

    /// Index of the wave holding `name`.
    pub fn wave_of(&self, name: &str) -> Option<usize> {
        let wanted = name.to_lowercase();
        self.waves
            .iter()
            .find(|w| w.modules.iter().any(|m| m.name.to_lowercase() == wanted))
            .map(|w| w.index)
    }

    pub fn planned(&self, name: &str) -> Option<&PlannedModule> {
        let wanted = name.to_lowercase();
        self.waves
            .iter()
            .flat_map(|w| &w.modules)
            .find(|m| m.name.to_lowercase() == wanted)
    }

    /// Tracker with cache hits and planned modules in their initial states.
    pub fn tracker(&self, manifest: &ModuleManifest) -> Result<ModuleTracker> {
        let mut tracker = ModuleTracker::new();
        for name in &self.cache_hits {
            let directory = manifest
                .find(name)
                .and_then(|m| m.directory.clone())
                .unwrap_or_default();
            tracker.track(name, &directory);
            tracker.transition(name, ModuleState::CacheHit)?;
        }
        for module in self.waves.iter().flat_map(|w| &w.modules) {
            tracker.track(&module.name, &module.directory);
            tracker.transition(&module.name, ModuleState::Unassigned)?;
            if module.forced {
                tracker.mark_forced(&module.name)?;
            }
        }
        Ok(tracker)
    }

    /// Write the plan atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let bytes = serde_json::to_vec_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), "plan written");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            StrataError::PlanFile(format!("cannot read {}: {e}", path.display()))
        })?;
        decode_plan(&bytes)
    }
}

/// Decode a plan document, rejecting unknown format versions.
pub fn decode_plan(bytes: &[u8]) -> Result<BuildPlan> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| StrataError::PlanFile(e.to_string()))?;
    let found = value.get("format_version").and_then(|v| v.as_u64());
    if found != Some(u64::from(PLAN_FORMAT_VERSION)) {
        return Err(StrataError::PlanFile(format!(
            "plan has format_version {found:?}, expected {PLAN_FORMAT_VERSION}"
        )));
    }
    serde_json::from_value(value).map_err(|e| StrataError::PlanFile(e.to_string()))
}

/// Inputs produced by fingerprinting and cache classification.
pub struct AnalysisContext<'a> {
    pub manifest: &'a ModuleManifest,
    pub graph: &'a DependencyGraph,
    pub buckets: &'a BucketSet,
    pub cache: &'a CacheQuery,
}

/// Computes and resumes [`BuildPlan`]s.
pub struct BuildPlanGenerator<'a> {
    config: &'a BuildConfig,
}

impl<'a> BuildPlanGenerator<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        Self { config }
    }

    fn is_excluded(&self, directory: &str) -> bool {
        let dir = normalize_key(directory);
        if self.config.exclude.iter().any(|e| normalize_key(e) == dir) {
            return true;
        }
        self.config.exclude_filters.iter().any(|f| {
            let filter = f.replace('\\', "/").to_lowercase();
            !filter.is_empty() && (dir.starts_with(&filter) || dir.contains(&filter))
        })
    }

    /// Plan a fresh build.
    pub async fn compute_build_plan(
        &self,
        context: &BuildOperationContext,
        analysis: &AnalysisContext<'_>,
        pipeline: &dyn PipelineService,
        orchestration: &Discovery<'_>,
    ) -> Result<BuildPlan> {
        let manifest = analysis.manifest;

        // 1. include ∪ unassigned, minus excludes
        let mut requested: Vec<String> = self.config.include.clone();
        requested.extend(analysis.cache.unassigned.iter().map(|b| b.tag.clone()));

        let mut in_build: BTreeMap<String, &DependencyNode> = BTreeMap::new();
        for dir in requested {
            if self.is_excluded(&dir) {
                debug!(directory = %dir, "excluded from build");
                continue;
            }
            let module = manifest.find_by_directory(&dir).ok_or_else(|| {
                ConfigError::ModuleNotInManifest {
                    module: dir.clone(),
                }
            })?;
            in_build.insert(module.key(), module);
        }

        // 2. dependency-forced rebuilds
        let mut forced: BTreeSet<String> = BTreeSet::new();
        if self.config.rebuild_dependents {
            let seeds: Vec<String> = in_build.values().map(|m| m.name.clone()).collect();
            for seed in seeds {
                for dependent in analysis.graph.transitive_dependents_of(&seed)? {
                    let Some(dir) = dependent.directory.as_deref() else {
                        continue;
                    };
                    if dependent.is_third_party()
                        || in_build.contains_key(&dependent.key())
                        || self.is_excluded(dir)
                        || analysis.cache.matched_for(dir).is_none()
                    {
                        continue;
                    }
                    if let Some(module) = manifest.find(&dependent.name) {
                        debug!(module = %module.name, because = %seed, "rebuild forced by dependency");
                        forced.insert(module.key());
                        in_build.insert(module.key(), module);
                    }
                }
            }
        }

        // 3. waves
        let names: Vec<String> = in_build.values().map(|m| m.name.clone()).collect();
        let wave_names = analysis.graph.waves(&names)?;

        // 4. discovery
        let mut waves = Vec::with_capacity(wave_names.len());
        let mut directories_in_build = Vec::new();
        let mut orchestration_nodes = Vec::new();
        for (index, members) in wave_names.iter().enumerate() {
            let mut modules = Vec::with_capacity(members.len());
            for name in members {
                let Some(node) = in_build.get(&name.to_lowercase()) else {
                    continue;
                };
                let directory = node.directory.clone().unwrap_or_default();
                let found = orchestration.discover(&directory)?;
                orchestration_nodes.extend(found.orchestration_nodes.iter().cloned());
                directories_in_build.push(directory.clone());
                modules.push(PlannedModule {
                    name: node.name.clone(),
                    bucket: analysis.buckets.find(&directory).cloned(),
                    directory,
                    project_files: found.project_files,
                    orchestration_nodes: found.orchestration_nodes,
                    forced: forced.contains(&node.key()),
                });
            }
            waves.push(Wave { index, modules });
        }

        let mut cache_hits: Vec<String> = manifest
            .modules
            .iter()
            .filter(|m| !m.is_third_party() && !in_build.contains_key(&m.key()))
            .filter(|m| {
                m.directory
                    .as_deref()
                    .is_some_and(|d| analysis.cache.matched_for(d).is_some())
            })
            .map(|m| m.name.clone())
            .collect();
        cache_hits.sort();

        let dependencies_to_fetch = analysis.graph.dependencies_required_for_build(
            &names,
            &names,
            self.config.fetch_mode,
        )?;

        let forced_by_dependency = forced
            .iter()
            .filter_map(|k| in_build.get(k).map(|m| m.name.clone()))
            .collect();

        let plan = BuildPlan {
            format_version: PLAN_FORMAT_VERSION,
            build_id: context.build_metadata.build_id.clone(),
            created_at: Utc::now(),
            baseline: analysis.buckets.baseline.clone(),
            directories_in_build,
            waves,
            orchestration_nodes,
            cache_hits,
            dependencies_to_fetch,
            forced_by_dependency,
        };

        obs::emit_plan_computed(plan.directories_in_build.len(), plan.waves.len(), false);
        publish_plan_variables(&plan, pipeline, false).await?;
        Ok(plan)
    }

    /// Load the plan written by an earlier run instead of re-planning.
    pub async fn resume(&self, pipeline: &dyn PipelineService) -> Result<BuildPlan> {
        let path = self.config.resolve(&self.config.plan_path);
        if !path.is_file() {
            return Err(StrataError::PlanFile(format!(
                "no plan to resume at {}",
                path.display()
            )));
        }
        let plan = BuildPlan::load(&path)?;
        info!(build_id = %plan.build_id, modules = plan.module_count(), "resuming plan");
        obs::emit_plan_computed(plan.directories_in_build.len(), plan.waves.len(), true);
        publish_plan_variables(&plan, pipeline, true).await?;
        Ok(plan)
    }
}

async fn publish_plan_variables(
    plan: &BuildPlan,
    pipeline: &dyn PipelineService,
    resumed: bool,
) -> Result<()> {
    let vars = [
        ("build_id", plan.build_id.clone()),
        ("baseline", plan.baseline.clone()),
        ("wave_count", plan.waves.len().to_string()),
        ("directories", plan.directories_in_build.join(";")),
        ("cache_hits", plan.cache_hits.join(";")),
        ("resumed", resumed.to_string()),
    ];
    for (key, value) in vars {
        pipeline.put_variable(PLAN_SCOPE, key, &value).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePolicy, StateCache};
    use crate::config::{ChangesToConsider, LayoutConfig};
    use crate::context::SharedContext;
    use strata_state::{BuildStateFile, MemoryStateStore, ProjectOutputSnapshot, StateStore};

    struct Fixture {
        dir: tempfile::TempDir,
        manifest: ModuleManifest,
        graph: DependencyGraph,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for rel in ["src/Core/Core.proj", "src/Web/Web.proj", "src/Web/tools/dirs.proj", "src/Cli/Cli.proj"] {
            let p = dir.path().join(rel);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, "x").unwrap();
        }
        let manifest = ModuleManifest::new(vec![
            DependencyNode::first_party("Core", "src/Core").depends_on(&["Json"]),
            DependencyNode::first_party("Web", "src/Web").depends_on(&["Core"]),
            DependencyNode::first_party("Cli", "src/Cli"),
            DependencyNode::third_party("Json", "13.0"),
        ])
        .unwrap();
        let graph = DependencyGraph::build(&manifest).unwrap();
        Fixture { dir, manifest, graph }
    }

    fn buckets() -> BucketSet {
        BucketSet::new(
            "base",
            vec![
                BucketId::module("src/Core", "core-new"),
                BucketId::module("src/Web", "web-1"),
                BucketId::module("src/Cli", "cli-1"),
                BucketId::root(),
            ],
        )
    }

    fn store_with_hits() -> MemoryStateStore {
        let store = MemoryStateStore::new();
        for (tag, id, proj) in [
            ("src/Core", "core-old", "src/Core/Core.proj"),
            ("src/Web", "web-1", "src/Web/Web.proj"),
            ("src/Cli", "cli-1", "src/Cli/Cli.proj"),
        ] {
            store
                .write(&BuildStateFile::new(
                    BucketId::module(tag, id),
                    vec![ProjectOutputSnapshot::new(proj, "g", tag)],
                ))
                .unwrap();
        }
        store
    }

    async fn plan_with(config: &BuildConfig, policy: CachePolicy) -> (BuildPlan, Fixture, SharedContext) {
        let fx = fixture();
        let config = BuildConfig {
            root: fx.dir.path().to_path_buf(),
            ..config.clone()
        };
        let store = store_with_hits();
        let mut cache = StateCache::new(&store);
        let buckets = buckets();
        let query = cache.query_cache_for_buckets(buckets.all(), &policy);
        let analysis = AnalysisContext {
            manifest: &fx.manifest,
            graph: &fx.graph,
            buckets: &buckets,
            cache: &query,
        };
        let layout = LayoutConfig::default();
        let discovery = Discovery::new(fx.dir.path(), &layout);
        let shared = SharedContext::default();
        let ctx = shared.snapshot().await;
        let plan = BuildPlanGenerator::new(&config)
            .compute_build_plan(&ctx, &analysis, &shared, &discovery)
            .await
            .unwrap();
        (plan, fx, shared)
    }

    #[tokio::test]
    async fn changed_core_forces_web_into_next_wave() {
        let (plan, fx, shared) = plan_with(&BuildConfig::default(), CachePolicy::default()).await;

        let waves: Vec<Vec<String>> = plan.waves.iter().map(Wave::names).collect();
        assert_eq!(waves, vec![vec!["Core"], vec!["Web"]]);
        assert_eq!(plan.forced_by_dependency, vec!["Web"]);
        assert_eq!(plan.cache_hits, vec!["Cli"]);
        assert_eq!(plan.directories_in_build, vec!["src/Core", "src/Web"]);
        assert_eq!(plan.orchestration_nodes, vec!["src/Web/tools/dirs.proj"]);
        assert_eq!(plan.dependencies_to_fetch.len(), 1);
        assert_eq!(plan.dependencies_to_fetch[0].name, "Json");
        assert!(plan.planned("web").unwrap().forced);

        let tracker = plan.tracker(&fx.manifest).unwrap();
        assert_eq!(tracker.state("Cli"), Some(ModuleState::CacheHit));
        assert_eq!(tracker.state("Web"), Some(ModuleState::Unassigned));
        assert!(tracker.get("Web").unwrap().forced);

        assert_eq!(
            shared.get_variable(PLAN_SCOPE, "wave_count").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn without_rebuild_dependents_web_stays_cached() {
        let config = BuildConfig {
            rebuild_dependents: false,
            ..BuildConfig::default()
        };
        let (plan, _fx, _) = plan_with(&config, CachePolicy::default()).await;
        assert_eq!(plan.directories_in_build, vec!["src/Core"]);
        assert_eq!(plan.cache_hits, vec!["Cli", "Web"]);
        assert!(plan.forced_by_dependency.is_empty());
    }

    #[tokio::test]
    async fn explicit_change_mode_plans_everything() {
        let config = BuildConfig::default();
        let policy = CachePolicy {
            changes_to_consider: ChangesToConsider::PendingChanges,
            ..CachePolicy::default()
        };
        let (plan, _fx, _) = plan_with(&config, policy).await;
        assert_eq!(plan.module_count(), 3);
        assert!(plan.cache_hits.is_empty());
        assert_eq!(plan.wave_of("Core"), Some(0));
        assert_eq!(plan.wave_of("Cli"), Some(0));
        assert_eq!(plan.wave_of("Web"), Some(1));
    }

    #[tokio::test]
    async fn exclude_filters_drop_directories() {
        let config = BuildConfig {
            exclude_filters: vec!["web".to_string()],
            include: vec!["src/Cli".to_string()],
            ..BuildConfig::default()
        };
        let (plan, _fx, _) = plan_with(&config, CachePolicy::default()).await;
        assert_eq!(plan.directories_in_build, vec!["src/Cli", "src/Core"]);
        assert!(plan.forced_by_dependency.is_empty());
    }

    #[tokio::test]
    async fn include_outside_manifest_is_fatal() {
        let fx = fixture();
        let config = BuildConfig {
            root: fx.dir.path().to_path_buf(),
            include: vec!["src/Ghost".to_string()],
            ..BuildConfig::default()
        };
        let store = MemoryStateStore::new();
        let mut cache = StateCache::new(&store);
        let buckets = buckets();
        let query = cache.query_cache_for_buckets(buckets.all(), &CachePolicy::default());
        let analysis = AnalysisContext {
            manifest: &fx.manifest,
            graph: &fx.graph,
            buckets: &buckets,
            cache: &query,
        };
        let layout = LayoutConfig::default();
        let discovery = Discovery::new(fx.dir.path(), &layout);
        let shared = SharedContext::default();
        let err = BuildPlanGenerator::new(&config)
            .compute_build_plan(&BuildOperationContext::default(), &analysis, &shared, &discovery)
            .await
            .unwrap_err();
        assert!(err.is_fatal_config());
    }

    #[tokio::test]
    async fn resume_reads_the_saved_plan_verbatim() {
        let (plan, fx, _) = plan_with(&BuildConfig::default(), CachePolicy::default()).await;
        let config = BuildConfig {
            root: fx.dir.path().to_path_buf(),
            ..BuildConfig::default()
        };
        plan.save(&config.resolve(&config.plan_path)).unwrap();

        let shared = SharedContext::default();
        let resumed = BuildPlanGenerator::new(&config).resume(&shared).await.unwrap();
        assert_eq!(resumed, plan);
        assert_eq!(resumed.directories_in_build, plan.directories_in_build);
        assert_eq!(
            shared.get_variable(PLAN_SCOPE, "resumed").await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn resume_without_plan_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            root: dir.path().to_path_buf(),
            ..BuildConfig::default()
        };
        let err = BuildPlanGenerator::new(&config)
            .resume(&SharedContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::PlanFile(_)));
    }

    #[test]
    fn unknown_plan_version_is_rejected() {
        assert!(decode_plan(br#"{"format_version": 7}"#).is_err());
        assert!(decode_plan(b"not json").is_err());
    }
}
