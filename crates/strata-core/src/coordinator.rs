//! Build coordinator: fingerprint → classify → plan → execute → record.
//!
//! The coordinator owns the canonical [`SharedContext`] for the build and
//! checkpoints it after planning and after every wave. It never spawns the
//! broker itself; the host serves the same `SharedContext` over IPC when
//! workers run out of process.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_state::BuildStateFile;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};

use crate::cache::{CachePolicy, CacheQuery, StateCache};
use crate::config::{BuildConfig, ChangesToConsider};
use crate::context::{BuildStateMetadata, SharedContext, SourceTreeMetadata};
use crate::discovery::Discovery;
use crate::error::{ConfigError, Result, StrataError};
use crate::executor::{DependencyFetcher, ExecutorConfig, ModuleBuilder, WaveExecutor};
use crate::fingerprint::{BucketFingerprinter, BucketSet};
use crate::graph::DependencyGraph;
use crate::manifest::ModuleManifest;
use crate::metrics::BuildMetrics;
use crate::obs::BuildSpan;
use crate::plan::{AnalysisContext, BuildPlan, BuildPlanGenerator};
use crate::recorder::OutputRecorder;
use crate::registry::ComponentRegistry;
use crate::source::SourceChange;
use crate::tracker::{ModuleTracker, TrackerReport};

/// Everything planning produced.
#[derive(Debug, Clone)]
pub struct PlanningOutcome {
    pub plan: BuildPlan,
    pub buckets: BucketSet,
    pub cache: CacheQuery,
    pub tracker: ModuleTracker,
}

/// What the user sees at the end of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub build_id: String,
    pub waves: usize,
    pub cached: usize,
    pub rebuilt: usize,
    pub failed: usize,
    pub state_files_written: usize,
    pub dry_run: bool,
    pub bypass: Option<String>,
    pub report: TrackerReport,
}

impl BuildSummary {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

pub struct BuildCoordinator {
    config: BuildConfig,
    manifest: ModuleManifest,
    registry: ComponentRegistry,
    shared: SharedContext,
    builder: Arc<dyn ModuleBuilder>,
    fetcher: Option<Arc<dyn DependencyFetcher>>,
    cancel: watch::Receiver<bool>,
    metrics: BuildMetrics,
}

impl BuildCoordinator {
    pub fn new(
        config: BuildConfig,
        manifest: ModuleManifest,
        registry: ComponentRegistry,
        shared: SharedContext,
        builder: Arc<dyn ModuleBuilder>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            manifest,
            registry,
            shared,
            builder,
            fetcher: None,
            cancel,
            metrics: BuildMetrics::new(),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn DependencyFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn metrics(&self) -> &BuildMetrics {
        &self.metrics
    }

    pub fn shared_context(&self) -> &SharedContext {
        &self.shared
    }

    /// Fingerprint every first-party module at HEAD.
    pub fn compute_buckets(&self) -> Result<(BucketSet, Vec<SourceChange>)> {
        let source = self.registry.source_control();
        let baseline = source.head_commit()?;
        let pending = source.pending_changes()?;
        let dirs = self.manifest.module_directories();
        let buckets = BucketFingerprinter::new(source.as_ref()).compute_buckets(&baseline, &pending, &dirs)?;
        Ok((buckets, pending))
    }

    /// Fingerprint, classify and plan (or resume) without executing.
    pub async fn plan(&self) -> Result<PlanningOutcome> {
        let switches = &self.config.switches;
        if switches.resume && switches.clean {
            return Err(ConfigError::InvalidConfig("--resume and --clean are mutually exclusive".to_string()).into());
        }
        let plan_path = self.config.resolve(&self.config.plan_path);
        if switches.clean {
            for path in [&plan_path, &self.config.resolve(&self.config.context_path)] {
                if path.is_file() {
                    std::fs::remove_file(path)?;
                }
            }
        }

        let graph = DependencyGraph::build(&self.manifest)?;
        let (buckets, pending) = self.compute_buckets()?;

        let mut changes = pending.clone();
        if self.config.changes_to_consider == ChangesToConsider::Branch {
            if let Some(branch) = &self.config.branch {
                let source = self.registry.source_control();
                changes.extend(source.changes_between(branch, &buckets.baseline)?);
            }
        }

        let store = self.registry.state_store();
        let mut cache = StateCache::new(store.as_ref());
        let policy = CachePolicy::from_config(&self.config, !pending.is_empty());
        let query = cache.query_cache_for_buckets(buckets.all(), &policy);

        let context = self
            .shared
            .with(|ctx| {
                ctx.source_tree_metadata = SourceTreeMetadata {
                    baseline: buckets.baseline.clone(),
                    buckets: buckets.all().to_vec(),
                    changes,
                };
                ctx.build_state_metadata = BuildStateMetadata {
                    available: query.matched.clone(),
                    bypass: query.bypass.map(|b| b.to_string()),
                };
                ctx.build_metadata.branch = self.config.branch.clone();
                ctx.build_metadata.is_pull_request = self.config.is_pull_request;
                ctx.build_metadata.release = switches.release;
                ctx.version += 1;
                ctx.clone()
            })
            .await;

        let generator = BuildPlanGenerator::new(&self.config);
        let plan = if switches.resume {
            let plan = generator.resume(&self.shared).await?;
            self.ensure_cache_hits_current(&plan, &query)?;
            plan
        } else {
            let analysis = AnalysisContext {
                manifest: &self.manifest,
                graph: &graph,
                buckets: &buckets,
                cache: &query,
            };
            let discovery = Discovery::new(self.config.root.clone(), &self.config.layout);
            let plan = generator
                .compute_build_plan(&context, &analysis, &self.shared, &discovery)
                .await?;
            if !switches.dry_run {
                plan.save(&plan_path)?;
            }
            plan
        };

        let tracker = plan.tracker(&self.manifest)?;
        Ok(PlanningOutcome {
            plan,
            buckets,
            cache: query,
            tracker,
        })
    }

    /// A resumed plan skips its cache hits, so every one of them must still
    /// match a stored record for the current tree.
    fn ensure_cache_hits_current(&self, plan: &BuildPlan, query: &CacheQuery) -> Result<()> {
        let stale: Vec<&str> = plan
            .cache_hits
            .iter()
            .filter(|name| {
                self.manifest
                    .find(name)
                    .and_then(|m| m.directory.as_deref())
                    .and_then(|dir| query.matched_for(dir))
                    .is_none()
            })
            .map(String::as_str)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        warn!(modules = ?stale, "saved plan is stale");
        Err(StrataError::PlanFile(format!(
            "saved plan is stale: cached modules changed since it was written: {}; re-plan without --resume",
            stale.join(", ")
        )))
    }

    /// Run the whole build.
    pub async fn run(&self) -> Result<BuildSummary> {
        let build_id = self.shared.with(|ctx| ctx.build_metadata.build_id.clone()).await;
        let span = BuildSpan::span(&build_id);
        self.run_inner(build_id).instrument(span).await
    }

    async fn run_inner(&self, build_id: String) -> Result<BuildSummary> {
        let checkpoint = self.config.resolve(&self.config.context_path);

        let PlanningOutcome {
            plan,
            buckets,
            cache,
            mut tracker,
        } = self.plan().await?;

        let mut summary = BuildSummary {
            build_id,
            waves: plan.waves.len(),
            dry_run: self.config.switches.dry_run,
            bypass: cache.bypass.map(|b| b.to_string()),
            ..BuildSummary::default()
        };

        if self.config.switches.dry_run {
            info!(modules = plan.module_count(), "dry run, nothing executed");
            summary.cached = plan.cache_hits.len();
            summary.report = tracker.report();
            return Ok(summary);
        }
        self.shared.checkpoint(&checkpoint).await?;

        let recorder = OutputRecorder::new(self.config.root.clone());
        let cached: Vec<BuildStateFile> = plan
            .cache_hits
            .iter()
            .filter_map(|name| self.manifest.find(name))
            .filter_map(|m| m.directory.as_deref())
            .filter_map(|dir| cache.matched_for(dir).cloned())
            .collect();
        recorder.seed_cached_outputs(&self.shared, &cached).await?;
        self.metrics.add_cache_hits(plan.cache_hits.len() as u64);

        let mut executor = WaveExecutor::new(
            Arc::clone(&self.builder),
            Arc::new(self.shared.clone()),
            recorder.clone(),
            ExecutorConfig {
                max_parallelism: self.config.max_parallelism,
                module_timeout: (self.config.module_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.config.module_timeout_secs)),
            },
            self.cancel.clone(),
        );
        if let Some(fetcher) = &self.fetcher {
            executor = executor.with_fetcher(Arc::clone(fetcher));
        }

        let graph = DependencyGraph::build(&self.manifest)?;
        for wave in &plan.waves {
            let result = executor
                .run_wave(wave, &plan.dependencies_to_fetch, &graph, &mut tracker, &self.metrics)
                .await;
            self.shared.checkpoint(&checkpoint).await?;
            if let Err(e) = result {
                warn!(wave = wave.index, error = %e, "wave aborted");
                return Err(e);
            }
        }

        let store = self.registry.state_store();
        let record = recorder
            .write_state_files(&self.shared, &mut tracker, &buckets, store.as_ref())
            .await?;
        for _ in &record.written {
            self.metrics.inc_state_files();
        }
        self.shared.checkpoint(&checkpoint).await?;
        self.metrics.flush();

        let report = tracker.report();
        summary.cached = report.cached.len();
        summary.rebuilt = report.rebuilt.len();
        summary.failed = report.failed.len();
        summary.state_files_written = record.written.len();
        summary.report = report;
        info!(
            cached = summary.cached,
            rebuilt = summary.rebuilt,
            failed = summary.failed,
            "build finished"
        );
        Ok(summary)
    }
}
