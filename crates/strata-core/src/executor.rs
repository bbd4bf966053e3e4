//! Wave execution.
//!
//! Waves run strictly in order; inside a wave modules run concurrently up to
//! `max_parallelism`. A module whose dependency failed is never started and
//! is marked failed itself, so failure flows to every dependent while
//! independent branches keep building. Cancellation is cooperative: it is
//! checked before each module starts and between dependency copies.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use strata_state::ProjectOutputSnapshot;
use tokio::sync::{watch, Semaphore};
use tracing::{instrument, warn};

use crate::double_write::{copy_batch, PathSpec};
use crate::error::{Result, StrataError};
use crate::graph::DependencyGraph;
use crate::manifest::DependencyNode;
use crate::metrics::BuildMetrics;
use crate::obs;
use crate::pipeline::PipelineService;
use crate::plan::{BuildPlan, PlannedModule, Wave};
use crate::recorder::OutputRecorder;
use crate::tracker::{ModuleState, ModuleTracker};

/// Result of building one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    pub success: bool,
    pub message: Option<String>,
    /// Outputs to record on success. Builders that record through the
    /// pipeline themselves leave this empty.
    pub outputs: Vec<ProjectOutputSnapshot>,
}

impl BuildOutcome {
    pub fn succeeded(outputs: Vec<ProjectOutputSnapshot>) -> Self {
        Self {
            success: true,
            message: None,
            outputs,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            outputs: Vec::new(),
        }
    }
}

/// Builds a single module. The external executor behind the plan.
#[async_trait]
pub trait ModuleBuilder: Send + Sync {
    async fn build(
        &self,
        module: &PlannedModule,
        pipeline: Arc<dyn PipelineService>,
    ) -> Result<BuildOutcome>;
}

/// [`ModuleBuilder`] backed by an async closure.
pub struct FnModuleBuilder<F> {
    f: F,
}

impl<F> FnModuleBuilder<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(PlannedModule) -> Fut,
        Fut: Future<Output = Result<BuildOutcome>>,
    {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ModuleBuilder for FnModuleBuilder<F>
where
    F: Fn(PlannedModule) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BuildOutcome>> + Send,
{
    async fn build(
        &self,
        module: &PlannedModule,
        _pipeline: Arc<dyn PipelineService>,
    ) -> Result<BuildOutcome> {
        (self.f)(module.clone()).await
    }
}

/// Plans the copies that bring fetched dependencies into place for a wave.
#[async_trait]
pub trait DependencyFetcher: Send + Sync {
    async fn plan_copies(
        &self,
        wave: &Wave,
        dependencies: &[DependencyNode],
    ) -> Result<Vec<PathSpec>>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_parallelism: usize,
    pub module_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            module_timeout: None,
        }
    }
}

/// Counts for one finished wave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveOutcome {
    pub index: usize,
    pub succeeded: usize,
    pub failed: usize,
}

type TaskResult = Result<(BuildOutcome, u64)>;

/// Runs plan waves against a [`ModuleBuilder`].
pub struct WaveExecutor {
    builder: Arc<dyn ModuleBuilder>,
    pipeline: Arc<dyn PipelineService>,
    recorder: OutputRecorder,
    fetcher: Option<Arc<dyn DependencyFetcher>>,
    config: ExecutorConfig,
    cancel: watch::Receiver<bool>,
}

impl WaveExecutor {
    pub fn new(
        builder: Arc<dyn ModuleBuilder>,
        pipeline: Arc<dyn PipelineService>,
        recorder: OutputRecorder,
        config: ExecutorConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            builder,
            pipeline,
            recorder,
            fetcher: None,
            config,
            cancel,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn DependencyFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run every wave in order.
    pub async fn run(
        &self,
        plan: &BuildPlan,
        graph: &DependencyGraph,
        tracker: &mut ModuleTracker,
        metrics: &BuildMetrics,
    ) -> Result<Vec<WaveOutcome>> {
        let mut outcomes = Vec::with_capacity(plan.waves.len());
        for wave in &plan.waves {
            outcomes.push(
                self.run_wave(wave, &plan.dependencies_to_fetch, graph, tracker, metrics)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    /// Run one wave to completion.
    ///
    /// Returns `Err` only for conditions that abort the build: a double write
    /// while fetching dependencies or recording outputs.
    #[instrument(skip_all, fields(wave = wave.index))]
    pub async fn run_wave(
        &self,
        wave: &Wave,
        dependencies: &[DependencyNode],
        graph: &DependencyGraph,
        tracker: &mut ModuleTracker,
        metrics: &BuildMetrics,
    ) -> Result<WaveOutcome> {
        obs::emit_wave_started(wave.index, wave.modules.len());
        let mut outcome = WaveOutcome {
            index: wave.index,
            ..WaveOutcome::default()
        };

        for module in &wave.modules {
            tracker.transition(&module.name, ModuleState::Queued)?;
        }

        if let Some(fetcher) = &self.fetcher {
            let specs = fetcher.plan_copies(wave, dependencies).await?;
            if let Err(e) = copy_batch(&specs, &self.cancel).await {
                let reason = e.to_string();
                for module in &wave.modules {
                    tracker.fail(&module.name, reason.clone())?;
                    metrics.inc_failed();
                }
                outcome.failed = wave.modules.len();
                obs::emit_wave_finished(wave.index, 0, outcome.failed);
                return match e {
                    StrataError::DoubleWrite(_) => Err(e),
                    _ => Ok(outcome),
                };
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallelism.max(1)));
        let mut names = Vec::new();
        let mut tasks = Vec::new();

        for module in &wave.modules {
            if self.is_cancelled() {
                tracker.fail(&module.name, "cancelled")?;
                metrics.inc_failed();
                outcome.failed += 1;
                continue;
            }

            let failed = |dep: &&DependencyNode| tracker.state(&dep.name) == Some(ModuleState::Failed);
            // Direct providers first; cached modules in between do not shield
            // a dependent from a failed provider further up.
            let blocked_by = match graph.dependencies_of(&module.name)?.into_iter().find(failed) {
                Some(dep) => Some(dep.name.clone()),
                None => graph
                    .transitive_dependencies_of(&module.name)?
                    .into_iter()
                    .find(failed)
                    .map(|dep| dep.name.clone()),
            };
            if let Some(dep) = blocked_by {
                warn!(module = %module.name, dependency = %dep, "dependency failed, not starting");
                tracker.fail(&module.name, format!("dependency '{dep}' failed"))?;
                metrics.inc_failed();
                outcome.failed += 1;
                continue;
            }

            tracker.transition(&module.name, ModuleState::Building)?;
            let task = self.spawn_module(module.clone(), Arc::clone(&semaphore));
            names.push(module.name.clone());
            tasks.push(task);
        }

        let joined = join_all(tasks).await;
        let mut fatal: Option<StrataError> = None;
        for (name, joined) in names.into_iter().zip(joined) {
            let result: TaskResult = match joined {
                Ok(r) => r,
                Err(e) => Err(StrataError::ModuleTask(e.to_string())),
            };
            match result {
                Ok((built, duration_ms)) if built.success => {
                    tracker.succeed(&name, duration_ms)?;
                    metrics.inc_rebuilt();
                    outcome.succeeded += 1;
                    obs::emit_module_finished(&name, true, duration_ms);
                }
                Ok((built, duration_ms)) => {
                    let reason = built.message.unwrap_or_else(|| "build failed".to_string());
                    tracker.fail(&name, reason)?;
                    metrics.inc_failed();
                    outcome.failed += 1;
                    obs::emit_module_finished(&name, false, duration_ms);
                }
                Err(e) => {
                    tracker.fail(&name, e.to_string())?;
                    metrics.inc_failed();
                    outcome.failed += 1;
                    obs::emit_module_finished(&name, false, 0);
                    if matches!(e, StrataError::DoubleWrite(_)) && fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }

        obs::emit_wave_finished(wave.index, outcome.succeeded, outcome.failed);
        match fatal {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    fn spawn_module(
        &self,
        module: PlannedModule,
        semaphore: Arc<Semaphore>,
    ) -> tokio::task::JoinHandle<TaskResult> {
        let builder = Arc::clone(&self.builder);
        let pipeline = Arc::clone(&self.pipeline);
        let recorder = self.recorder.clone();
        let cancel = self.cancel.clone();
        let timeout = self.config.module_timeout;

        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| StrataError::Cancelled)?;

            let cancelled = *cancel.borrow();
            if cancelled {
                return Err(StrataError::Cancelled);
            }

            let started = Instant::now();
            let build = builder.build(&module, Arc::clone(&pipeline));
            let built = match timeout {
                Some(limit) => match tokio::time::timeout(limit, build).await {
                    Ok(r) => r?,
                    Err(_) => BuildOutcome::failed(format!("timed out after {}s", limit.as_secs())),
                },
                None => build.await?,
            };

            if built.success {
                for snapshot in &built.outputs {
                    recorder
                        .build_snapshot(pipeline.as_ref(), snapshot.clone())
                        .await?;
                }
            }
            Ok((built, started.elapsed().as_millis() as u64))
        })
    }
}
