//! Strata - incremental build planning CLI
//!
//! The `strata` command fingerprints module directories, reuses stored
//! outputs for unchanged ones and builds the rest in dependency waves.
//!
//! ## Commands
//!
//! - `buckets`: Show the bucket id of every module directory
//! - `plan`: Compute (or resume) a build plan without executing it
//! - `build`: Plan and execute a build, serving the shared context to workers
//! - `broker serve`: Serve a shared context on a channel until interrupted
//! - `worker`: Talk to the broker of a running build from a worker process
//! - `state`: Inspect or clean stored build state
//! - `check-writes`: Check a list of planned copies for double writes

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

use strata_broker::{BrokerClient, BrokerEndpoint, BrokerServer};
use strata_core::{
    check_double_writes, ArtifactItem, BuildConfig, BuildCoordinator, BuildOperationContext,
    BuildSummary, ChangesToConsider, CommandModuleBuilder, ComponentRegistry, FetchMode,
    ModuleManifest, OutputRecorder, PathSpec, PipelineService, ProjectOutputSnapshot,
    SharedContext, StateStore,
};

#[derive(Parser)]
#[command(name = "strata")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental build planning and state caching", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Build root (default: current directory)
    #[arg(long, global = true, env = "STRATA_ROOT", default_value = ".")]
    root: PathBuf,

    /// Configuration file (default: <root>/strata.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the bucket id of every module directory
    Buckets,

    /// Compute a build plan without executing it
    Plan {
        /// Reuse the plan written by an earlier run
        #[arg(long)]
        resume: bool,

        /// Do not persist the plan
        #[arg(long)]
        dry_run: bool,
    },

    /// Plan and execute a build
    Build {
        #[command(flatten)]
        flags: BuildFlags,

        /// Build command run in each module directory (overrides build_command)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Broker operations
    Broker {
        #[command(subcommand)]
        action: BrokerAction,
    },

    /// Worker-side access to a running build's shared context
    Worker {
        /// Broker channel (default: $STRATA_BROKER_CHANNEL)
        #[arg(long, global = true)]
        channel: Option<String>,

        #[command(subcommand)]
        action: WorkerAction,
    },

    /// Inspect or clean stored build state
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Check a JSON list of {source, destination} copies for double writes
    CheckWrites {
        /// Path to the JSON file
        file: PathBuf,
    },
}

#[derive(clap::Args, Debug, Default, Clone)]
struct BuildFlags {
    /// Reuse the plan written by an earlier run
    #[arg(long)]
    resume: bool,

    /// Plan only; nothing is executed or persisted
    #[arg(long)]
    dry_run: bool,

    /// Discard the previous plan and context checkpoint first
    #[arg(long)]
    clean: bool,

    /// Release build
    #[arg(long)]
    release: bool,

    /// Ignore stored state and rebuild every module
    #[arg(long)]
    all: bool,

    /// Which dependencies to fetch: direct | transitive
    #[arg(long)]
    fetch_mode: Option<FetchMode>,

    /// Changes to consider: none | pending_changes | branch
    #[arg(long)]
    changes: Option<ChangesToConsider>,

    /// Extra module directories to build
    #[arg(long = "include")]
    include: Vec<String>,

    /// Module directories to leave out
    #[arg(long = "exclude")]
    exclude: Vec<String>,
}

impl BuildFlags {
    fn apply(&self, config: &mut BuildConfig) {
        config.switches.resume |= self.resume;
        config.switches.dry_run |= self.dry_run;
        config.switches.clean |= self.clean;
        config.switches.release |= self.release;
        config.switches.build_all |= self.all;
        if let Some(mode) = self.fetch_mode {
            config.fetch_mode = mode;
        }
        if let Some(changes) = self.changes {
            config.changes_to_consider = changes;
        }
        config.include.extend(self.include.iter().cloned());
        config.exclude.extend(self.exclude.iter().cloned());
    }
}

#[derive(Subcommand)]
enum BrokerAction {
    /// Serve a shared context until interrupted
    Serve {
        /// Channel name (default: a fresh one, printed on start)
        #[arg(long)]
        channel: Option<String>,

        /// Context checkpoint to start from
        #[arg(long)]
        context: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Read or write a context variable
    Var {
        #[command(subcommand)]
        action: VarAction,
    },
    /// Record the outputs of one built project
    Record {
        /// Project file, relative to the build root
        project: String,

        /// Files the project wrote, relative to the build root
        #[arg(long = "file")]
        files: Vec<String>,

        /// Primary output path
        #[arg(long, default_value = "")]
        output_path: String,

        /// Intermediate directory
        #[arg(long, default_value = "")]
        intermediate_dir: String,

        /// Mark the project as a test project
        #[arg(long)]
        test: bool,

        /// Module directory (default: $STRATA_MODULE_DIR)
        #[arg(long, env = "STRATA_MODULE_DIR")]
        module_dir: String,

        /// Discard an earlier record of the same project first
        #[arg(long)]
        replace: bool,
    },
    /// Attach files to a publisher's artifact manifest
    Artifact {
        /// Publisher name
        publisher: String,
        /// Manifest id
        id: String,
        /// Files to attach
        #[arg(required = true)]
        files: Vec<String>,
    },
}

#[derive(Subcommand)]
enum VarAction {
    Get { scope: String, key: String },
    Put { scope: String, key: String, value: String },
}

#[derive(Subcommand)]
enum StateAction {
    /// List stored state files per bucket tag
    List,
    /// Remove stored state
    Clean {
        /// Bucket tag to remove (default: every tag)
        tag: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    strata_core::telemetry::init_tracing(cli.json, level);

    let out = Output { json: cli.json };
    match cli.command {
        Commands::Buckets => {
            let config = load_config(&cli.root, cli.config.as_deref())?;
            cmd_buckets(&config, out).await
        }
        Commands::Plan { resume, dry_run } => {
            let mut config = load_config(&cli.root, cli.config.as_deref())?;
            config.switches.resume = resume;
            config.switches.dry_run = dry_run;
            cmd_plan(&config, out).await
        }
        Commands::Build { flags, command } => {
            let mut config = load_config(&cli.root, cli.config.as_deref())?;
            flags.apply(&mut config);
            if !command.is_empty() {
                config.build_command = command;
            }
            cmd_build(config, out).await
        }
        Commands::Broker { action } => match action {
            BrokerAction::Serve { channel, context } => {
                let config = load_config(&cli.root, cli.config.as_deref())?;
                cmd_broker_serve(&config, channel, context.as_deref()).await
            }
        },
        Commands::Worker { channel, action } => {
            let config = load_config(&cli.root, cli.config.as_deref())?;
            let timeout = Duration::from_secs(config.broker_timeout_secs);
            let client = match channel.or_else(|| config.broker_channel.clone()) {
                Some(channel) => BrokerClient::connect(&channel, timeout).await?,
                None => BrokerClient::from_env(timeout).await?,
            };
            cmd_worker(&client, &config.root, action, out).await
        }
        Commands::State { action } => {
            let config = load_config(&cli.root, cli.config.as_deref())?;
            let registry = ComponentRegistry::from_config(&config)?;
            let store = registry.state_store();
            match action {
                StateAction::List => cmd_state_list(store.as_ref(), out),
                StateAction::Clean { tag } => cmd_state_clean(store.as_ref(), tag.as_deref()),
            }
        }
        Commands::CheckWrites { file } => cmd_check_writes(&file, out),
    }
}

#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

/// Load configuration: explicit file, else `<root>/strata.toml`, then env.
fn load_config(root: &Path, file: Option<&Path>) -> Result<BuildConfig> {
    let config = match file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            let mut config = BuildConfig::from_toml_str(&text)?;
            config.root = root.to_path_buf();
            config.apply_env_with(|key| std::env::var(key).ok())?;
            config
        }
        None => BuildConfig::load(root)?,
    };
    config.validate()?;
    Ok(config)
}

fn load_manifest(config: &BuildConfig) -> Result<ModuleManifest> {
    let path = config.resolve(&config.manifest_path);
    ModuleManifest::load(&path).with_context(|| format!("Failed to load manifest {:?}", path))
}

fn coordinator(
    config: BuildConfig,
    shared: SharedContext,
    cancel: tokio::sync::watch::Receiver<bool>,
) -> Result<BuildCoordinator> {
    let manifest = load_manifest(&config)?;
    let registry = ComponentRegistry::from_config(&config)?;
    let builder = Arc::new(CommandModuleBuilder::from_config(&config));
    Ok(BuildCoordinator::new(
        config, manifest, registry, shared, builder, cancel,
    ))
}

/// Show the bucket id of every module directory
async fn cmd_buckets(config: &BuildConfig, out: Output) -> Result<()> {
    let (_tx, rx) = tokio::sync::watch::channel(false);
    let coordinator = coordinator(config.clone(), SharedContext::default(), rx)?;
    let (buckets, pending) = coordinator.compute_buckets()?;

    if out.json {
        return out.print_json(&buckets.get_buckets());
    }
    println!("Baseline: {}", buckets.baseline);
    for bucket in buckets.get_buckets() {
        println!("  {:<40} {}", bucket.tag, bucket.short_id());
    }
    if !pending.is_empty() {
        println!();
        println!("{} pending change(s)", pending.len());
    }
    Ok(())
}

/// Compute (or resume) a plan and print it
async fn cmd_plan(config: &BuildConfig, out: Output) -> Result<()> {
    let (_tx, rx) = tokio::sync::watch::channel(false);
    let coordinator = coordinator(config.clone(), SharedContext::default(), rx)?;
    let outcome = coordinator.plan().await?;
    let plan = &outcome.plan;

    if out.json {
        return out.print_json(plan);
    }
    println!("Plan {}", plan.build_id);
    if let Some(reason) = outcome.cache.bypass {
        println!("Cache bypassed: {}", reason);
    }
    for wave in &plan.waves {
        let names: Vec<String> = wave
            .modules
            .iter()
            .map(|m| {
                if m.forced {
                    format!("{} (forced)", m.name)
                } else {
                    m.name.clone()
                }
            })
            .collect();
        println!("  Wave {}: {}", wave.index, names.join(", "));
    }
    if !plan.cache_hits.is_empty() {
        println!("Cache hits: {}", plan.cache_hits.join(", "));
    }
    if !plan.dependencies_to_fetch.is_empty() {
        let fetch: Vec<&str> = plan
            .dependencies_to_fetch
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        println!("Fetch: {}", fetch.join(", "));
    }
    if plan.is_empty() {
        println!("Nothing to build.");
    }
    Ok(())
}

/// Plan and execute a build, serving the shared context to workers
async fn cmd_build(mut config: BuildConfig, out: Output) -> Result<()> {
    if config.build_command.is_empty() && !config.switches.dry_run {
        anyhow::bail!("No build command: set build_command in strata.toml or pass one after --");
    }

    let channel = config
        .broker_channel
        .clone()
        .unwrap_or_else(BrokerEndpoint::new_channel);
    config.broker_channel = Some(channel.clone());

    let shared = SharedContext::default();
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let coordinator = coordinator(config, shared.clone(), cancel_rx)?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let server = BrokerServer::bind(&channel, shared.clone())
        .with_context(|| format!("Failed to start broker on channel {channel}"))?;
    info!(channel = %channel, endpoint = %server.endpoint(), "broker started");
    let broker = tokio::spawn(server.serve(stop_rx));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after running modules finish");
            let _ = cancel_tx.send(true);
        }
    });

    let result = coordinator.run().await;

    let _ = stop_tx.send(true);
    match broker.await {
        Ok(Err(e)) => warn!(error = %e, "broker stopped with error"),
        Err(e) => warn!(error = %e, "broker task failed"),
        Ok(Ok(())) => {}
    }

    let summary = result?;
    print_summary(&summary, out)?;
    if !summary.success() {
        anyhow::bail!("{} module(s) failed", summary.failed);
    }
    Ok(())
}

fn print_summary(summary: &BuildSummary, out: Output) -> Result<()> {
    if out.json {
        return out.print_json(summary);
    }
    println!();
    println!("Build {}", summary.build_id);
    println!(
        "Status: {}",
        if summary.success() { "✓ PASSED" } else { "✗ FAILED" }
    );
    if summary.dry_run {
        println!("Dry run: nothing executed");
    }
    if let Some(reason) = &summary.bypass {
        println!("Cache bypassed: {}", reason);
    }
    println!("Waves: {}", summary.waves);
    for name in &summary.report.cached {
        println!("  ✓ {} (cached)", name);
    }
    for name in &summary.report.rebuilt {
        println!("  ✓ {}", name);
    }
    for (name, reason) in &summary.report.failed {
        println!("  ✗ {}: {}", name, reason);
    }
    println!();
    println!("Summary: {}", summary.report);
    println!("State files written: {}", summary.state_files_written);
    Ok(())
}

/// Serve a shared context on a channel until interrupted
async fn cmd_broker_serve(
    config: &BuildConfig,
    channel: Option<String>,
    context: Option<&Path>,
) -> Result<()> {
    let channel = channel
        .or_else(|| config.broker_channel.clone())
        .unwrap_or_else(BrokerEndpoint::new_channel);
    let initial = match context {
        Some(path) => BuildOperationContext::load(path)
            .with_context(|| format!("Failed to load context {:?}", path))?,
        None => BuildOperationContext::default(),
    };
    let shared = SharedContext::new(initial);
    let server = BrokerServer::bind(&channel, shared.clone())?;

    println!("Serving channel: {}", channel);
    println!("Endpoint: {}", server.endpoint());
    println!("Export {}={} in worker processes.", strata_core::BROKER_CHANNEL_ENV, channel);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });
    server.serve(stop_rx).await?;

    let checkpoint = config.resolve(&config.context_path);
    shared.checkpoint(&checkpoint).await?;
    println!("Context saved to {:?}", checkpoint);
    Ok(())
}

/// Worker-side commands against a running broker
async fn cmd_worker(
    pipeline: &dyn PipelineService,
    root: &Path,
    action: WorkerAction,
    out: Output,
) -> Result<()> {
    match action {
        WorkerAction::Var { action } => match action {
            VarAction::Get { scope, key } => match pipeline.get_variable(&scope, &key).await? {
                Some(value) => {
                    println!("{}", value);
                    Ok(())
                }
                None => anyhow::bail!("Variable not set: {}/{}", scope, key),
            },
            VarAction::Put { scope, key, value } => {
                pipeline.put_variable(&scope, &key, &value).await?;
                Ok(())
            }
        },
        WorkerAction::Record {
            project,
            files,
            output_path,
            intermediate_dir,
            test,
            module_dir,
            replace,
        } => {
            if replace {
                pipeline.reset_project_outputs(&project).await?;
            }
            let mut snapshot = ProjectOutputSnapshot::new(
                project.clone(),
                strata_core::runner::project_guid(&project),
                module_dir,
            );
            snapshot.files_written = files;
            snapshot.output_path = output_path;
            snapshot.intermediate_directory = intermediate_dir;
            snapshot.is_test_project = test;

            let recorded = OutputRecorder::new(root)
                .build_snapshot(pipeline, snapshot)
                .await?;
            if out.json {
                return out.print_json(&recorded);
            }
            println!(
                "✓ Recorded {} ({} file(s))",
                recorded.project_file,
                recorded.files_written.len()
            );
            Ok(())
        }
        WorkerAction::Artifact {
            publisher,
            id,
            files,
        } => {
            let items = files.into_iter().map(ArtifactItem::new).collect();
            let manifest = pipeline.record_artifact(&publisher, &id, items).await?;
            if out.json {
                return out.print_json(&manifest);
            }
            println!(
                "✓ {}/{} v{} ({} item(s))",
                manifest.publisher,
                manifest.id,
                manifest.version,
                manifest.items.len()
            );
            Ok(())
        }
    }
}

/// List stored state files per bucket tag
fn cmd_state_list(store: &dyn StateStore, out: Output) -> Result<()> {
    let tags = store.list_tags()?;
    let mut rows = Vec::with_capacity(tags.len());
    for tag in &tags {
        let candidates = store.candidates(tag)?;
        let valid = candidates.iter().filter(|c| c.is_ok()).count();
        let latest = candidates
            .iter()
            .filter_map(|c| c.as_ref().ok())
            .max_by_key(|f| f.written_at)
            .map(|f| f.written_at.to_rfc3339());
        rows.push(serde_json::json!({
            "tag": tag,
            "records": valid,
            "unreadable": candidates.len() - valid,
            "latest": latest,
        }));
    }

    if out.json {
        return out.print_json(&rows);
    }
    if rows.is_empty() {
        println!("No stored build state.");
        return Ok(());
    }
    for row in &rows {
        println!(
            "  {:<40} {} record(s){}",
            row["tag"].as_str().unwrap_or_default(),
            row["records"],
            match row["unreadable"].as_u64() {
                Some(n) if n > 0 => format!(", {} unreadable", n),
                _ => String::new(),
            }
        );
    }
    Ok(())
}

/// Remove stored state for one tag or all tags
fn cmd_state_clean(store: &dyn StateStore, tag: Option<&str>) -> Result<()> {
    let tags = match tag {
        Some(tag) => vec![tag.to_string()],
        None => store.list_tags()?,
    };
    let mut removed = 0;
    for tag in &tags {
        removed += store.remove_tag(tag)?;
    }
    println!("✓ Removed {} state file(s) across {} tag(s)", removed, tags.len());
    Ok(())
}

/// Check planned copies for double writes
fn cmd_check_writes(file: &Path, out: Output) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read copy list: {:?}", file))?;
    let specs: Vec<PathSpec> =
        serde_json::from_str(&text).context("Copy list must be a JSON array of {source, destination}")?;

    match check_double_writes(&specs) {
        Ok(()) => {
            if out.json {
                out.print_json(&serde_json::json!({ "copies": specs.len(), "conflicts": [] }))?;
            } else {
                println!("✓ {} copies, no double writes", specs.len());
            }
            Ok(())
        }
        Err(e) => {
            if out.json {
                if let strata_core::DoubleWriteError::Destinations { conflicts } = &e {
                    out.print_json(&serde_json::json!({ "copies": specs.len(), "conflicts": conflicts }))?;
                }
            } else {
                println!("✗ {}", e);
            }
            Err(e.into())
        }
    }
}
