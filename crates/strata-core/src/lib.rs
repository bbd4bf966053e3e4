//! Strata Core Library
//!
//! Incremental build planning: fingerprint module directories into buckets,
//! reuse stored outputs for unchanged buckets, order the rest into waves and
//! share build-wide state with worker processes.

pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod discovery;
pub mod double_write;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod manifest;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod plan;
pub mod recorder;
pub mod registry;
pub mod runner;
pub mod source;
pub mod telemetry;
pub mod tracker;

pub use cache::{BypassReason, CachePolicy, CacheQuery, StateCache};
pub use config::{
    BuildConfig, ChangesToConsider, FetchMode, LayoutConfig, Switches, BROKER_CHANNEL_ENV,
    CONFIG_FILE_NAME,
};
pub use context::{
    ArtifactCollection, ArtifactItem, ArtifactManifest, BuildMetadata, BuildOperationContext,
    BuildStateMetadata, SharedContext, SourceTreeMetadata,
};
pub use coordinator::{BuildCoordinator, BuildSummary, PlanningOutcome};
pub use discovery::{DiscoveredModule, Discovery};
pub use double_write::{check_double_writes, copy_batch, PathSpec};
pub use error::{ConfigError, DoubleWriteConflict, DoubleWriteError, Result, StrataError};
pub use executor::{
    BuildOutcome, DependencyFetcher, ExecutorConfig, FnModuleBuilder, ModuleBuilder,
    WaveExecutor, WaveOutcome,
};
pub use fingerprint::{BucketFingerprinter, BucketSet};
pub use graph::DependencyGraph;
pub use manifest::{DependencyNode, ModuleDependency, ModuleManifest, ModuleType};
pub use metrics::BuildMetrics;
pub use pipeline::PipelineService;
pub use plan::{AnalysisContext, BuildPlan, BuildPlanGenerator, PlannedModule, Wave};
pub use recorder::{OutputRecorder, RecordReport};
pub use registry::{Capability, ComponentRegistry, SourceControlBackend, StateStoreBackend};
pub use runner::CommandModuleBuilder;
pub use source::{ChangeType, FsSourceControl, GitSourceControl, SourceChange, SourceControl};
pub use tracker::{ModuleState, ModuleTracker, TrackerReport};

pub use strata_state::{BucketId, BuildStateFile, ProjectOutputSnapshot, StateStore};

/// Crate version, reported by the CLI and the broker handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
