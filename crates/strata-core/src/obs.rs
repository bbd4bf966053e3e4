//! Structured observability hooks for the build lifecycle.
//!
//! - Build-scoped tracing spans via the [`BuildSpan`] RAII guard
//! - Emission functions for planning, wave and recording events
//!
//! Every event carries an `event` field so log pipelines can filter on it.

use tracing::{info, warn};

/// RAII guard that enters a build-scoped span for the duration of a build.
///
/// ```ignore
/// let _span = BuildSpan::enter("build-1234");
/// // every event below carries build_id = "build-1234"
/// ```
pub struct BuildSpan {
    _span: tracing::span::EnteredSpan,
}

impl BuildSpan {
    pub fn enter(build_id: &str) -> Self {
        Self {
            _span: Self::span(build_id).entered(),
        }
    }

    /// The unentered span, for instrumenting futures.
    pub fn span(build_id: &str) -> tracing::Span {
        tracing::info_span!("strata.build", build_id = %build_id)
    }
}

/// Emit event: cache classification finished.
pub fn emit_cache_classified(matched: usize, unassigned: usize, bypass: Option<&str>) {
    info!(
        event = "cache.classified",
        matched = matched,
        unassigned = unassigned,
        bypass = bypass.unwrap_or("none"),
    );
}

/// Emit event: plan computed or resumed.
pub fn emit_plan_computed(directories: usize, waves: usize, resumed: bool) {
    info!(
        event = "plan.computed",
        directories = directories,
        waves = waves,
        resumed = resumed,
    );
}

pub fn emit_wave_started(wave: usize, modules: usize) {
    info!(event = "wave.started", wave = wave, modules = modules);
}

pub fn emit_wave_finished(wave: usize, succeeded: usize, failed: usize) {
    info!(
        event = "wave.finished",
        wave = wave,
        succeeded = succeeded,
        failed = failed,
    );
}

/// Emit event: a module reached a terminal state.
pub fn emit_module_finished(module: &str, success: bool, duration_ms: u64) {
    if success {
        info!(event = "module.finished", module = %module, success = true, duration_ms = duration_ms);
    } else {
        warn!(event = "module.finished", module = %module, success = false, duration_ms = duration_ms);
    }
}

pub fn emit_state_file_written(tag: &str, location: &str) {
    info!(event = "state.written", tag = %tag, location = %location);
}

/// Emit event: double write detected (warning level, one line per conflict).
pub fn emit_double_write(destination: &str, sources: &[String]) {
    warn!(
        event = "write.double",
        destination = %destination,
        sources = %sources.join(", "),
    );
}
