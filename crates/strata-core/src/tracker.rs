//! Per-module lifecycle within one plan.
//!
//! ```text
//! Unplanned → Unassigned | CacheHit
//! Unassigned → Queued → Building → Succeeded | Failed
//! Queued → Failed          (blocked by a failed dependency, or cancelled)
//! Succeeded → Recorded     (state file written)
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Unplanned,
    /// Needs a build.
    Unassigned,
    /// Skipped; outputs come from a stored state file.
    CacheHit,
    Queued,
    Building,
    Succeeded,
    Failed,
    Recorded,
}

impl ModuleState {
    /// No further execution will happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ModuleState::CacheHit | ModuleState::Succeeded | ModuleState::Failed | ModuleState::Recorded
        )
    }

    /// Outputs for this module are usable by consumers.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ModuleState::CacheHit | ModuleState::Succeeded | ModuleState::Recorded
        )
    }

    fn can_move_to(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Unplanned, Unassigned)
                | (Unplanned, CacheHit)
                | (Unassigned, Queued)
                | (Queued, Building)
                | (Queued, Failed)
                | (Building, Succeeded)
                | (Building, Failed)
                | (Succeeded, Recorded)
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Unplanned => "unplanned",
            ModuleState::Unassigned => "unassigned",
            ModuleState::CacheHit => "cache_hit",
            ModuleState::Queued => "queued",
            ModuleState::Building => "building",
            ModuleState::Succeeded => "succeeded",
            ModuleState::Failed => "failed",
            ModuleState::Recorded => "recorded",
        };
        f.write_str(s)
    }
}

/// Everything tracked about one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedModule {
    pub name: String,
    pub directory: String,
    pub state: ModuleState,
    /// Rebuilt only because a dependency was rebuilt.
    pub forced: bool,
    pub failure: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Cached / rebuilt / failed summary shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerReport {
    pub cached: Vec<String>,
    pub rebuilt: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Modules that never reached a terminal state.
    pub pending: Vec<String>,
}

impl fmt::Display for TrackerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} from cache, {} rebuilt, {} failed",
            self.cached.len(),
            self.rebuilt.len(),
            self.failed.len()
        )?;
        for name in &self.cached {
            writeln!(f, "  cached   {name}")?;
        }
        for name in &self.rebuilt {
            writeln!(f, "  rebuilt  {name}")?;
        }
        for (name, reason) in &self.failed {
            writeln!(f, "  failed   {name}: {reason}")?;
        }
        for name in &self.pending {
            writeln!(f, "  pending  {name}")?;
        }
        Ok(())
    }
}

/// State machine over every module in a plan, keyed case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleTracker {
    modules: BTreeMap<String, TrackedModule>,
}

impl ModuleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name` in `Unplanned`. Tracking twice is a no-op.
    pub fn track(&mut self, name: &str, directory: &str) {
        self.modules
            .entry(name.to_lowercase())
            .or_insert_with(|| TrackedModule {
                name: name.to_string(),
                directory: directory.to_string(),
                state: ModuleState::Unplanned,
                forced: false,
                failure: None,
                duration_ms: None,
            });
    }

    pub fn get(&self, name: &str) -> Option<&TrackedModule> {
        self.modules.get(&name.to_lowercase())
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.get(name).map(|m| m.state)
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut TrackedModule> {
        self.modules
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| StrataError::UntrackedModule(name.to_string()))
    }

    /// Move `name` to `next`, rejecting transitions outside the lifecycle.
    pub fn transition(&mut self, name: &str, next: ModuleState) -> Result<()> {
        let module = self.entry_mut(name)?;
        if !module.state.can_move_to(next) {
            return Err(StrataError::InvalidTransition {
                module: module.name.clone(),
                from: module.state.to_string(),
                to: next.to_string(),
            });
        }
        module.state = next;
        Ok(())
    }

    pub fn mark_forced(&mut self, name: &str) -> Result<()> {
        self.entry_mut(name)?.forced = true;
        Ok(())
    }

    /// `Queued` or `Building` → `Failed` with a reason.
    pub fn fail(&mut self, name: &str, reason: impl Into<String>) -> Result<()> {
        self.transition(name, ModuleState::Failed)?;
        self.entry_mut(name)?.failure = Some(reason.into());
        Ok(())
    }

    /// `Building` → `Succeeded` with the elapsed build time.
    pub fn succeed(&mut self, name: &str, duration_ms: u64) -> Result<()> {
        self.transition(name, ModuleState::Succeeded)?;
        self.entry_mut(name)?.duration_ms = Some(duration_ms);
        Ok(())
    }

    pub fn modules(&self) -> impl Iterator<Item = &TrackedModule> {
        self.modules.values()
    }

    pub fn in_state(&self, state: ModuleState) -> Vec<&TrackedModule> {
        self.modules.values().filter(|m| m.state == state).collect()
    }

    pub fn any_failed(&self) -> bool {
        self.modules.values().any(|m| m.state == ModuleState::Failed)
    }

    pub fn report(&self) -> TrackerReport {
        let mut report = TrackerReport::default();
        for m in self.modules.values() {
            match m.state {
                ModuleState::CacheHit => report.cached.push(m.name.clone()),
                ModuleState::Succeeded | ModuleState::Recorded => report.rebuilt.push(m.name.clone()),
                ModuleState::Failed => report
                    .failed
                    .push((m.name.clone(), m.failure.clone().unwrap_or_default())),
                _ => report.pending.push(m.name.clone()),
            }
        }
        report
    }
}
