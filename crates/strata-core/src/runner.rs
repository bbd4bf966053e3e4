//! Command-line module builder.
//!
//! Runs the configured build command in each module directory. The child
//! sees the broker channel and the module it is building in its environment,
//! so it can report outputs itself with `strata worker record`. Projects the
//! child did not record get a bare snapshot after a successful exit.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use strata_state::{normalize_key, ProjectOutputSnapshot};
use tokio::process::Command;
use tracing::debug;

use crate::config::{BuildConfig, BROKER_CHANNEL_ENV};
use crate::error::{ConfigError, Result};
use crate::executor::{BuildOutcome, ModuleBuilder};
use crate::pipeline::PipelineService;
use crate::plan::PlannedModule;

/// Environment variable naming the module being built.
pub const MODULE_ENV: &str = "STRATA_MODULE";
/// Environment variable holding the module directory.
pub const MODULE_DIR_ENV: &str = "STRATA_MODULE_DIR";
/// Environment variable listing the module's project files, `;`-separated.
pub const PROJECTS_ENV: &str = "STRATA_PROJECTS";

/// Lines of stderr kept in a failure message.
const STDERR_TAIL: usize = 20;

/// Stable project guid derived from the normalized project path.
pub fn project_guid(project_file: &str) -> String {
    let digest = Sha256::digest(normalize_key(project_file).as_bytes());
    hex::encode(&digest[..16])
}

pub struct CommandModuleBuilder {
    root: PathBuf,
    command: Vec<String>,
    channel: Option<String>,
}

impl CommandModuleBuilder {
    pub fn new(root: impl Into<PathBuf>, command: Vec<String>, channel: Option<String>) -> Self {
        Self {
            root: root.into(),
            command,
            channel,
        }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(
            config.root.clone(),
            config.build_command.clone(),
            config.broker_channel.clone(),
        )
    }
}

#[async_trait]
impl ModuleBuilder for CommandModuleBuilder {
    async fn build(
        &self,
        module: &PlannedModule,
        pipeline: Arc<dyn PipelineService>,
    ) -> Result<BuildOutcome> {
        let Some((exe, args)) = self.command.split_first() else {
            return Err(ConfigError::InvalidConfig("build_command is empty".to_string()).into());
        };

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .current_dir(self.root.join(&module.directory))
            .env(MODULE_ENV, &module.name)
            .env(MODULE_DIR_ENV, &module.directory)
            .env(PROJECTS_ENV, module.project_files.join(";"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(channel) = &self.channel {
            cmd.env(BROKER_CHANNEL_ENV, channel);
        }

        debug!(module = %module.name, command = %self.command.join(" "), "spawning build");
        let output = cmd.spawn()?.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Ok(BuildOutcome::failed(format!("exit {code}: {tail}")));
        }

        let recorded: Vec<String> = pipeline
            .get_all_project_outputs()
            .await?
            .iter()
            .map(ProjectOutputSnapshot::key)
            .collect();
        let outputs = module
            .project_files
            .iter()
            .filter(|p| !recorded.contains(&normalize_key(p)))
            .map(|p| ProjectOutputSnapshot::new(p.clone(), project_guid(p), module.directory.clone()))
            .collect();
        Ok(BuildOutcome::succeeded(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedContext;

    fn module(dir: &str) -> PlannedModule {
        PlannedModule {
            name: "Core".to_string(),
            directory: dir.to_string(),
            bucket: None,
            project_files: vec![format!("{dir}/Core.proj"), format!("{dir}/Tests.proj")],
            orchestration_nodes: Vec::new(),
            forced: false,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn success_yields_snapshots_for_unrecorded_projects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/Core")).unwrap();
        let shared = SharedContext::default();
        shared
            .record_project_outputs(ProjectOutputSnapshot::new("src/Core/Tests.proj", "g", "src/Core"))
            .await
            .unwrap();

        let builder = CommandModuleBuilder::new(
            dir.path(),
            sh("test \"$STRATA_MODULE\" = Core && test \"$STRATA_BROKER_CHANNEL\" = chan"),
            Some("chan".to_string()),
        );
        let outcome = builder
            .build(&module("src/Core"), Arc::new(shared))
            .await
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.message);
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(outcome.outputs[0].project_file, "src/Core/Core.proj");
        assert_eq!(outcome.outputs[0].project_guid, project_guid("SRC/core/core.proj"));
    }

    #[tokio::test]
    async fn failure_carries_exit_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("m")).unwrap();
        let builder = CommandModuleBuilder::new(dir.path(), sh("echo boom >&2; exit 3"), None);
        let outcome = builder
            .build(&module("m"), Arc::new(SharedContext::default()))
            .await
            .unwrap();
        assert!(!outcome.success);
        let msg = outcome.message.unwrap();
        assert!(msg.contains("exit 3"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test]
    async fn empty_command_is_a_config_error() {
        let builder = CommandModuleBuilder::new(".", Vec::new(), None);
        let err = builder
            .build(&module("."), Arc::new(SharedContext::default()))
            .await
            .unwrap_err();
        assert!(err.is_fatal_config());
    }
}
