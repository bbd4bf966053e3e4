//! Pipeline service: the operations workers use to read and update the shared
//! build context.
//!
//! Implemented in process by [`SharedContext`] and out of process by the
//! broker client. Every call is atomic with respect to the aggregate; writes
//! to the same key are last-writer-wins.

use async_trait::async_trait;
use strata_state::ProjectOutputSnapshot;
use tracing::debug;

use crate::context::{ArtifactItem, ArtifactManifest, BuildOperationContext, SharedContext};
use crate::error::Result;

#[async_trait]
pub trait PipelineService: Send + Sync {
    /// Copy of the whole context.
    async fn get_context(&self) -> Result<BuildOperationContext>;

    /// Replace the whole context. Returns the new version.
    async fn publish(&self, context: BuildOperationContext) -> Result<u64>;

    async fn put_variable(&self, scope: &str, key: &str, value: &str) -> Result<()>;

    async fn get_variable(&self, scope: &str, key: &str) -> Result<Option<String>>;

    /// Record one project's outputs. Fails with a double-write error if the
    /// project was already recorded.
    async fn record_project_outputs(&self, snapshot: ProjectOutputSnapshot) -> Result<()>;

    async fn get_all_project_outputs(&self) -> Result<Vec<ProjectOutputSnapshot>>;

    async fn record_artifact(
        &self,
        publisher: &str,
        id: &str,
        files: Vec<ArtifactItem>,
    ) -> Result<ArtifactManifest>;

    async fn get_associated_artifacts(&self) -> Result<Vec<ArtifactManifest>>;

    /// Allow `project_file` to be recorded again. Returns whether a record
    /// existed.
    async fn reset_project_outputs(&self, project_file: &str) -> Result<bool>;
}

#[async_trait]
impl PipelineService for SharedContext {
    async fn get_context(&self) -> Result<BuildOperationContext> {
        Ok(self.snapshot().await)
    }

    async fn publish(&self, context: BuildOperationContext) -> Result<u64> {
        self.replace(context).await;
        Ok(self.with(|ctx| ctx.version).await)
    }

    async fn put_variable(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        debug!(scope, key, "put variable");
        self.with(|ctx| ctx.put_variable(scope, key, value)).await;
        Ok(())
    }

    async fn get_variable(&self, scope: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .with(|ctx| ctx.get_variable(scope, key).map(str::to_string))
            .await)
    }

    async fn record_project_outputs(&self, snapshot: ProjectOutputSnapshot) -> Result<()> {
        debug!(project = %snapshot.project_file, "record project outputs");
        self.with(|ctx| ctx.record_project_outputs(snapshot))
            .await
            .map_err(Into::into)
    }

    async fn get_all_project_outputs(&self) -> Result<Vec<ProjectOutputSnapshot>> {
        Ok(self.with(|ctx| ctx.all_project_outputs()).await)
    }

    async fn record_artifact(
        &self,
        publisher: &str,
        id: &str,
        files: Vec<ArtifactItem>,
    ) -> Result<ArtifactManifest> {
        Ok(self
            .with(|ctx| ctx.record_artifact(publisher, id, files))
            .await)
    }

    async fn get_associated_artifacts(&self) -> Result<Vec<ArtifactManifest>> {
        Ok(self.with(|ctx| ctx.associated_artifacts()).await)
    }

    async fn reset_project_outputs(&self, project_file: &str) -> Result<bool> {
        Ok(self
            .with(|ctx| ctx.reset_project_outputs(project_file))
            .await)
    }
}
