//! Worker-side broker client.
//!
//! One connection per client; calls are serialized over it. Every call is
//! bounded by the client timeout and any transport failure surfaces as
//! [`StrataError::BrokerUnavailable`]. A call that fails mid-exchange may
//! leave a reply in flight, so the connection is dropped and the next call
//! opens a fresh one.

use std::time::Duration;

use async_trait::async_trait;
use strata_core::{
    ArtifactItem, ArtifactManifest, BuildOperationContext, PipelineService, ProjectOutputSnapshot,
    Result, StrataError, BROKER_CHANNEL_ENV,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::endpoint::{connect, BrokerEndpoint, IoBox};
use crate::error::BrokerError;
use crate::protocol::{read_frame, write_frame, Envelope, Request, Response, PROTOCOL_VERSION};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BrokerClient {
    channel: String,
    endpoint: BrokerEndpoint,
    /// `None` after a failed exchange until the next call reconnects.
    io: Mutex<Option<IoBox>>,
    timeout: Duration,
}

async fn open(endpoint: &BrokerEndpoint, timeout: Duration) -> Result<IoBox> {
    tokio::time::timeout(timeout, connect(endpoint))
        .await
        .map_err(|_| BrokerError::Timeout("connect", timeout))?
        .map_err(|e| StrataError::BrokerUnavailable(format!("{endpoint}: {e}")))
}

impl BrokerClient {
    /// Connect to the broker serving `channel`.
    pub async fn connect(channel: &str, timeout: Duration) -> Result<Self> {
        let endpoint = BrokerEndpoint::for_channel(channel)?;
        let io = open(&endpoint, timeout).await?;
        debug!(channel, "connected to broker");
        Ok(Self {
            channel: channel.to_string(),
            endpoint,
            io: Mutex::new(Some(io)),
            timeout,
        })
    }

    /// Connect to the channel named by `STRATA_BROKER_CHANNEL`.
    pub async fn from_env(timeout: Duration) -> Result<Self> {
        let channel = std::env::var(BROKER_CHANNEL_ENV).map_err(|_| {
            StrataError::BrokerUnavailable(format!("{BROKER_CHANNEL_ENV} is not set"))
        })?;
        Self::connect(&channel, timeout).await
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Check the broker is alive; returns its version string.
    pub async fn ping(&self) -> Result<String> {
        match self.call(Request::Ping).await? {
            Response::Pong { server_version } => Ok(server_version),
            other => Err(unexpected("ping", &other)),
        }
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let op = request.op();
        let envelope = Envelope::new(request);
        let request_id = envelope.id.clone();
        let mut slot = self.io.lock().await;
        if slot.is_none() {
            debug!(channel = %self.channel, "reconnecting to broker");
            *slot = Some(open(&self.endpoint, self.timeout).await?);
        }
        let Some(io) = slot.as_mut() else {
            return Err(BrokerError::Closed.into());
        };

        let exchange = async move {
            write_frame(&mut **io, &envelope).await?;
            read_frame::<_, Envelope<Response>>(&mut **io)
                .await?
                .ok_or(BrokerError::Closed)
        };
        let outcome = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(op, self.timeout)),
        };
        let checked = outcome.and_then(|reply| {
            if reply.version != PROTOCOL_VERSION {
                return Err(BrokerError::Version {
                    found: reply.version,
                    expected: PROTOCOL_VERSION,
                });
            }
            if reply.id != request_id {
                return Err(BrokerError::Mismatch {
                    expected: request_id.clone(),
                    found: reply.id,
                });
            }
            Ok(reply)
        });
        let reply = match checked {
            Ok(reply) => reply,
            Err(e) => {
                warn!(channel = %self.channel, op, error = %e, "dropping broker connection");
                *slot = None;
                return Err(e.into());
            }
        };

        match reply.body {
            Response::Error { error } => Err(error.into()),
            body => Ok(body),
        }
    }
}

fn unexpected(op: &str, response: &Response) -> StrataError {
    StrataError::BrokerRejected(format!("unexpected '{}' response to {op}", response.kind()))
}

#[async_trait]
impl PipelineService for BrokerClient {
    async fn get_context(&self) -> Result<BuildOperationContext> {
        match self.call(Request::GetContext).await? {
            Response::Context { context } => Ok(*context),
            other => Err(unexpected("get_context", &other)),
        }
    }

    async fn publish(&self, context: BuildOperationContext) -> Result<u64> {
        let request = Request::Publish {
            context: Box::new(context),
        };
        match self.call(request).await? {
            Response::Published { version } => Ok(version),
            other => Err(unexpected("publish", &other)),
        }
    }

    async fn put_variable(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        let request = Request::PutVariable {
            scope: scope.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.call(request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected("put_variable", &other)),
        }
    }

    async fn get_variable(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let request = Request::GetVariable {
            scope: scope.to_string(),
            key: key.to_string(),
        };
        match self.call(request).await? {
            Response::Variable { value } => Ok(value),
            other => Err(unexpected("get_variable", &other)),
        }
    }

    async fn record_project_outputs(&self, snapshot: ProjectOutputSnapshot) -> Result<()> {
        match self.call(Request::RecordProjectOutputs { snapshot }).await? {
            Response::Done => Ok(()),
            other => Err(unexpected("record_project_outputs", &other)),
        }
    }

    async fn get_all_project_outputs(&self) -> Result<Vec<ProjectOutputSnapshot>> {
        match self.call(Request::GetAllProjectOutputs).await? {
            Response::ProjectOutputs { outputs } => Ok(outputs),
            other => Err(unexpected("get_all_project_outputs", &other)),
        }
    }

    async fn record_artifact(
        &self,
        publisher: &str,
        id: &str,
        files: Vec<ArtifactItem>,
    ) -> Result<ArtifactManifest> {
        let request = Request::RecordArtifact {
            publisher: publisher.to_string(),
            id: id.to_string(),
            files,
        };
        match self.call(request).await? {
            Response::Artifact { manifest } => Ok(manifest),
            other => Err(unexpected("record_artifact", &other)),
        }
    }

    async fn get_associated_artifacts(&self) -> Result<Vec<ArtifactManifest>> {
        match self.call(Request::GetAssociatedArtifacts).await? {
            Response::Artifacts { manifests } => Ok(manifests),
            other => Err(unexpected("get_associated_artifacts", &other)),
        }
    }

    async fn reset_project_outputs(&self, project_file: &str) -> Result<bool> {
        let request = Request::ResetProjectOutputs {
            project_file: project_file.to_string(),
        };
        match self.call(request).await? {
            Response::Reset { existed } => Ok(existed),
            other => Err(unexpected("reset_project_outputs", &other)),
        }
    }
}
