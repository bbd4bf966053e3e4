//! Broker server: owns the canonical [`SharedContext`] for a build and
//! answers pipeline requests from worker processes.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{BuildMetrics, PipelineService, SharedContext};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::endpoint::{BrokerEndpoint, IoBox, Listener};
use crate::error::Result;
use crate::protocol::{read_frame, write_frame, Envelope, RemoteError, Request, Response, PROTOCOL_VERSION};

/// Connections silent for this long are dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct BrokerServer {
    endpoint: BrokerEndpoint,
    listener: Listener,
    context: SharedContext,
    idle_timeout: Duration,
    metrics: Arc<BuildMetrics>,
}

impl BrokerServer {
    /// Bind the endpoint for `channel`. Fails if it cannot be created.
    pub fn bind(channel: &str, context: SharedContext) -> Result<Self> {
        let endpoint = BrokerEndpoint::for_channel(channel)?;
        let listener = Listener::bind(&endpoint)?;
        info!(endpoint = %endpoint, "broker listening");
        Ok(Self {
            endpoint,
            listener,
            context,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            metrics: Arc::new(BuildMetrics::new()),
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<BuildMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Accept connections until `shutdown` flips to `true` or its sender is
    /// dropped. Each connection is served on its own task.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok(io) => {
                            let context = self.context.clone();
                            let metrics = Arc::clone(&self.metrics);
                            let idle = self.idle_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(io, context, metrics, idle).await {
                                    warn!(error = %e, "broker connection ended with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(
            endpoint = %self.endpoint,
            requests = self.metrics.broker_requests(),
            "broker stopped"
        );
        Ok(())
    }
}

async fn handle_connection(
    mut io: IoBox,
    context: SharedContext,
    metrics: Arc<BuildMetrics>,
    idle: Duration,
) -> Result<()> {
    loop {
        let frame = match tokio::time::timeout(idle, read_frame::<_, Envelope<Request>>(&mut io)).await {
            Err(_) => {
                warn!(idle_secs = idle.as_secs(), "dropping idle worker connection");
                return Ok(());
            }
            Ok(frame) => frame?,
        };
        let Some(request) = frame else {
            debug!("worker disconnected");
            return Ok(());
        };
        metrics.inc_broker_requests();

        let Envelope { version, id, body } = request;
        let response = if version != PROTOCOL_VERSION {
            Response::Error {
                error: RemoteError::Rejected {
                    message: format!(
                        "protocol version {version} is not supported (expected {PROTOCOL_VERSION})"
                    ),
                },
            }
        } else {
            debug!(op = body.op(), id = %id, "broker request");
            dispatch(&context, body).await
        };
        let reply = Envelope {
            version: PROTOCOL_VERSION,
            id,
            body: response,
        };
        write_frame(&mut io, &reply).await?;
    }
}

/// Apply one request to the context.
pub async fn dispatch(context: &SharedContext, request: Request) -> Response {
    let result = match request {
        Request::Ping => Ok(Response::Pong {
            server_version: strata_core::VERSION.to_string(),
        }),
        Request::GetContext => context.get_context().await.map(|c| Response::Context {
            context: Box::new(c),
        }),
        Request::Publish { context: next } => context
            .publish(*next)
            .await
            .map(|version| Response::Published { version }),
        Request::PutVariable { scope, key, value } => context
            .put_variable(&scope, &key, &value)
            .await
            .map(|()| Response::Done),
        Request::GetVariable { scope, key } => context
            .get_variable(&scope, &key)
            .await
            .map(|value| Response::Variable { value }),
        Request::RecordProjectOutputs { snapshot } => context
            .record_project_outputs(snapshot)
            .await
            .map(|()| Response::Done),
        Request::GetAllProjectOutputs => context
            .get_all_project_outputs()
            .await
            .map(|outputs| Response::ProjectOutputs { outputs }),
        Request::RecordArtifact { publisher, id, files } => context
            .record_artifact(&publisher, &id, files)
            .await
            .map(|manifest| Response::Artifact { manifest }),
        Request::GetAssociatedArtifacts => context
            .get_associated_artifacts()
            .await
            .map(|manifests| Response::Artifacts { manifests }),
        Request::ResetProjectOutputs { project_file } => context
            .reset_project_outputs(&project_file)
            .await
            .map(|existed| Response::Reset { existed }),
    };
    result.unwrap_or_else(|e| Response::Error {
        error: RemoteError::from(&e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ProjectOutputSnapshot;

    #[tokio::test]
    async fn dispatch_records_and_reports_double_writes() {
        let ctx = SharedContext::default();
        let record = || Request::RecordProjectOutputs {
            snapshot: ProjectOutputSnapshot::new("src/a.proj", "g", "src"),
        };
        assert!(matches!(dispatch(&ctx, record()).await, Response::Done));
        match dispatch(&ctx, record()).await {
            Response::Error {
                error: RemoteError::DoubleWriteProject { project_file },
            } => assert_eq!(project_file, "src/a.proj"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_round_trips_variables() {
        let ctx = SharedContext::default();
        let put = Request::PutVariable {
            scope: "s".to_string(),
            key: "k".to_string(),
            value: "v".to_string(),
        };
        assert!(matches!(dispatch(&ctx, put).await, Response::Done));
        let get = Request::GetVariable {
            scope: "s".to_string(),
            key: "k".to_string(),
        };
        match dispatch(&ctx, get).await {
            Response::Variable { value } => assert_eq!(value.as_deref(), Some("v")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
