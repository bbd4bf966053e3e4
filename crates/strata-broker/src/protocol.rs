//! Wire protocol: length-prefixed JSON envelopes.
//!
//! Each frame is a big-endian `u32` byte count followed by one JSON
//! [`Envelope`]. A response echoes the id of the request it answers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_core::{
    ArtifactItem, ArtifactManifest, BuildOperationContext, ConfigError, DoubleWriteConflict,
    DoubleWriteError, ProjectOutputSnapshot, StrataError,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BrokerError, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame; a full context with many outputs stays
/// well below it.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub id: String,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    GetContext,
    Publish {
        context: Box<BuildOperationContext>,
    },
    PutVariable {
        scope: String,
        key: String,
        value: String,
    },
    GetVariable {
        scope: String,
        key: String,
    },
    RecordProjectOutputs {
        snapshot: ProjectOutputSnapshot,
    },
    GetAllProjectOutputs,
    RecordArtifact {
        publisher: String,
        id: String,
        files: Vec<ArtifactItem>,
    },
    GetAssociatedArtifacts,
    ResetProjectOutputs {
        project_file: String,
    },
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::GetContext => "get_context",
            Request::Publish { .. } => "publish",
            Request::PutVariable { .. } => "put_variable",
            Request::GetVariable { .. } => "get_variable",
            Request::RecordProjectOutputs { .. } => "record_project_outputs",
            Request::GetAllProjectOutputs => "get_all_project_outputs",
            Request::RecordArtifact { .. } => "record_artifact",
            Request::GetAssociatedArtifacts => "get_associated_artifacts",
            Request::ResetProjectOutputs { .. } => "reset_project_outputs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Pong { server_version: String },
    Context { context: Box<BuildOperationContext> },
    Published { version: u64 },
    Done,
    Variable { value: Option<String> },
    ProjectOutputs { outputs: Vec<ProjectOutputSnapshot> },
    Artifact { manifest: ArtifactManifest },
    Artifacts { manifests: Vec<ArtifactManifest> },
    Reset { existed: bool },
    Error { error: RemoteError },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Pong { .. } => "pong",
            Response::Context { .. } => "context",
            Response::Published { .. } => "published",
            Response::Done => "done",
            Response::Variable { .. } => "variable",
            Response::ProjectOutputs { .. } => "project_outputs",
            Response::Artifact { .. } => "artifact",
            Response::Artifacts { .. } => "artifacts",
            Response::Reset { .. } => "reset",
            Response::Error { .. } => "error",
        }
    }
}

/// Error raised by the server while handling a request.
///
/// Double writes keep their full listing so the worker fails with the same
/// typed error it would get in process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    DoubleWriteDestinations { conflicts: Vec<DoubleWriteConflict> },
    DoubleWriteProject { project_file: String },
    Config { message: String },
    Rejected { message: String },
}

impl From<&StrataError> for RemoteError {
    fn from(e: &StrataError) -> Self {
        match e {
            StrataError::DoubleWrite(DoubleWriteError::Destinations { conflicts }) => {
                RemoteError::DoubleWriteDestinations {
                    conflicts: conflicts.clone(),
                }
            }
            StrataError::DoubleWrite(DoubleWriteError::ProjectOutputs { project_file }) => {
                RemoteError::DoubleWriteProject {
                    project_file: project_file.clone(),
                }
            }
            StrataError::Config(c) => RemoteError::Config {
                message: c.to_string(),
            },
            other => RemoteError::Rejected {
                message: other.to_string(),
            },
        }
    }
}

impl From<RemoteError> for StrataError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::DoubleWriteDestinations { conflicts } => {
                DoubleWriteError::Destinations { conflicts }.into()
            }
            RemoteError::DoubleWriteProject { project_file } => {
                DoubleWriteError::ProjectOutputs { project_file }.into()
            }
            RemoteError::Config { message } => ConfigError::InvalidConfig(message).into(),
            RemoteError::Rejected { message } => StrataError::BrokerRejected(message),
        }
    }
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(io: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(BrokerError::FrameTooLarge {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }
    io.write_u32(bytes.len() as u32).await?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

/// Read one frame. `None` means the peer closed the stream between frames.
pub async fn read_frame<R, T>(io: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let len = match io.read_u32().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(BrokerError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Envelope::new(Request::PutVariable {
            scope: "plan".to_string(),
            key: "k".to_string(),
            value: "v".to_string(),
        });
        write_frame(&mut a, &sent).await.unwrap();
        let got: Envelope<Request> = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got.id, sent.id);
        assert_eq!(got.body.op(), "put_variable");
    }

    #[tokio::test]
    async fn eof_between_frames_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Option<Envelope<Request>> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(u32::MAX).await.unwrap();
        let err = read_frame::<_, Envelope<Request>>(&mut b).await.unwrap_err();
        assert!(matches!(err, BrokerError::FrameTooLarge { .. }));
    }

    #[test]
    fn wire_shape_is_tagged() {
        let json = serde_json::to_value(Request::GetVariable {
            scope: "s".to_string(),
            key: "k".to_string(),
        })
        .unwrap();
        assert_eq!(json["op"], "get_variable");
        let json = serde_json::to_value(Response::Error {
            error: RemoteError::DoubleWriteProject {
                project_file: "a.proj".to_string(),
            },
        })
        .unwrap();
        assert_eq!(json["result"], "error");
        assert_eq!(json["error"]["kind"], "double_write_project");
    }

    #[test]
    fn double_writes_stay_typed_across_the_wire() {
        let original: StrataError = DoubleWriteError::Destinations {
            conflicts: vec![DoubleWriteConflict {
                destination: "out/x".to_string(),
                sources: vec!["a".to_string(), "b".to_string()],
            }],
        }
        .into();
        let remote = RemoteError::from(&original);
        let json = serde_json::to_string(&remote).unwrap();
        let back: StrataError = serde_json::from_str::<RemoteError>(&json).unwrap().into();
        assert_eq!(back.to_string(), original.to_string());
        assert!(matches!(back, StrataError::DoubleWrite(_)));
    }
}
