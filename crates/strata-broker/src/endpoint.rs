//! Local endpoints named by a broker channel.
//!
//! Unix domain socket under the temp dir on Unix, named pipe on Windows.

#[cfg(not(windows))]
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{BrokerError, Result};

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type IoBox = Box<dyn AsyncIo>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    #[cfg(windows)]
    NamedPipe(String),
    #[cfg(not(windows))]
    UnixSocket(PathBuf),
}

impl BrokerEndpoint {
    /// Endpoint for `channel`. Channel names are limited to ASCII
    /// alphanumerics, `-` and `_` so they are safe in paths and pipe names.
    pub fn for_channel(channel: &str) -> Result<Self> {
        let valid = !channel.is_empty()
            && channel
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BrokerError::InvalidChannel(channel.to_string()));
        }

        #[cfg(windows)]
        {
            Ok(Self::NamedPipe(format!(r"\\.\pipe\strata-{channel}")))
        }
        #[cfg(not(windows))]
        {
            Ok(Self::UnixSocket(
                std::env::temp_dir().join(format!("strata-{channel}.sock")),
            ))
        }
    }

    /// A fresh channel name for one build.
    pub fn new_channel() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(windows)]
            Self::NamedPipe(name) => write!(f, "{name}"),
            #[cfg(not(windows))]
            Self::UnixSocket(path) => write!(f, "{}", path.display()),
        }
    }
}

pub enum Listener {
    #[cfg(windows)]
    NamedPipe { name: String },
    #[cfg(not(windows))]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    pub fn bind(endpoint: &BrokerEndpoint) -> Result<Self> {
        #[cfg(windows)]
        {
            let BrokerEndpoint::NamedPipe(name) = endpoint;
            Ok(Self::NamedPipe { name: name.clone() })
        }

        #[cfg(not(windows))]
        {
            let BrokerEndpoint::UnixSocket(path) = endpoint;
            if path.exists() {
                // A stale socket from a crashed build blocks bind.
                std::fs::remove_file(path)?;
            }
            let listener = tokio::net::UnixListener::bind(path)?;
            Ok(Self::Unix {
                listener,
                path: path.clone(),
            })
        }
    }

    pub async fn accept(&self) -> Result<IoBox> {
        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ServerOptions;
            let Self::NamedPipe { name } = self;
            let server = ServerOptions::new().create(name)?;
            server.connect().await?;
            Ok(Box::new(server))
        }

        #[cfg(not(windows))]
        {
            let Self::Unix { listener, .. } = self;
            let (stream, _) = listener.accept().await?;
            Ok(Box::new(stream))
        }
    }
}

#[cfg(not(windows))]
impl Drop for Listener {
    fn drop(&mut self) {
        let Self::Unix { path, .. } = self;
        let _ = std::fs::remove_file(path);
    }
}

/// Open a client connection. Callers bound this with a timeout.
pub async fn connect(endpoint: &BrokerEndpoint) -> Result<IoBox> {
    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ClientOptions;
        let BrokerEndpoint::NamedPipe(name) = endpoint;
        loop {
            match ClientOptions::new().open(name) {
                Ok(client) => return Ok(Box::new(client)),
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
            }
        }
    }

    #[cfg(not(windows))]
    {
        let BrokerEndpoint::UnixSocket(path) = endpoint;
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Box::new(stream))
    }
}
