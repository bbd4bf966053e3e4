//! Strata Broker
//!
//! Serves the shared build context to worker processes over a local channel
//! (Unix domain socket or named pipe) and provides the matching client,
//! which implements [`strata_core::PipelineService`].

pub mod client;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{BrokerClient, DEFAULT_TIMEOUT};
pub use endpoint::BrokerEndpoint;
pub use error::{BrokerError, Result};
pub use protocol::{Envelope, RemoteError, Request, Response, PROTOCOL_VERSION};
pub use server::{BrokerServer, DEFAULT_IDLE_TIMEOUT};
