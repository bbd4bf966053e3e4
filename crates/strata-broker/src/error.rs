//! Transport errors for the broker.
//!
//! Anything that goes wrong on the wire becomes
//! [`StrataError::BrokerUnavailable`] once it reaches pipeline callers.

use strata_core::StrataError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("protocol version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("response '{found}' does not answer request '{expected}'")]
    Mismatch { expected: String, found: String },

    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, std::time::Duration),

    #[error("connection closed by peer")]
    Closed,
}

impl From<BrokerError> for StrataError {
    fn from(e: BrokerError) -> Self {
        StrataError::BrokerUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
