//! Gateway error types
//!
//! Every stage of request handling returns one of these. The gateway turns
//! them into HTTP responses at a single point.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No backend for the routed name
    #[error("Host not found for '{0}'")]
    NotFound(String),

    /// Unusable configuration, e.g. forwarding without a credential
    #[error("{0}")]
    Config(String),

    /// Private key could not be loaded or parsed
    #[error("Can't import private key: {0}")]
    Auth(String),

    /// SSH dial, handshake, authentication or channel failure
    #[error("Can't create ssh tunnel: {0}")]
    Tunnel(String),

    /// Upstream round trip failed
    #[error("Request to {address} has been failed: {reason}")]
    Forward { address: String, reason: String },

    /// gzip transcoding of an HTML body failed
    #[error("Can't write to response: {0}")]
    Rewrite(String),

    /// Anything that escaped the pipeline without a designated kind
    #[error("{0}")]
    UnknownFault(String),
}

impl GatewayError {
    /// HTTP status reported to the caller
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            _ => 500,
        }
    }

    pub(crate) fn forward(address: &str, reason: impl std::fmt::Display) -> Self {
        GatewayError::Forward {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
