//! Server-level error types.

use thiserror::Error;
use waypoint_net::NetError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<NetError> for ServerError {
    fn from(e: NetError) -> Self {
        ServerError::Network(e.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Network(e.to_string())
    }
}
