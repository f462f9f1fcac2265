use crate::session::SessionError;
use std::fmt;
use thiserror::Error;

/// Why the forwarding loop forced a rebuild against the default relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    /// Too many consecutive idle rebuilds against the current relay
    ReconnectCeiling,
    /// Sustained high host resource usage
    ResourcePressure,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::ReconnectCeiling => f.write_str("reconnect attempts were exhausted"),
            RebuildReason::ResourcePressure => f.write_str("sustained high resource usage"),
        }
    }
}

/// Errors that stop the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Initial handshake failed: {0}")]
    InitialHandshake(#[source] SessionError),

    #[error("Forced rebuild after {reason} failed: {source}")]
    ForcedRebuild {
        reason: RebuildReason,
        source: SessionError,
    },

    #[error("Failed to open forwarding socket: {0}")]
    ForwardSocket(#[source] std::io::Error),

    #[error("Gateway task ended abnormally: {0}")]
    Task(String),
}
