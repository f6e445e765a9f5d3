use std::process::ExitCode;

use crate::config::ConfigError;
use crate::handshake::HandshakeError;
use crate::retry::RetryError;

/// Terminal errors that end supervision, each mapped to a process exit code.
///
/// Broker-down is recovered inside the supervisor loop and never reaches this
/// type; everything else does.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{what}: {source}")]
    RetriesExhausted {
        what: &'static str,
        #[source]
        source: RetryError,
    },

    #[error("handshake failed: {0}")]
    Handshake(HandshakeError),

    #[error("inbound message too large for receive buffer (limit {limit} bytes)")]
    MessageTooLarge { limit: usize },

    #[error("failed to start runner process `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to terminate unhealthy runner process: {0}")]
    KillFailed(#[source] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<HandshakeError> for LaunchError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::MessageTooLarge { limit } => Self::MessageTooLarge { limit },
            other => Self::Handshake(other),
        }
    }
}

impl LaunchError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) => ExitCode::from(2),
            Self::RetriesExhausted { .. } => ExitCode::from(3),
            Self::Handshake(_) => ExitCode::from(4),
            Self::Spawn { .. } => ExitCode::from(5),
            Self::KillFailed(_) => ExitCode::from(6),
            Self::MessageTooLarge { .. } => ExitCode::from(7),
            Self::Other(_) => ExitCode::from(1),
        }
    }
}
