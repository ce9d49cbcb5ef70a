#![forbid(unsafe_code)]

// Errors surfaced to signaling clients. Every variant becomes an
// `{ "error": message }` reply; none of them ends the connection.

use crate::media::MediaError;
use crate::room::roles::Role;
use thiserror::Error;

/// Registry entity a lookup failed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Room,
    Transport,
    /// No transport is owned by the given connection
    ConnectionTransport,
    Producer,
    Consumer,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Room => "Room",
            ResourceKind::Transport => "Transport",
            ResourceKind::ConnectionTransport => "Transport for connection",
            ResourceKind::Producer => "Producer",
            ResourceKind::Consumer => "Consumer",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum SignalError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Unauthorized: requires {required} role")]
    Unauthorized { required: Role },

    #[error("Media engine failure during {operation}: {cause}")]
    EngineFailure { operation: &'static str, cause: String },

    #[error("Cannot consume - incompatible RTP capabilities")]
    InvalidCapabilities,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded: max {per_second} messages/second")]
    RateLimited { per_second: u64 },
}

impl SignalError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Wraps an engine error with the operation that failed
    pub fn engine(operation: &'static str, cause: MediaError) -> Self {
        Self::EngineFailure {
            operation,
            cause: cause.to_string(),
        }
    }

    /// Short machine-readable tag for logs and metrics
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::NotFound { .. } => "not_found",
            SignalError::Unauthorized { .. } => "unauthorized",
            SignalError::EngineFailure { .. } => "engine_failure",
            SignalError::InvalidCapabilities => "invalid_capabilities",
            SignalError::BadRequest(_) => "bad_request",
            SignalError::RateLimited { .. } => "rate_limited",
        }
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
