#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Engine-assigned identifiers. The core never interprets them.
pub type RouterId = String;
pub type TransportId = String;
pub type ProducerId = String;
pub type ConsumerId = String;

/// Custom error type for media engine operations
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Media worker died: {0}")]
    WorkerDied(String),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Router created for a room
#[derive(Debug, Clone)]
pub struct RouterInfo {
    pub id: RouterId,
    pub rtp_capabilities: Value,
}

/// Transport information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Consumer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}
