#![forbid(unsafe_code)]

// Media module - control-plane seam to the media routing engine.
// The engine owns codecs, ICE/DTLS and RTP forwarding; the core only issues
// commands by id and receives opaque descriptors back.

pub mod config;
#[cfg(test)]
pub mod fake;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;
pub mod types;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use types::{
    ConsumerId, ConsumerInfo, MediaError, MediaKind, MediaResult, ProducerId, RouterId,
    RouterInfo, TransportId, TransportInfo,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Lifecycle notifications emitted by the engine.
///
/// The engine guarantees cascade closure: closing a transport closes every
/// producer and consumer created on it, and closing a producer closes every
/// consumer bound to it. Each closure is reported here so the registry can
/// evict the matching entries. Events for ids the registry no longer knows
/// are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TransportClosed { transport_id: TransportId },
    ProducerTransportClosed { producer_id: ProducerId },
    ConsumerTransportClosed { consumer_id: ConsumerId },
    ConsumerProducerClosed { consumer_id: ConsumerId },
    /// The engine's worker process is gone. Fatal to the whole service.
    WorkerDied { reason: String },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Creates the channel an engine reports lifecycle events on.
pub fn engine_events() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

/// Control-plane commands the core issues to the media routing engine.
///
/// Every `close_*` call is idempotent: closing an id the engine already
/// closed (or never knew) is a no-op.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a router with the configured codec set for `room_id`.
    async fn create_router(&self, room_id: &str) -> MediaResult<RouterInfo>;

    /// Closes a router and, by cascade, everything created on it.
    fn close_router(&self, router_id: &str);

    /// Creates a WebRTC transport on a router with the fixed transport config.
    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        app_data: Value,
    ) -> MediaResult<TransportInfo>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    /// Starts receiving media from the client on a transport.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> MediaResult<ProducerId>;

    /// Whether `rtp_capabilities` can consume `producer_id` on `router_id`.
    fn can_consume(&self, router_id: &str, producer_id: &str, rtp_capabilities: &Value) -> bool;

    /// Creates an unpaused consumer of `producer_id` on `transport_id`.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
        app_data: Value,
    ) -> MediaResult<ConsumerInfo>;

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()>;

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()>;

    fn close_transport(&self, transport_id: &str);

    fn close_producer(&self, producer_id: &str);

    fn close_consumer(&self, consumer_id: &str);

    /// Resource usage of the engine's worker, for diagnostics.
    async fn worker_stats(&self) -> MediaResult<Value>;

    /// Closes every router and stops the worker.
    async fn shutdown(&self);
}
