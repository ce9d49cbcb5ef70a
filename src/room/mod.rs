#![forbid(unsafe_code)]

// Room module - room lifecycle on top of the registry and the media engine.

pub mod cleanup;
pub mod program;
pub mod registry;
pub mod roles;

use crate::error::{SignalError, SignalResult};
use crate::media::{EngineEvent, EngineEventReceiver, MediaEngine, TransportInfo};
use crate::metrics::ServerMetrics;
use crate::turn::{IceServer, IceServerProvider};
use registry::{Evicted, Registry, RoomView, TransportEntry};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest accepted room id, in characters
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Transport descriptor returned to the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    #[serde(flatten)]
    pub transport: TransportInfo,
    pub ice_servers: Vec<IceServer>,
}

pub fn validate_room_id(room_id: &str) -> SignalResult<()> {
    let len = room_id.chars().count();
    if len == 0 || len > MAX_ROOM_ID_LEN {
        return Err(SignalError::BadRequest(format!(
            "room id must be 1 to {MAX_ROOM_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Creates rooms on first reference and tears them down at shutdown.
/// Rooms are never removed just because they become empty.
pub struct RoomManager {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<Registry>,
    ice_servers: Arc<dyn IceServerProvider>,
    metrics: ServerMetrics,
    default_room_id: String,
}

impl RoomManager {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        ice_servers: Arc<dyn IceServerProvider>,
        metrics: ServerMetrics,
        default_room_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            registry: Arc::new(Registry::new()),
            ice_servers,
            metrics,
            default_room_id: default_room_id.into(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn engine(&self) -> &dyn MediaEngine {
        self.engine.as_ref()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn default_room_id(&self) -> &str {
        &self.default_room_id
    }

    /// Returns the room, creating its router on first reference.
    /// An engine failure leaves the room absent so a later call can retry.
    pub async fn ensure_room(&self, room_id: &str) -> SignalResult<RoomView> {
        validate_room_id(room_id)?;
        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        self.registry
            .get_or_create_room(room_id, || async move {
                let router = engine.create_router(room_id).await.map_err(|e| {
                    warn!("Router creation failed for room {}: {}", room_id, e);
                    SignalError::engine("createRouter", e)
                })?;
                metrics.inc_rooms_created();
                Ok(router)
            })
            .await
    }

    /// Creates a WebRTC transport in `room_id` owned by `connection_id`.
    pub async fn create_webrtc_endpoint(&self, connection_id: &str, room_id: &str) -> SignalResult<TransportDescriptor> {
        let room = self.ensure_room(room_id).await?;

        let transport = self
            .engine
            .create_webrtc_transport(
                &room.router_id,
                json!({ "socketId": connection_id, "roomId": room_id }),
            )
            .await
            .map_err(|e| SignalError::engine("createWebRtcTransport", e))?;

        let entry = TransportEntry {
            id: transport.id.clone(),
            room_id: room_id.to_string(),
            connection_id: connection_id.to_string(),
        };
        if let Err(e) = self.registry.insert_transport(entry) {
            // Room was torn down while the engine call was in flight
            self.engine.close_transport(&transport.id);
            return Err(e);
        }

        let ice_servers = self.ice_servers.ice_servers(connection_id).await;
        info!(
            "Created transport {} in room {} for connection {}",
            transport.id, room_id, connection_id
        );
        Ok(TransportDescriptor { transport, ice_servers })
    }

    /// Closes a room's router and evicts the room. Returns false if it did not exist.
    pub fn teardown_room(&self, room_id: &str) -> bool {
        match self.registry.remove_room(room_id) {
            Some((room, evicted)) => {
                self.engine.close_router(&room.router_id);
                info!(
                    "Tore down room {} ({} transports, {} producers, {} consumers)",
                    room_id,
                    evicted.transports.len(),
                    evicted.producers.len(),
                    evicted.consumers.len()
                );
                true
            }
            None => false,
        }
    }

    /// Tears down every room and stops the engine
    pub async fn shutdown(&self) {
        let rooms = self.registry.room_ids();
        info!("Shutting down {} rooms", rooms.len());
        for room_id in rooms {
            self.teardown_room(&room_id);
        }
        self.engine.shutdown().await;
    }

    /// Applies one engine lifecycle event to the registry.
    /// Returns true when the event is fatal to the process.
    pub fn apply_engine_event(&self, event: EngineEvent) -> bool {
        let evicted = match event {
            EngineEvent::TransportClosed { transport_id } => self.registry.remove_transport(&transport_id),
            EngineEvent::ProducerTransportClosed { producer_id } => self.registry.remove_producer(&producer_id),
            EngineEvent::ConsumerTransportClosed { consumer_id }
            | EngineEvent::ConsumerProducerClosed { consumer_id } => self.registry.remove_consumer(&consumer_id),
            EngineEvent::WorkerDied { reason } => {
                error!("Media worker died: {}", reason);
                return true;
            }
        };
        self.release_evicted(&evicted);
        false
    }

    /// Drops the engine handles of entries the registry evicted by cascade
    fn release_evicted(&self, evicted: &Evicted) {
        if evicted.is_empty() {
            return;
        }
        for consumer in &evicted.consumers {
            self.engine.close_consumer(&consumer.id);
        }
        for producer in &evicted.producers {
            self.engine.close_producer(&producer.id);
        }
        for transport in &evicted.transports {
            self.engine.close_transport(&transport.id);
        }
        debug!(
            "Evicted {} transports, {} producers, {} consumers after engine closure",
            evicted.transports.len(),
            evicted.producers.len(),
            evicted.consumers.len()
        );
    }

    /// Drains engine events until shutdown. A dead worker tears down every
    /// room and cancels `shutdown` so the server stops.
    pub fn spawn_engine_events(
        self: &Arc<Self>,
        mut events: EngineEventReceiver,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if manager.apply_engine_event(event) {
                    manager.shutdown().await;
                    shutdown.cancel();
                    break;
                }
            }
            debug!("Engine event loop finished");
        })
    }
}
