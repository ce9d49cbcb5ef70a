#![forbid(unsafe_code)]

// Disconnect cleanup - closes and evicts everything a connection owned.

use super::registry::Evicted;
use super::roles::Role;
use super::RoomManager;
use crate::signaling::peers::PeerDirectory;
use crate::signaling::protocol::ServerEvent;
use tracing::{debug, info};

/// Releases every resource owned by `connection_id` and notifies its room
/// and the admins. Closing a transport in the engine closes the producers and
/// consumers created on it, so only transports are closed explicitly.
///
/// Safe to call more than once; later calls find nothing and send nothing.
pub fn connection_lost(rooms: &RoomManager, peers: &PeerDirectory, connection_id: &str) -> Evicted {
    let peer = peers.unregister(connection_id);

    let mut released = Evicted::default();
    for transport_id in rooms.registry().find_transports_by_connection(connection_id) {
        rooms.engine().close_transport(&transport_id);
        let evicted = rooms.registry().remove_transport(&transport_id);
        released.transports.extend(evicted.transports);
        released.producers.extend(evicted.producers);
        released.consumers.extend(evicted.consumers);
    }

    let Some(peer) = peer else {
        debug!("Cleanup for {} found no live connection", connection_id);
        return released;
    };

    let event = ServerEvent::PeerDisconnected {
        socket_id: connection_id.to_string(),
    };
    if let Some(room_id) = peer.room_id.as_deref() {
        peers.broadcast_to_room_except(room_id, connection_id, &event);
    }
    peers.broadcast_to_role(Role::Admin, &event);

    info!(
        "Cleaned up connection {} ({}, {} transports, {} producers, {} consumers)",
        connection_id,
        peer.role,
        released.transports.len(),
        released.producers.len(),
        released.consumers.len()
    );
    released
}
