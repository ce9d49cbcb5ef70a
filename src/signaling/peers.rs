#![forbid(unsafe_code)]

// Directory of live connections used for targeted sends and fan-out.
// Each entry holds the connection's outbound queue plus its role and room,
// which are the only things fan-out filters on.
//
// Program state sent to operators must not be lost. An operator whose queue
// is full is closed instead, so it reconnects and catches up.

use super::protocol::ServerEvent;
use crate::room::roles::Role;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound handle of one connection
#[derive(Clone)]
pub struct Peer {
    pub sender: mpsc::Sender<Arc<String>>,
    pub role: Role,
    pub room_id: Option<String>,
    /// Cancelled to make the connection loop hang up
    pub closer: CancellationToken,
}

#[derive(Default)]
pub struct PeerDirectory {
    peers: StdRwLock<HashMap<String, Peer>>,
}

/// Queue one pre-serialized message, dropping it when the queue is full
fn deliver(connection_id: &str, peer: &Peer, json: &Arc<String>) {
    match peer.sender.try_send(json.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for connection {}, dropping message", connection_id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for connection {} (disconnected)", connection_id);
        }
    }
}

/// Queue one message that must arrive. A full queue closes the connection.
fn deliver_or_close(connection_id: &str, peer: &Peer, json: &Arc<String>) {
    match peer.sender.try_send(json.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Connection {} fell behind on program state, closing it", connection_id);
            peer.closer.cancel();
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for connection {} (disconnected)", connection_id);
        }
    }
}

fn serialize(event: &ServerEvent) -> Option<Arc<String>> {
    match event.to_json() {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize broadcast message: {}", e);
            None
        }
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. The returned token is cancelled when the
    /// connection must be closed.
    pub fn register(&self, connection_id: &str, sender: mpsc::Sender<Arc<String>>) -> CancellationToken {
        let closer = CancellationToken::new();
        let peer = Peer {
            sender,
            role: Role::Unassigned,
            room_id: None,
            closer: closer.clone(),
        };
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection_id.to_string(), peer);
        closer
    }

    pub fn unregister(&self, connection_id: &str) -> Option<Peer> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id)
    }

    /// Records the role and room a join event established
    pub fn assign(&self, connection_id: &str, role: Role, room_id: Option<String>) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.get_mut(connection_id) {
            peer.role = role;
            peer.room_id = room_id;
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn send_to(&self, connection_id: &str, event: &ServerEvent) {
        let Some(json) = serialize(event) else {
            return;
        };
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.get(connection_id) {
            deliver(connection_id, peer, &json);
        }
    }

    /// Sends program state to one connection, closing it when it lags
    pub fn send_state_to(&self, connection_id: &str, event: &ServerEvent) {
        let Some(json) = serialize(event) else {
            return;
        };
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.get(connection_id) {
            deliver_or_close(connection_id, peer, &json);
        }
    }

    /// Sends program state to every operator following the program.
    /// Lagging operators are closed rather than skipped.
    pub fn broadcast_to_followers(&self, event: &ServerEvent) -> usize {
        let Some(json) = serialize(event) else {
            return 0;
        };
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut sent = 0;
        for (id, peer) in peers.iter().filter(|(_, p)| p.role.follows_program()) {
            deliver_or_close(id, peer, &json);
            sent += 1;
        }
        sent
    }

    /// Sends to every connection holding `role`
    pub fn broadcast_to_role(&self, role: Role, event: &ServerEvent) -> usize {
        let Some(json) = serialize(event) else {
            return 0;
        };
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut sent = 0;
        for (id, peer) in peers.iter().filter(|(_, p)| p.role == role) {
            deliver(id, peer, &json);
            sent += 1;
        }
        sent
    }

    /// Sends to every connection assigned to `room_id` except `except`
    pub fn broadcast_to_room_except(&self, room_id: &str, except: &str, event: &ServerEvent) -> usize {
        let Some(json) = serialize(event) else {
            return 0;
        };
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut sent = 0;
        for (id, peer) in peers.iter() {
            if id != except && peer.room_id.as_deref() == Some(room_id) {
                deliver(id, peer, &json);
                sent += 1;
            }
        }
        sent
    }
}
