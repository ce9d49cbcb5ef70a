#![forbid(unsafe_code)]

// Resource registry - rooms, transports, producers and consumers by id.
//
// All maps live behind one std::sync::RwLock that is only held for brief
// lookups and mutations, never across an await. Room creation is the one
// operation that awaits the engine; it is serialized per room id with a
// tokio::sync::Mutex so concurrent first access creates a single router.

use crate::error::{ResourceKind, SignalError, SignalResult};
use crate::media::{ConsumerId, MediaKind, ProducerId, RouterId, RouterInfo, TransportId};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

/// Room state owned by the registry
#[derive(Debug)]
struct RoomEntry {
    router: RouterInfo,
    transports: HashSet<TransportId>,
    /// Creation order is kept so program snapshots list producers stably
    producers: Vec<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

/// Read-only view of a room handed out to callers
#[derive(Debug, Clone)]
pub struct RoomView {
    pub id: String,
    pub router_id: RouterId,
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEntry {
    pub id: TransportId,
    pub room_id: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerEntry {
    pub id: ProducerId,
    pub room_id: String,
    pub transport_id: TransportId,
    pub connection_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub room_id: String,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub connection_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Per-room counts for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub router_id: RouterId,
    pub transports_count: usize,
    pub producers_count: usize,
    pub consumers_count: usize,
}

/// Everything evicted by a single removal, cascade included
#[derive(Debug, Default, Clone)]
pub struct Evicted {
    pub transports: Vec<TransportEntry>,
    pub producers: Vec<ProducerEntry>,
    pub consumers: Vec<ConsumerEntry>,
}

impl Evicted {
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<String, RoomEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    /// Transport ids per connection, in creation order
    connection_transports: HashMap<String, Vec<TransportId>>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl RegistryInner {
    fn room_view(&self, room_id: &str) -> Option<RoomView> {
        self.rooms.get(room_id).map(|room| RoomView {
            id: room_id.to_string(),
            router_id: room.router.id.clone(),
            rtp_capabilities: room.router.rtp_capabilities.clone(),
        })
    }

    fn evict_consumer(&mut self, consumer_id: &str, evicted: &mut Evicted) {
        if let Some(consumer) = self.consumers.remove(consumer_id) {
            if let Some(room) = self.rooms.get_mut(&consumer.room_id) {
                room.consumers.remove(consumer_id);
            }
            evicted.consumers.push(consumer);
        }
    }

    fn evict_producer(&mut self, producer_id: &str, evicted: &mut Evicted) {
        let Some(producer) = self.producers.remove(producer_id) else {
            return;
        };
        if let Some(room) = self.rooms.get_mut(&producer.room_id) {
            room.producers.retain(|id| id != producer_id);
        }
        // Consumers of a closed producer close with it
        let bound: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in bound {
            self.evict_consumer(&consumer_id, evicted);
        }
        evicted.producers.push(producer);
    }

    fn evict_transport(&mut self, transport_id: &str, evicted: &mut Evicted) {
        let Some(transport) = self.transports.remove(transport_id) else {
            return;
        };
        if let Some(room) = self.rooms.get_mut(&transport.room_id) {
            room.transports.remove(transport_id);
        }
        if let Some(ids) = self.connection_transports.get_mut(&transport.connection_id) {
            ids.retain(|id| id != transport_id);
            if ids.is_empty() {
                self.connection_transports.remove(&transport.connection_id);
            }
        }
        // Producers and consumers created on a closed transport close with it
        let producers: Vec<ProducerId> = self
            .producers
            .values()
            .filter(|p| p.transport_id == transport_id)
            .map(|p| p.id.clone())
            .collect();
        for producer_id in producers {
            self.evict_producer(&producer_id, evicted);
        }
        let consumers: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in consumers {
            self.evict_consumer(&consumer_id, evicted);
        }
        evicted.transports.push(transport);
    }
}

/// In-memory registry of every media resource in the process.
#[derive(Default)]
pub struct Registry {
    inner: StdRwLock<RegistryInner>,
    room_creation: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Looks up an existing room
    pub fn room(&self, room_id: &str) -> SignalResult<RoomView> {
        self.read()
            .room_view(room_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, room_id))
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.read().rooms.contains_key(room_id)
    }

    /// Returns the room, creating it through `create` on first reference.
    ///
    /// `create` runs at most once per successful creation even under
    /// concurrent callers: later callers wait on the per-room lock and observe
    /// the first caller's room. A failed `create` leaves the room absent so a
    /// later call can retry.
    pub async fn get_or_create_room<F, Fut>(&self, room_id: &str, create: F) -> SignalResult<RoomView>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SignalResult<RouterInfo>>,
    {
        if let Some(room) = self.read().room_view(room_id) {
            return Ok(room);
        }

        let creation_lock = {
            let mut locks = self.room_creation.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(room_id.to_string()).or_default().clone()
        };
        let creating = creation_lock.lock().await;
        let result = self.create_room_locked(room_id, create).await;
        self.release_creation_lock(room_id, &creation_lock);
        drop(creating);
        result
    }

    /// Body of `get_or_create_room` run under the per-room creation lock
    async fn create_room_locked<F, Fut>(&self, room_id: &str, create: F) -> SignalResult<RoomView>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SignalResult<RouterInfo>>,
    {
        // Another caller may have finished while we waited
        if let Some(room) = self.read().room_view(room_id) {
            return Ok(room);
        }

        let router = create().await?;
        info!("Registered room {} with router {}", room_id, router.id);

        let mut inner = self.write();
        inner.rooms.insert(
            room_id.to_string(),
            RoomEntry {
                router,
                transports: HashSet::new(),
                producers: Vec::new(),
                consumers: HashSet::new(),
            },
        );
        inner
            .room_view(room_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, room_id))
    }

    /// Drops the room's creation lock entry on success and failure alike.
    /// After a failure the entry stays while other callers still wait on it.
    fn release_creation_lock(&self, room_id: &str, creation_lock: &Arc<TokioMutex<()>>) {
        let created = self.has_room(room_id);
        let mut locks = self.room_creation.lock().unwrap_or_else(|e| e.into_inner());
        let ours = locks.get(room_id).is_some_and(|held| Arc::ptr_eq(held, creation_lock));
        // One reference in the map plus ours means nobody else is waiting
        if ours && (created || Arc::strong_count(creation_lock) <= 2) {
            locks.remove(room_id);
        }
    }

    /// Registers a transport under its room and its owning connection
    pub fn insert_transport(&self, entry: TransportEntry) -> SignalResult<()> {
        let mut inner = self.write();
        let room = inner
            .rooms
            .get_mut(&entry.room_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, entry.room_id.clone()))?;
        room.transports.insert(entry.id.clone());
        inner
            .connection_transports
            .entry(entry.connection_id.clone())
            .or_default()
            .push(entry.id.clone());
        debug!(
            "Registered transport {} in room {} for connection {}",
            entry.id, entry.room_id, entry.connection_id
        );
        inner.transports.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn transport(&self, transport_id: &str) -> SignalResult<TransportEntry> {
        self.read()
            .transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| SignalError::not_found(ResourceKind::Transport, transport_id))
    }

    /// Transport ids owned by a connection, oldest first
    pub fn find_transports_by_connection(&self, connection_id: &str) -> Vec<TransportId> {
        self.read()
            .connection_transports
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recently created transport of a connection (receive-path lookup)
    pub fn latest_transport_for_connection(&self, connection_id: &str) -> SignalResult<TransportEntry> {
        let inner = self.read();
        inner
            .connection_transports
            .get(connection_id)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.transports.get(id))
            .cloned()
            .ok_or_else(|| SignalError::not_found(ResourceKind::ConnectionTransport, connection_id))
    }

    /// Registers a producer. Fails if its transport was evicted meanwhile.
    pub fn insert_producer(&self, entry: ProducerEntry) -> SignalResult<()> {
        let mut inner = self.write();
        if !inner.transports.contains_key(&entry.transport_id) {
            return Err(SignalError::not_found(ResourceKind::Transport, entry.transport_id.clone()));
        }
        let room = inner
            .rooms
            .get_mut(&entry.room_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, entry.room_id.clone()))?;
        room.producers.push(entry.id.clone());
        inner.producers.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Finds a producer in whichever room holds it, along with that room
    pub fn find_producer_any_room(&self, producer_id: &str) -> SignalResult<(ProducerEntry, RoomView)> {
        let inner = self.read();
        let producer = inner
            .producers
            .get(producer_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Producer, producer_id))?;
        let room = inner
            .room_view(&producer.room_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, producer.room_id.clone()))?;
        Ok((producer.clone(), room))
    }

    /// Producer ids of a room in creation order
    pub fn room_producer_ids(&self, room_id: &str) -> Vec<ProducerId> {
        self.read()
            .rooms
            .get(room_id)
            .map(|room| room.producers.clone())
            .unwrap_or_default()
    }

    /// Registers a consumer. Fails if its transport or producer was evicted meanwhile.
    pub fn insert_consumer(&self, entry: ConsumerEntry) -> SignalResult<()> {
        let mut inner = self.write();
        if !inner.transports.contains_key(&entry.transport_id) {
            return Err(SignalError::not_found(ResourceKind::Transport, entry.transport_id.clone()));
        }
        if !inner.producers.contains_key(&entry.producer_id) {
            return Err(SignalError::not_found(ResourceKind::Producer, entry.producer_id.clone()));
        }
        let room = inner
            .rooms
            .get_mut(&entry.room_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, entry.room_id.clone()))?;
        room.consumers.insert(entry.id.clone());
        inner.consumers.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn consumer(&self, consumer_id: &str) -> SignalResult<ConsumerEntry> {
        self.read()
            .consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| SignalError::not_found(ResourceKind::Consumer, consumer_id))
    }

    pub fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> SignalResult<()> {
        let mut inner = self.write();
        let consumer = inner
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Consumer, consumer_id))?;
        consumer.paused = paused;
        Ok(())
    }

    /// Removes a transport and everything created on it. Absent ids are a no-op.
    pub fn remove_transport(&self, transport_id: &str) -> Evicted {
        let mut evicted = Evicted::default();
        self.write().evict_transport(transport_id, &mut evicted);
        evicted
    }

    /// Removes a producer and its consumers. Absent ids are a no-op.
    pub fn remove_producer(&self, producer_id: &str) -> Evicted {
        let mut evicted = Evicted::default();
        self.write().evict_producer(producer_id, &mut evicted);
        evicted
    }

    /// Removes a consumer. Absent ids are a no-op.
    pub fn remove_consumer(&self, consumer_id: &str) -> Evicted {
        let mut evicted = Evicted::default();
        self.write().evict_consumer(consumer_id, &mut evicted);
        evicted
    }

    /// Removes every transport owned by a connection, cascade included
    pub fn remove_connection(&self, connection_id: &str) -> Evicted {
        let mut evicted = Evicted::default();
        let mut inner = self.write();
        let ids = inner
            .connection_transports
            .get(connection_id)
            .cloned()
            .unwrap_or_default();
        for transport_id in ids {
            inner.evict_transport(&transport_id, &mut evicted);
        }
        evicted
    }

    /// Removes a room with all of its resources
    pub fn remove_room(&self, room_id: &str) -> Option<(RoomView, Evicted)> {
        let mut evicted = Evicted::default();
        let view = {
            let mut inner = self.write();
            let view = inner.room_view(room_id)?;
            let transports: Vec<TransportId> = inner
                .rooms
                .get(room_id)
                .map(|room| room.transports.iter().cloned().collect())
                .unwrap_or_default();
            for transport_id in transports {
                inner.evict_transport(&transport_id, &mut evicted);
            }
            // Producers or consumers registered in this room on another room's transport
            let producers = inner.rooms.get(room_id).map(|r| r.producers.clone()).unwrap_or_default();
            for producer_id in producers {
                inner.evict_producer(&producer_id, &mut evicted);
            }
            let consumers: Vec<ConsumerId> = inner
                .rooms
                .get(room_id)
                .map(|r| r.consumers.iter().cloned().collect())
                .unwrap_or_default();
            for consumer_id in consumers {
                inner.evict_consumer(&consumer_id, &mut evicted);
            }
            inner.rooms.remove(room_id);
            view
        };
        self.room_creation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(room_id);
        Some((view, evicted))
    }

    /// Counts of a room's resources
    pub fn room_snapshot(&self, room_id: &str) -> SignalResult<RoomSnapshot> {
        self.read()
            .rooms
            .get(room_id)
            .map(|room| RoomSnapshot {
                router_id: room.router.id.clone(),
                transports_count: room.transports.len(),
                producers_count: room.producers.len(),
                consumers_count: room.consumers.len(),
            })
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, room_id))
    }

    /// All room ids, sorted
    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn room_count(&self) -> usize {
        self.read().rooms.len()
    }
}
