#![forbid(unsafe_code)]

// Signaling dispatcher - routes one decoded client event to the registry,
// room manager and program switch, and produces exactly one reply payload.
// Fan-out happens inside the handlers; the reply goes back to the caller.

use super::connection::ConnectionContext;
use super::peers::PeerDirectory;
use super::protocol::{ClientEvent, ServerEvent};
use crate::error::{ResourceKind, SignalError, SignalResult};
use crate::media::MediaKind;
use crate::room::program::ProgramSwitch;
use crate::room::registry::{ConsumerEntry, ProducerEntry, TransportEntry};
use crate::room::roles::Role;
use crate::room::{validate_room_id, RoomManager};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared handle to everything a connection's handlers touch
#[derive(Clone)]
pub struct Dispatcher {
    rooms: Arc<RoomManager>,
    peers: Arc<PeerDirectory>,
    program: Arc<ProgramSwitch>,
}

impl Dispatcher {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self {
            rooms,
            peers: Arc::new(PeerDirectory::new()),
            program: Arc::new(ProgramSwitch::new()),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn program(&self) -> &ProgramSwitch {
        &self.program
    }

    /// Handles one event for `ctx`. Every outcome, success or failure, is a
    /// reply payload; nothing here ends the connection.
    pub async fn dispatch(&self, ctx: &mut ConnectionContext, event: ClientEvent) -> SignalResult<Value> {
        match event {
            ClientEvent::JoinRoom(room_id) => self.join_room(ctx, room_id).await,
            ClientEvent::JoinObs => {
                self.set_role(ctx, Role::Obs, None);
                self.program.catch_up(&ctx.id, self.rooms.registry(), &self.peers);
                Ok(json!({ "role": Role::Obs }))
            }
            ClientEvent::JoinAdmin => {
                self.set_role(ctx, Role::Admin, None);
                Ok(json!({ "role": Role::Admin }))
            }
            ClientEvent::GetRouterRtpCapabilities => {
                let room = self.rooms.registry().room(self.room_for(ctx))?;
                Ok(json!({ "rtpCapabilities": room.rtp_capabilities }))
            }
            ClientEvent::GetDefaultRouterRtpCapabilities => {
                let room = self.rooms.ensure_room(self.rooms.default_room_id()).await?;
                Ok(json!({ "rtpCapabilities": room.rtp_capabilities }))
            }
            ClientEvent::CreateWebRtcTransport => {
                let room_id = self.room_for(ctx).to_string();
                let descriptor = self.rooms.create_webrtc_endpoint(&ctx.id, &room_id).await?;
                Ok(json!(descriptor))
            }
            ClientEvent::ConnectWebRtcTransport {
                transport_id,
                dtls_parameters,
            } => {
                let transport = self.owned_transport(ctx, &transport_id)?;
                self.rooms
                    .engine()
                    .connect_transport(&transport.id, dtls_parameters)
                    .await
                    .map_err(|e| SignalError::engine("connectWebRtcTransport", e))?;
                debug!("Connected transport {} for {}", transport.id, ctx.id);
                Ok(json!({ "success": true }))
            }
            ClientEvent::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => self.produce(ctx, &transport_id, kind, rtp_parameters, app_data).await,
            ClientEvent::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let transport = self.rooms.registry().latest_transport_for_connection(&ctx.id)?;
                self.consume_on(ctx, transport, &producer_id, rtp_capabilities).await
            }
            ClientEvent::ConsumeByTransport {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let transport = self.owned_transport(ctx, &transport_id)?;
                self.consume_on(ctx, transport, &producer_id, rtp_capabilities).await
            }
            ClientEvent::PauseConsumer { consumer_id } => self.set_paused(ctx, &consumer_id, true).await,
            ClientEvent::ResumeConsumer { consumer_id } => self.set_paused(ctx, &consumer_id, false).await,
            ClientEvent::SwitchProgram(target) => {
                self.authorize(ctx, "switchProgram", Role::can_switch_program)?;
                if let Some(room_id) = target.as_deref() {
                    validate_room_id(room_id)?;
                }
                let state = self.program.switch(target, self.rooms.registry(), &self.peers);
                self.rooms.metrics().inc_program_switches();
                info!("{} switched program to {:?}", ctx.id, state);
                Ok(json!({ "roomId": state.room_id() }))
            }
            ClientEvent::GetProgram => {
                let (room_id, producers) = self.program.snapshot(self.rooms.registry());
                Ok(json!({ "roomId": room_id, "producers": producers }))
            }
            ClientEvent::GetRoomStats(room_id) => {
                self.authorize(ctx, "getRoomStats", Role::can_read_diagnostics)?;
                let snapshot = self.rooms.registry().room_snapshot(&room_id)?;
                Ok(json!({ "stats": snapshot }))
            }
            ClientEvent::GetWorkerStats => {
                self.authorize(ctx, "getWorkerStats", Role::can_read_diagnostics)?;
                let stats = self
                    .rooms
                    .engine()
                    .worker_stats()
                    .await
                    .map_err(|e| SignalError::engine("getWorkerStats", e))?;
                Ok(json!({ "stats": stats }))
            }
            ClientEvent::GetRooms => {
                self.authorize(ctx, "getRooms", Role::can_read_diagnostics)?;
                Ok(json!({ "rooms": self.rooms.registry().room_ids() }))
            }
        }
    }

    /// Room used by capability and transport requests: the joined room, else the default
    fn room_for<'a>(&'a self, ctx: &'a ConnectionContext) -> &'a str {
        ctx.room_id.as_deref().unwrap_or(self.rooms.default_room_id())
    }

    fn set_role(&self, ctx: &mut ConnectionContext, role: Role, room_id: Option<String>) {
        ctx.role = role;
        ctx.room_id = room_id.clone();
        self.peers.assign(&ctx.id, role, room_id);
        info!("Connection {} joined as {}", ctx.id, role);
    }

    fn authorize(&self, ctx: &ConnectionContext, event: &str, permitted: fn(&Role) -> bool) -> SignalResult<()> {
        if permitted(&ctx.role) {
            return Ok(());
        }
        self.rooms.metrics().inc_unauthorized();
        warn!("Connection {} ({}) sent admin-only {}", ctx.id, ctx.role, event);
        Err(SignalError::Unauthorized { required: Role::Admin })
    }

    /// Transports are only usable by the connection that created them
    fn owned_transport(&self, ctx: &ConnectionContext, transport_id: &str) -> SignalResult<TransportEntry> {
        let transport = self.rooms.registry().transport(transport_id)?;
        if transport.connection_id != ctx.id {
            return Err(SignalError::not_found(ResourceKind::Transport, transport_id));
        }
        Ok(transport)
    }

    async fn join_room(&self, ctx: &mut ConnectionContext, room_id: String) -> SignalResult<Value> {
        self.rooms.ensure_room(&room_id).await?;
        self.set_role(ctx, Role::Guest, Some(room_id.clone()));
        Ok(json!({ "roomId": room_id }))
    }

    async fn produce(
        &self,
        ctx: &ConnectionContext,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> SignalResult<Value> {
        let transport = self.owned_transport(ctx, transport_id)?;

        let app_data = match app_data {
            Value::Object(mut map) => {
                map.insert("socketId".into(), Value::String(ctx.id.clone()));
                Value::Object(map)
            }
            _ => json!({ "socketId": ctx.id }),
        };

        let engine = self.rooms.engine();
        let producer_id = engine
            .produce(&transport.id, kind, rtp_parameters, app_data)
            .await
            .map_err(|e| SignalError::engine("produce", e))?;

        let entry = ProducerEntry {
            id: producer_id.clone(),
            room_id: transport.room_id.clone(),
            transport_id: transport.id.clone(),
            connection_id: ctx.id.clone(),
            kind,
        };
        if let Err(e) = self.rooms.registry().insert_producer(entry) {
            // Transport went away while the engine call was in flight
            engine.close_producer(&producer_id);
            return Err(e);
        }
        self.rooms.metrics().inc_producers_created();

        let announced = self.program.announce_if_live(
            &transport.room_id,
            &ServerEvent::NewProducer {
                producer_id: producer_id.clone(),
                socket_id: ctx.id.clone(),
                kind,
                room_id: transport.room_id.clone(),
            },
            &self.peers,
        );
        self.peers.broadcast_to_role(
            Role::Admin,
            &ServerEvent::ProducerAdded {
                producer_id: producer_id.clone(),
                socket_id: ctx.id.clone(),
                kind,
                room_id: transport.room_id.clone(),
            },
        );

        info!(
            "Connection {} produced {} {} in room {} (on program: {})",
            ctx.id, kind, producer_id, transport.room_id, announced
        );
        Ok(json!({ "id": producer_id }))
    }

    async fn consume_on(
        &self,
        ctx: &ConnectionContext,
        transport: TransportEntry,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> SignalResult<Value> {
        // Producers are looked up in every room; the program may come from elsewhere
        let (producer, producer_room) = self.rooms.registry().find_producer_any_room(producer_id)?;

        let engine = self.rooms.engine();
        if !engine.can_consume(&producer_room.router_id, &producer.id, &rtp_capabilities) {
            return Err(SignalError::InvalidCapabilities);
        }

        let consumer = engine
            .consume(
                &transport.id,
                &producer.id,
                rtp_capabilities,
                json!({ "socketId": ctx.id }),
            )
            .await
            .map_err(|e| SignalError::engine("consume", e))?;

        let entry = ConsumerEntry {
            id: consumer.id.clone(),
            room_id: transport.room_id.clone(),
            transport_id: transport.id.clone(),
            producer_id: producer.id.clone(),
            connection_id: ctx.id.clone(),
            kind: consumer.kind,
            paused: false,
        };
        if let Err(e) = self.rooms.registry().insert_consumer(entry) {
            engine.close_consumer(&consumer.id);
            return Err(e);
        }
        self.rooms.metrics().inc_consumers_created();

        debug!(
            "Connection {} consuming {} as {} on transport {}",
            ctx.id, producer.id, consumer.id, transport.id
        );
        Ok(json!(consumer))
    }

    async fn set_paused(&self, ctx: &ConnectionContext, consumer_id: &str, paused: bool) -> SignalResult<Value> {
        let consumer = self.rooms.registry().consumer(consumer_id)?;
        if consumer.connection_id != ctx.id {
            return Err(SignalError::not_found(ResourceKind::Consumer, consumer_id));
        }

        let engine = self.rooms.engine();
        if paused {
            engine
                .pause_consumer(consumer_id)
                .await
                .map_err(|e| SignalError::engine("pauseConsumer", e))?;
        } else {
            engine
                .resume_consumer(consumer_id)
                .await
                .map_err(|e| SignalError::engine("resumeConsumer", e))?;
        }
        self.rooms.registry().set_consumer_paused(consumer_id, paused)?;
        Ok(json!({ "success": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::engine_events;
    use crate::media::fake::FakeEngine;
    use crate::metrics::ServerMetrics;
    use crate::room::program::ProgramState;
    use crate::signaling::protocol::error_payload;
    use crate::turn::PublicStun;
    use tokio::sync::mpsc;

    struct Client {
        ctx: ConnectionContext,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        fn pushes(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(json) = self.rx.try_recv() {
                out.push(serde_json::from_str(&json).unwrap());
            }
            out
        }
    }

    fn setup() -> (Dispatcher, Arc<FakeEngine>) {
        let (tx, _rx) = engine_events();
        let engine = Arc::new(FakeEngine::new(tx));
        let rooms = Arc::new(RoomManager::new(
            engine.clone(),
            Arc::new(PublicStun),
            ServerMetrics::new(),
            "default",
        ));
        (Dispatcher::new(rooms), engine)
    }

    fn connect(dispatcher: &Dispatcher, id: &str) -> Client {
        let (tx, rx) = mpsc::channel(32);
        dispatcher.peers().register(id, tx);
        Client {
            ctx: ConnectionContext::new(id.to_string()),
            rx,
        }
    }

    async fn send(dispatcher: &Dispatcher, client: &mut Client, event: ClientEvent) -> SignalResult<Value> {
        dispatcher.dispatch(&mut client.ctx, event).await
    }

    async fn join_as(dispatcher: &Dispatcher, id: &str, event: ClientEvent) -> Client {
        let mut client = connect(dispatcher, id);
        send(dispatcher, &mut client, event).await.unwrap();
        client
    }

    /// Joins `room`, opens a transport and produces video. Returns (transport, producer).
    async fn publish(dispatcher: &Dispatcher, guest: &mut Client, room: &str) -> (String, String) {
        send(dispatcher, guest, ClientEvent::JoinRoom(room.into())).await.unwrap();
        let transport = send(dispatcher, guest, ClientEvent::CreateWebRtcTransport).await.unwrap();
        let transport_id = transport["id"].as_str().unwrap().to_string();
        let produced = send(
            dispatcher,
            guest,
            ClientEvent::Produce {
                transport_id: transport_id.clone(),
                kind: MediaKind::Video,
                rtp_parameters: json!({ "codecs": [] }),
                app_data: Value::Null,
            },
        )
        .await
        .unwrap();
        (transport_id, produced["id"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn capabilities_before_any_room_is_not_found() {
        let (dispatcher, engine) = setup();
        let mut client = connect(&dispatcher, "c1");

        let err = send(&dispatcher, &mut client, ClientEvent::GetRouterRtpCapabilities)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::NotFound { kind: ResourceKind::Room, ref id } if id == "default"));
        assert_eq!(engine.routers_created(), 0);
    }

    #[tokio::test]
    async fn default_capabilities_create_the_default_room() {
        let (dispatcher, engine) = setup();
        let mut client = connect(&dispatcher, "c1");

        let reply = send(&dispatcher, &mut client, ClientEvent::GetDefaultRouterRtpCapabilities)
            .await
            .unwrap();
        assert!(reply["rtpCapabilities"]["codecs"].is_array());
        assert_eq!(engine.routers_created(), 1);

        // Now the implicit lookup finds it
        assert!(send(&dispatcher, &mut client, ClientEvent::GetRouterRtpCapabilities).await.is_ok());
    }

    #[tokio::test]
    async fn produce_off_program_notifies_admins_only() {
        let (dispatcher, _engine) = setup();
        let mut obs = join_as(&dispatcher, "obs", ClientEvent::JoinObs).await;
        let mut admin = join_as(&dispatcher, "admin", ClientEvent::JoinAdmin).await;
        obs.pushes();

        let mut guest = connect(&dispatcher, "guest");
        let (_, producer_id) = publish(&dispatcher, &mut guest, "r1").await;
        assert!(!producer_id.is_empty());

        assert!(obs.pushes().is_empty());
        let admin_pushes = admin.pushes();
        assert_eq!(admin_pushes.len(), 1);
        assert_eq!(admin_pushes[0]["event"], "producerAdded");
        assert_eq!(admin_pushes[0]["data"]["producerId"], producer_id.as_str());
        assert_eq!(admin_pushes[0]["data"]["socketId"], "guest");
        assert_eq!(admin_pushes[0]["data"]["kind"], "video");
        assert_eq!(admin_pushes[0]["data"]["roomId"], "r1");
    }

    #[tokio::test]
    async fn switching_program_sends_the_room_snapshot() {
        let (dispatcher, _engine) = setup();
        let mut obs = join_as(&dispatcher, "obs", ClientEvent::JoinObs).await;
        let mut admin = join_as(&dispatcher, "admin", ClientEvent::JoinAdmin).await;
        let mut guest = connect(&dispatcher, "guest");
        let (_, producer_id) = publish(&dispatcher, &mut guest, "r1").await;
        obs.pushes();
        admin.pushes();

        let reply = send(&dispatcher, &mut admin, ClientEvent::SwitchProgram(Some("r1".into())))
            .await
            .unwrap();
        assert_eq!(reply["roomId"], "r1");

        let pushes = obs.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0]["event"], "newProgram");
        assert_eq!(pushes[0]["data"], json!({ "roomId": "r1", "producers": [producer_id] }));
        assert_eq!(admin.pushes()[0]["event"], "programSwitched");

        // Producers created while live reach operators immediately
        let (_, second) = publish(&dispatcher, &mut guest, "r1").await;
        let pushes = obs.pushes();
        assert_eq!(pushes[0]["event"], "newProducer");
        assert_eq!(pushes[0]["data"]["producerId"], second.as_str());

        let program = send(&dispatcher, &mut guest, ClientEvent::GetProgram).await.unwrap();
        assert_eq!(program["producers"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn late_operator_is_caught_up_on_join() {
        let (dispatcher, _engine) = setup();
        let mut admin = join_as(&dispatcher, "admin", ClientEvent::JoinAdmin).await;
        send(&dispatcher, &mut admin, ClientEvent::SwitchProgram(Some("r9".into())))
            .await
            .unwrap();

        let mut obs = join_as(&dispatcher, "obs", ClientEvent::JoinObs).await;
        let pushes = obs.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0]["data"], json!({ "roomId": "r9", "producers": [] }));

        send(&dispatcher, &mut admin, ClientEvent::SwitchProgram(None)).await.unwrap();
        assert_eq!(obs.pushes()[0]["event"], "programStopped");
        assert_eq!(dispatcher.program().current(), ProgramState::Idle);
    }

    #[tokio::test]
    async fn admin_requests_from_other_roles_are_rejected_without_mutation() {
        let (dispatcher, _engine) = setup();
        let mut guest = connect(&dispatcher, "guest");
        publish(&dispatcher, &mut guest, "r1").await;
        let mut obs = join_as(&dispatcher, "obs", ClientEvent::JoinObs).await;
        obs.pushes();

        for event in [
            ClientEvent::SwitchProgram(Some("r1".into())),
            ClientEvent::GetRoomStats("r1".into()),
            ClientEvent::GetWorkerStats,
            ClientEvent::GetRooms,
        ] {
            let err = send(&dispatcher, &mut guest, event).await.unwrap_err();
            assert!(matches!(err, SignalError::Unauthorized { required: Role::Admin }));
        }

        assert_eq!(dispatcher.program().current(), ProgramState::Idle);
        assert!(obs.pushes().is_empty());
        assert_eq!(dispatcher.rooms().metrics().unauthorized(), 4);
        let snapshot = dispatcher.rooms().registry().room_snapshot("r1").unwrap();
        assert_eq!((snapshot.transports_count, snapshot.producers_count), (1, 1));
    }

    #[tokio::test]
    async fn pausing_an_unknown_consumer_names_it() {
        let (dispatcher, _engine) = setup();
        let mut obs = join_as(&dispatcher, "obs", ClientEvent::JoinObs).await;

        let err = send(
            &dispatcher,
            &mut obs,
            ClientEvent::PauseConsumer {
                consumer_id: "nope".into(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(error_payload(&err), json!({ "error": "Consumer not found: nope" }));
    }

    #[tokio::test]
    async fn consume_uses_the_latest_transport_and_toggles_pause() {
        let (dispatcher, engine) = setup();
        let mut guest = connect(&dispatcher, "guest");
        let (_, producer_id) = publish(&dispatcher, &mut guest, "r1").await;

        let mut obs = join_as(&dispatcher, "obs", ClientEvent::JoinObs).await;
        let first = send(&dispatcher, &mut obs, ClientEvent::CreateWebRtcTransport).await.unwrap();
        let second = send(&dispatcher, &mut obs, ClientEvent::CreateWebRtcTransport).await.unwrap();

        let consumed = send(
            &dispatcher,
            &mut obs,
            ClientEvent::Consume {
                producer_id: producer_id.clone(),
                rtp_capabilities: json!({ "codecs": [] }),
            },
        )
        .await
        .unwrap();
        assert_eq!(consumed["producerId"], producer_id.as_str());
        assert_eq!(consumed["kind"], "video");
        assert!(consumed["rtpParameters"].is_object());

        let consumer_id = consumed["id"].as_str().unwrap().to_string();
        let entry = dispatcher.rooms().registry().consumer(&consumer_id).unwrap();
        assert_eq!(entry.transport_id, second["id"].as_str().unwrap());
        assert_ne!(entry.transport_id, first["id"].as_str().unwrap());
        // Operator has no room, so its transports live in the default room
        assert_eq!(entry.room_id, "default");
        assert!(!entry.paused);

        send(
            &dispatcher,
            &mut obs,
            ClientEvent::PauseConsumer {
                consumer_id: consumer_id.clone(),
            },
        )
        .await
        .unwrap();
        assert_eq!(engine.consumer_paused(&consumer_id), Some(true));
        assert!(dispatcher.rooms().registry().consumer(&consumer_id).unwrap().paused);

        send(
            &dispatcher,
            &mut obs,
            ClientEvent::ResumeConsumer {
                consumer_id: consumer_id.clone(),
            },
        )
        .await
        .unwrap();
        assert_eq!(engine.consumer_paused(&consumer_id), Some(false));
    }

    #[tokio::test]
    async fn implicit_consume_without_a_transport_is_not_found() {
        let (dispatcher, _engine) = setup();
        let mut guest = connect(&dispatcher, "guest");
        let (_, producer_id) = publish(&dispatcher, &mut guest, "r1").await;
        let mut obs = join_as(&dispatcher, "obs", ClientEvent::JoinObs).await;

        let err = send(
            &dispatcher,
            &mut obs,
            ClientEvent::Consume {
                producer_id,
                rtp_capabilities: Value::Null,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalError::NotFound { kind: ResourceKind::ConnectionTransport, .. }));
    }

    #[tokio::test]
    async fn incompatible_capabilities_create_nothing() {
        let (dispatcher, engine) = setup();
        let mut guest = connect(&dispatcher, "guest");
        let (_, producer_id) = publish(&dispatcher, &mut guest, "r1").await;
        let mut viewer = connect(&dispatcher, "viewer");
        send(&dispatcher, &mut viewer, ClientEvent::JoinRoom("r1".into())).await.unwrap();
        let transport = send(&dispatcher, &mut viewer, ClientEvent::CreateWebRtcTransport).await.unwrap();

        engine.reject_capabilities(true);
        let err = send(
            &dispatcher,
            &mut viewer,
            ClientEvent::ConsumeByTransport {
                transport_id: transport["id"].as_str().unwrap().to_string(),
                producer_id,
                rtp_capabilities: json!({}),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalError::InvalidCapabilities));
        assert_eq!(engine.live_consumers(), 0);
        assert_eq!(dispatcher.rooms().registry().room_snapshot("r1").unwrap().consumers_count, 0);
    }

    #[tokio::test]
    async fn transports_of_other_connections_are_not_usable() {
        let (dispatcher, engine) = setup();
        let mut guest = connect(&dispatcher, "guest");
        let (transport_id, producer_id) = publish(&dispatcher, &mut guest, "r1").await;
        let mut intruder = connect(&dispatcher, "intruder");

        let err = send(
            &dispatcher,
            &mut intruder,
            ClientEvent::ConsumeByTransport {
                transport_id: transport_id.clone(),
                producer_id,
                rtp_capabilities: json!({}),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), format!("Transport not found: {transport_id}"));

        let err = send(
            &dispatcher,
            &mut intruder,
            ClientEvent::ConnectWebRtcTransport {
                transport_id: transport_id.clone(),
                dtls_parameters: json!({}),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalError::NotFound { .. }));
        assert!(!engine.is_connected(&transport_id));
    }

    #[tokio::test]
    async fn connect_transport_reaches_the_engine() {
        let (dispatcher, engine) = setup();
        let mut guest = connect(&dispatcher, "guest");
        send(&dispatcher, &mut guest, ClientEvent::JoinRoom("r1".into())).await.unwrap();
        let transport = send(&dispatcher, &mut guest, ClientEvent::CreateWebRtcTransport).await.unwrap();
        let transport_id = transport["id"].as_str().unwrap().to_string();
        assert_eq!(transport["iceServers"].as_array().unwrap().len(), 2);

        let reply = send(
            &dispatcher,
            &mut guest,
            ClientEvent::ConnectWebRtcTransport {
                transport_id: transport_id.clone(),
                dtls_parameters: json!({ "role": "client" }),
            },
        )
        .await
        .unwrap();
        assert_eq!(reply, json!({ "success": true }));
        assert!(engine.is_connected(&transport_id));
    }

    #[tokio::test]
    async fn engine_failures_surface_as_replies() {
        let (dispatcher, engine) = setup();
        let mut guest = connect(&dispatcher, "guest");
        send(&dispatcher, &mut guest, ClientEvent::JoinRoom("r1".into())).await.unwrap();

        engine.fail_transports(true);
        let err = send(&dispatcher, &mut guest, ClientEvent::CreateWebRtcTransport)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::EngineFailure { operation: "createWebRtcTransport", .. }));
        assert!(dispatcher.rooms().registry().find_transports_by_connection("guest").is_empty());
    }

    #[tokio::test]
    async fn invalid_room_ids_leave_the_role_unchanged() {
        let (dispatcher, engine) = setup();
        let mut client = connect(&dispatcher, "c1");

        let err = send(&dispatcher, &mut client, ClientEvent::JoinRoom(String::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::BadRequest(_)));
        assert_eq!(client.ctx.role, Role::Unassigned);
        assert_eq!(engine.routers_created(), 0);
    }

    #[tokio::test]
    async fn admin_diagnostics() {
        let (dispatcher, _engine) = setup();
        let mut guest = connect(&dispatcher, "guest");
        publish(&dispatcher, &mut guest, "r2").await;
        send(&dispatcher, &mut guest, ClientEvent::JoinRoom("r1".into())).await.unwrap();
        let mut admin = join_as(&dispatcher, "admin", ClientEvent::JoinAdmin).await;

        let rooms = send(&dispatcher, &mut admin, ClientEvent::GetRooms).await.unwrap();
        assert_eq!(rooms, json!({ "rooms": ["r1", "r2"] }));

        let stats = send(&dispatcher, &mut admin, ClientEvent::GetRoomStats("r2".into()))
            .await
            .unwrap();
        assert_eq!(stats["stats"]["transportsCount"], 1);
        assert_eq!(stats["stats"]["producersCount"], 1);
        assert_eq!(stats["stats"]["consumersCount"], 0);

        let err = send(&dispatcher, &mut admin, ClientEvent::GetRoomStats("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Room not found: ghost");

        let worker = send(&dispatcher, &mut admin, ClientEvent::GetWorkerStats).await.unwrap();
        assert_eq!(worker["stats"]["routers"], 2);
    }
}
