#![forbid(unsafe_code)]

// Signaling protocol - named events over the WebSocket.
//
// Inbound frames are `{"event": name, "data": payload, "ack": n}`. A frame
// carrying `ack` expects exactly one reply `{"ack": n, "data": ...}`; pushes
// from the server are `{"event": name, "data": payload}`.

use crate::error::SignalError;
use crate::media::{MediaKind, ProducerId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Client-to-server events
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Join a guest room
    JoinRoom(String),
    /// Join as the broadcast operator
    JoinObs,
    JoinAdmin,
    GetRouterRtpCapabilities,
    /// Capabilities of the default room, created on demand
    GetDefaultRouterRtpCapabilities,
    CreateWebRtcTransport,
    #[serde(rename_all = "camelCase")]
    ConnectWebRtcTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        #[serde(default)]
        app_data: Value,
    },
    /// Consume on the connection's most recently created transport
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    ConsumeByTransport {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    /// Put a room on program, or stop the program with `null`
    SwitchProgram(Option<String>),
    GetProgram,
    GetRoomStats(String),
    GetWorkerStats,
    GetRooms,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "joinRoom",
            ClientEvent::JoinObs => "joinObs",
            ClientEvent::JoinAdmin => "joinAdmin",
            ClientEvent::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientEvent::GetDefaultRouterRtpCapabilities => "getDefaultRouterRtpCapabilities",
            ClientEvent::CreateWebRtcTransport => "createWebRtcTransport",
            ClientEvent::ConnectWebRtcTransport { .. } => "connectWebRtcTransport",
            ClientEvent::Produce { .. } => "produce",
            ClientEvent::Consume { .. } => "consume",
            ClientEvent::ConsumeByTransport { .. } => "consumeByTransport",
            ClientEvent::PauseConsumer { .. } => "pauseConsumer",
            ClientEvent::ResumeConsumer { .. } => "resumeConsumer",
            ClientEvent::SwitchProgram(_) => "switchProgram",
            ClientEvent::GetProgram => "getProgram",
            ClientEvent::GetRoomStats(_) => "getRoomStats",
            ClientEvent::GetWorkerStats => "getWorkerStats",
            ClientEvent::GetRooms => "getRooms",
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    ack: Option<u64>,
}

/// A decoded inbound frame. `event` is an error when the frame was well
/// formed but its event or payload was not, so the ack can still be answered.
#[derive(Debug)]
pub struct Inbound {
    pub ack: Option<u64>,
    pub event: Result<ClientEvent, SignalError>,
}

/// Decodes one text frame. Returns `Err` only when the frame is not an
/// event envelope at all.
pub fn decode(text: &str) -> Result<Inbound, SignalError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| SignalError::BadRequest(format!("malformed frame: {e}")))?;

    let mut envelope = Map::new();
    envelope.insert("event".into(), Value::String(raw.event.clone()));
    // Unit events carry no payload; a null payload is treated as absent
    if !raw.data.is_null() {
        envelope.insert("data".into(), raw.data);
    }

    let event = serde_json::from_value::<ClientEvent>(Value::Object(envelope))
        .map_err(|e| SignalError::BadRequest(format!("invalid {} payload: {e}", raw.event)));

    Ok(Inbound { ack: raw.ack, event })
}

/// Server-to-client pushes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Sent once after the socket opens
    #[serde(rename_all = "camelCase")]
    Connected { socket_id: String },
    /// A producer appeared in the live room (operators only)
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        socket_id: String,
        kind: MediaKind,
        room_id: String,
    },
    /// A producer appeared in any room (admins only)
    #[serde(rename_all = "camelCase")]
    ProducerAdded {
        producer_id: ProducerId,
        socket_id: String,
        kind: MediaKind,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    NewProgram {
        room_id: String,
        producers: Vec<ProducerId>,
    },
    ProgramStopped,
    #[serde(rename_all = "camelCase")]
    ProgramSwitched { room_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    PeerDisconnected { socket_id: String },
    Error { message: String },
}

impl ServerEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Reply to a frame that carried an `ack`
#[derive(Debug, Serialize)]
pub struct AckReply {
    pub ack: u64,
    pub data: Value,
}

impl AckReply {
    pub fn new(ack: u64, result: Result<Value, SignalError>) -> Self {
        let data = match result {
            Ok(data) => data,
            Err(e) => error_payload(&e),
        };
        Self { ack, data }
    }
}

/// The `{error: message}` payload every failure reply carries
pub fn error_payload(error: &SignalError) -> Value {
    json!({ "error": error.to_string() })
}
