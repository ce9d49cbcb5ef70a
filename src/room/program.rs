#![forbid(unsafe_code)]

// Program switch - which room is on air.
//
// The state lives behind a std RwLock. A switch holds the write lock while it
// queues its fan-out, and operator catch-up holds the read lock while it
// queues its snapshot, so every operator's queue ends with the latest state.
// Operator sends never drop: a lagging operator is closed and catches up on
// reconnect.
// Lock order: program, then registry, then peers.

use super::registry::Registry;
use super::roles::Role;
use crate::signaling::peers::PeerDirectory;
use crate::signaling::protocol::ServerEvent;
use std::sync::RwLock as StdRwLock;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProgramState {
    #[default]
    Idle,
    Live(String),
}

impl ProgramState {
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ProgramState::Idle => None,
            ProgramState::Live(room_id) => Some(room_id),
        }
    }

    fn operator_event(&self, registry: &Registry) -> ServerEvent {
        match self {
            ProgramState::Idle => ServerEvent::ProgramStopped,
            ProgramState::Live(room_id) => ServerEvent::NewProgram {
                room_id: room_id.clone(),
                producers: registry.room_producer_ids(room_id),
            },
        }
    }
}

#[derive(Default)]
pub struct ProgramSwitch {
    state: StdRwLock<ProgramState>,
}

impl ProgramSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ProgramState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Moves to `Live(room)` or `Idle` and notifies operators and admins.
    /// A later switch supersedes an earlier one; there is no queueing.
    pub fn switch(&self, target: Option<String>, registry: &Registry, peers: &PeerDirectory) -> ProgramState {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = match target {
            Some(room_id) => ProgramState::Live(room_id),
            None => ProgramState::Idle,
        };

        let operators = peers.broadcast_to_followers(&state.operator_event(registry));
        peers.broadcast_to_role(
            Role::Admin,
            &ServerEvent::ProgramSwitched {
                room_id: state.room_id().map(str::to_string),
            },
        );

        info!("Program switched to {:?} ({} operators notified)", *state, operators);
        state.clone()
    }

    /// Sends the current state to a connection that just became an operator
    pub fn catch_up(&self, connection_id: &str, registry: &Registry, peers: &PeerDirectory) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        peers.send_state_to(connection_id, &state.operator_event(registry));
    }

    /// Announces a producer to operators if its room is on air.
    /// Returns whether it was announced.
    pub fn announce_if_live(&self, room_id: &str, event: &ServerEvent, peers: &PeerDirectory) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.room_id() != Some(room_id) {
            return false;
        }
        peers.broadcast_to_followers(event);
        true
    }

    /// Snapshot for `getProgram`
    pub fn snapshot(&self, registry: &Registry) -> (Option<String>, Vec<String>) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        match &*state {
            ProgramState::Idle => (None, Vec::new()),
            ProgramState::Live(room_id) => (Some(room_id.clone()), registry.room_producer_ids(room_id)),
        }
    }
}
