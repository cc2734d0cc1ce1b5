use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Relay-assigned handle for one live WebSocket session.
pub type ConnectionId = Uuid;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Offer or answer produced by a peer connection. The relay never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Description(pub serde_json::Value);

impl Description {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoin {
    pub email: String,
    pub room: String,
}

// ---------- Client -> relay ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin(RoomJoin),
    #[serde(rename = "user:call")]
    UserCall { to: ConnectionId, offer: Description },
    #[serde(rename = "call:accepted")]
    CallAccepted { to: ConnectionId, ans: Description },
    #[serde(rename = "peer:nego:needed")]
    NegotiationNeeded { to: ConnectionId, offer: Description },
    #[serde(rename = "peer:nego:done")]
    NegotiationDone { to: ConnectionId, ans: Description },
    #[serde(rename = "call:ended")]
    CallEnded { to: ConnectionId },
}

impl ClientEvent {
    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RoomJoin(_) => "room:join",
            ClientEvent::UserCall { .. } => "user:call",
            ClientEvent::CallAccepted { .. } => "call:accepted",
            ClientEvent::NegotiationNeeded { .. } => "peer:nego:needed",
            ClientEvent::NegotiationDone { .. } => "peer:nego:done",
            ClientEvent::CallEnded { .. } => "call:ended",
        }
    }

    /// Unicast destination. `None` for the room broadcast.
    pub fn destination(&self) -> Option<ConnectionId> {
        match self {
            ClientEvent::RoomJoin(_) => None,
            ClientEvent::UserCall { to, .. }
            | ClientEvent::CallAccepted { to, .. }
            | ClientEvent::NegotiationNeeded { to, .. }
            | ClientEvent::NegotiationDone { to, .. }
            | ClientEvent::CallEnded { to } => Some(*to),
        }
    }
}

// ---------- Relay -> client ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "user:joined")]
    UserJoined { email: String, id: ConnectionId },
    /// Acknowledgement to the joiner, echoing its request.
    #[serde(rename = "room:join")]
    RoomJoined(RoomJoin),
    #[serde(rename = "incoming:call")]
    IncomingCall { from: ConnectionId, offer: Description },
    #[serde(rename = "call:accepted")]
    CallAccepted { from: ConnectionId, ans: Description },
    #[serde(rename = "peer:nego:needed")]
    NegotiationNeeded { from: ConnectionId, offer: Description },
    #[serde(rename = "peer:nego:final")]
    NegotiationFinal { from: ConnectionId, ans: Description },
    #[serde(rename = "call:ended")]
    CallEnded { from: ConnectionId },
}

impl ServerEvent {
    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserJoined { .. } => "user:joined",
            ServerEvent::RoomJoined(_) => "room:join",
            ServerEvent::IncomingCall { .. } => "incoming:call",
            ServerEvent::CallAccepted { .. } => "call:accepted",
            ServerEvent::NegotiationNeeded { .. } => "peer:nego:needed",
            ServerEvent::NegotiationFinal { .. } => "peer:nego:final",
            ServerEvent::CallEnded { .. } => "call:ended",
        }
    }

    /// Provenance of a forwarded negotiation message.
    pub fn sender(&self) -> Option<ConnectionId> {
        match self {
            ServerEvent::UserJoined { .. } | ServerEvent::RoomJoined(_) => None,
            ServerEvent::IncomingCall { from, .. }
            | ServerEvent::CallAccepted { from, .. }
            | ServerEvent::NegotiationNeeded { from, .. }
            | ServerEvent::NegotiationFinal { from, .. }
            | ServerEvent::CallEnded { from } => Some(*from),
        }
    }
}
