use serde::{Deserialize, Serialize};

use crate::error::FlightError;

/// Frames above this size are answered with an error and dropped.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Frames above this size are refused by the websocket layer and the
/// connection is closed with 1009.
pub const DEFAULT_TRANSPORT_MAX_BYTES: usize = 100 * 1024 * 1024;

/// Messages sent from a client to the tower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Set the display name other clients see.
    RegisterDetails { name: String },
    CreateFlight,
    JoinFlight { flight_code: String },
    /// Leave the current flight without closing the socket.
    LeaveFlight,
    InviteToFlight {
        invitee_id: String,
        flight_code: String,
    },
    /// Opaque WebRTC negotiation payload for the other flight member.
    Signal { data: serde_json::Value },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RegisterDetails { .. } => "register-details",
            ClientMessage::CreateFlight => "create-flight",
            ClientMessage::JoinFlight { .. } => "join-flight",
            ClientMessage::LeaveFlight => "leave-flight",
            ClientMessage::InviteToFlight { .. } => "invite-to-flight",
            ClientMessage::Signal { .. } => "signal",
        }
    }
}

/// Messages sent from the tower to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Registered { id: String },
    UsersOnNetworkUpdate { users: Vec<PeerInfo> },
    FlightCreated { flight_code: String },
    FlightInvitation {
        flight_code: String,
        from_name: String,
    },
    PeerJoined {
        flight_code: String,
        connection_type: ConnectionType,
        peer: PeerInfo,
    },
    PeerLeft,
    Signal { data: serde_json::Value },
    Error { message: String },
    ServerShutdown { message: String },
}

/// Public identity of a client as other clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
}

/// Advisory hint for the client's ICE strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Local,
    Remote,
}

/// Validate and decode one inbound text frame.
pub fn decode_text(text: &str, max_bytes: usize) -> Result<ClientMessage, FlightError> {
    if text.len() > max_bytes {
        return Err(FlightError::validation(format!(
            "Message too large ({} bytes, limit {})",
            text.len(),
            max_bytes
        )));
    }
    serde_json::from_str(text)
        .map_err(|err| FlightError::validation(format!("Invalid message format: {err}")))
}

/// Binary frames are accepted when they carry UTF-8 JSON.
pub fn decode_binary(bytes: &[u8], max_bytes: usize) -> Result<ClientMessage, FlightError> {
    if bytes.len() > max_bytes {
        return Err(FlightError::validation(format!(
            "Message too large ({} bytes, limit {})",
            bytes.len(),
            max_bytes
        )));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| FlightError::validation("Binary frames must contain UTF-8 JSON"))?;
    decode_text(text, max_bytes)
}
