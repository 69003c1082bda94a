//! Frames exchanged over the message bus.
//!
//! Worker-bound frames carry a one-byte type tag followed by a
//! bincode-encoded body:
//! ```text
//! ┌──────────┬──────────────────────────────────────┐
//! │ kind     │ body (bincode, standard config)      │
//! │ 1 byte   │ variable                             │
//! └──────────┴──────────────────────────────────────┘
//! ```
//! A frame whose tag is missing or unknown cannot be routed and is reported
//! as [`ProtocolError::UnknownMessageType`] so the worker can stop instead of
//! silently dropping it.
//!
//! Connection-bound frames ([`ClientMessage`]) and RPC replies ([`RpcReply`])
//! are plain bincode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Process-unique connection identifier. `0` is reserved for the worker.
pub type ConnectionId = u64;

/// Connection id used by the worker for temporary administrative joins.
pub const ADMIN_CONNECTION_ID: ConnectionId = 0;

/// Bus group that reaches exactly one connection.
pub fn connection_group(conn_id: ConnectionId) -> String {
    format!("yroom-connection_{conn_id}")
}

/// Type tag of a worker-bound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Connect = 1,
    Disconnect = 2,
    Message = 3,
    Rpc = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(MessageKind::Connect),
            2 => Ok(MessageKind::Disconnect),
            3 => Ok(MessageKind::Message),
            4 => Ok(MessageKind::Rpc),
            other => Err(ProtocolError::UnknownMessageType(Some(other))),
        }
    }
}

/// A connection joining or leaving a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub room: String,
    pub conn_id: ConnectionId,
}

/// An opaque engine payload sent by a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPayload {
    pub room: String,
    pub conn_id: ConnectionId,
    pub payload: Vec<u8>,
}

/// Administrative call, answered on `reply_channel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub room: String,
    pub reply_channel: String,
    pub method: String,
    pub params: Vec<String>,
}

/// Everything the worker accepts from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Connect(Membership),
    Disconnect(Membership),
    Message(RoomPayload),
    Rpc(RpcRequest),
}

impl ChannelMessage {
    pub fn connect(room: impl Into<String>, conn_id: ConnectionId) -> Self {
        ChannelMessage::Connect(Membership { room: room.into(), conn_id })
    }

    pub fn disconnect(room: impl Into<String>, conn_id: ConnectionId) -> Self {
        ChannelMessage::Disconnect(Membership { room: room.into(), conn_id })
    }

    pub fn message(room: impl Into<String>, conn_id: ConnectionId, payload: Vec<u8>) -> Self {
        ChannelMessage::Message(RoomPayload {
            room: room.into(),
            conn_id,
            payload,
        })
    }

    pub fn rpc(
        room: impl Into<String>,
        reply_channel: impl Into<String>,
        op: &AdminOp,
    ) -> Self {
        ChannelMessage::Rpc(RpcRequest {
            room: room.into(),
            reply_channel: reply_channel.into(),
            method: op.method().to_string(),
            params: op.params(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ChannelMessage::Connect(_) => MessageKind::Connect,
            ChannelMessage::Disconnect(_) => MessageKind::Disconnect,
            ChannelMessage::Message(_) => MessageKind::Message,
            ChannelMessage::Rpc(_) => MessageKind::Rpc,
        }
    }

    /// Room this message targets.
    pub fn room(&self) -> &str {
        match self {
            ChannelMessage::Connect(m) | ChannelMessage::Disconnect(m) => &m.room,
            ChannelMessage::Message(m) => &m.room,
            ChannelMessage::Rpc(r) => &r.room,
        }
    }

    /// Serialize to a tagged frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = vec![self.kind() as u8];
        let body = match self {
            ChannelMessage::Connect(m) | ChannelMessage::Disconnect(m) => encode_body(m)?,
            ChannelMessage::Message(m) => encode_body(m)?,
            ChannelMessage::Rpc(r) => encode_body(r)?,
        };
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Deserialize a tagged frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, body) = frame
            .split_first()
            .ok_or(ProtocolError::UnknownMessageType(None))?;
        Ok(match MessageKind::try_from(tag)? {
            MessageKind::Connect => ChannelMessage::Connect(decode_body(body)?),
            MessageKind::Disconnect => ChannelMessage::Disconnect(decode_body(body)?),
            MessageKind::Message => ChannelMessage::Message(decode_body(body)?),
            MessageKind::Rpc => ChannelMessage::Rpc(decode_body(body)?),
        })
    }
}

/// Frames delivered to client connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Engine output to be written to the socket as-is
    Forward { payload: Vec<u8> },
}

impl ClientMessage {
    pub fn forward(payload: Vec<u8>) -> Self {
        ClientMessage::Forward { payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_body(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_body(bytes)
    }
}

/// Answer to an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    /// Exported content
    Ok(String),
    /// Room or shared type not present and not restorable
    Unavailable,
    /// Method name or arity not recognized
    Unsupported(String),
}

impl RpcReply {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_body(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_body(bytes)
    }
}

/// Read-only administrative operations on a room's document.
///
/// Parsed from a method name and positional parameters; anything else is
/// rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminOp {
    ExportText(String),
    ExportMap(String),
    ExportArray(String),
    ExportXmlFragment(String),
}

impl AdminOp {
    pub fn parse(method: &str, params: &[String]) -> Option<Self> {
        let [name] = params else {
            return None;
        };
        let name = name.clone();
        match method {
            "get_text" => Some(AdminOp::ExportText(name)),
            "get_map" => Some(AdminOp::ExportMap(name)),
            "get_array" => Some(AdminOp::ExportArray(name)),
            "get_xml_fragment" => Some(AdminOp::ExportXmlFragment(name)),
            _ => None,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            AdminOp::ExportText(_) => "get_text",
            AdminOp::ExportMap(_) => "get_map",
            AdminOp::ExportArray(_) => "get_array",
            AdminOp::ExportXmlFragment(_) => "get_xml_fragment",
        }
    }

    /// Name of the shared type being exported.
    pub fn name(&self) -> &str {
        match self {
            AdminOp::ExportText(name)
            | AdminOp::ExportMap(name)
            | AdminOp::ExportArray(name)
            | AdminOp::ExportXmlFragment(name) => name,
        }
    }

    pub fn params(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }
}

fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(body, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (body, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(body)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Frame tag missing (`None`) or not a known message type
    UnknownMessageType(Option<u8>),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownMessageType(None) => write!(f, "Received message with no type"),
            Self::UnknownMessageType(Some(tag)) => write!(f, "Received message with unknown type {tag}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
