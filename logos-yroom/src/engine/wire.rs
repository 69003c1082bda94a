//! Binary messages spoken between clients and [`YrsEngine`](super::YrsEngine).
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬──────────┐
//! │ msg_type │ origin   │ payload  │
//! │ 1 byte   │ varint   │ variable │
//! └──────────┴──────────┴──────────┘
//! ```
//!
//! `origin` is the connection that produced the content (0 = server), so
//! clients can skip their own echoes.

use serde::{Deserialize, Serialize};

use crate::protocol::{ConnectionId, ProtocolError};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector for the sync handshake
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Opaque presence state of one connection
    Awareness = 4,
    /// Presence of `origin` is gone
    AwarenessRemoved = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Top-level engine message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub origin: ConnectionId,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(origin: ConnectionId, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            origin,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(origin: ConnectionId, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            origin,
            payload: state_diff,
        }
    }

    /// Create an update message.
    pub fn update(origin: ConnectionId, yrs_update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            origin,
            payload: yrs_update,
        }
    }

    pub fn awareness(origin: ConnectionId, state: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            origin,
            payload: state,
        }
    }

    pub fn awareness_removed(origin: ConnectionId) -> Self {
        Self {
            msg_type: MessageType::AwarenessRemoved,
            origin,
            payload: Vec::new(),
        }
    }

    pub fn ping(origin: ConnectionId) -> Self {
        Self {
            msg_type: MessageType::Ping,
            origin,
            payload: Vec::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            msg_type: MessageType::Pong,
            origin: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}
