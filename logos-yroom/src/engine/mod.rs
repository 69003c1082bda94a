//! Document engine: per-room CRDT state behind a synchronous interface.
//!
//! The coordinator treats the engine as a black box that turns membership
//! changes and opaque client payloads into opaque replies. Every call is
//! synchronous; the coordinator never has two calls in flight.
//!
//! [`YrsEngine`] is the bundled implementation, one `yrs::Doc` per room.

pub mod wire;
mod ydoc;

pub use ydoc::YrsEngine;

use crate::protocol::{AdminOp, ConnectionId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Snapshot for room {room} could not be decoded: {reason}")]
    CorruptSnapshot { room: String, reason: String },
}

/// Payloads produced by one engine call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    /// Sent only to the connection that caused the call
    pub unicast: Option<Vec<u8>>,
    /// Sent to every connection in the room
    pub broadcast: Option<Vec<u8>>,
}

impl EngineOutput {
    pub fn unicast(payload: Vec<u8>) -> Self {
        Self {
            unicast: Some(payload),
            broadcast: None,
        }
    }

    pub fn broadcast(payload: Vec<u8>) -> Self {
        Self {
            unicast: None,
            broadcast: Some(payload),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unicast.is_none() && self.broadcast.is_none()
    }
}

/// Per-room CRDT state machine.
pub trait DocumentEngine: Send + 'static {
    /// Whether an instance exists for `room` (live or idle).
    fn has_room(&self, room: &str) -> bool;

    /// Whether `room` has at least one connection.
    fn is_room_alive(&self, room: &str) -> bool;

    /// Join `conn_id`, creating an empty room if needed.
    fn connect(&mut self, room: &str, conn_id: ConnectionId) -> EngineOutput;

    /// Create `room` from a snapshot, then join `conn_id`.
    fn connect_with_data(
        &mut self,
        room: &str,
        conn_id: ConnectionId,
        snapshot: &[u8],
    ) -> Result<EngineOutput, EngineError>;

    /// Apply a client payload. Unknown rooms or malformed payloads produce no output.
    fn handle_message(&mut self, room: &str, conn_id: ConnectionId, payload: &[u8]) -> EngineOutput;

    /// Remove `conn_id`; any output is teardown for the remaining members.
    fn disconnect(&mut self, room: &str, conn_id: ConnectionId) -> EngineOutput;

    /// Full-state capture of `room`, `None` if it does not exist.
    fn serialize_room(&self, room: &str) -> Option<Vec<u8>>;

    fn remove_room(&mut self, room: &str);

    fn list_rooms(&self) -> Vec<String>;

    /// Run a read-only administrative export. `None` if the room or type is absent.
    fn export(&self, room: &str, op: &AdminOp) -> Option<String>;
}
