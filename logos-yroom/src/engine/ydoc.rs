use std::collections::{HashMap, HashSet};
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update};

use super::wire::{MessageType, SyncMessage};
use super::{DocumentEngine, EngineError, EngineOutput};
use crate::protocol::{AdminOp, ConnectionId};

/// Authoritative state of one room.
struct RoomDoc {
    doc: Doc,
    connections: HashSet<ConnectionId>,
    /// Last presence blob per connection
    awareness: HashMap<ConnectionId, Vec<u8>>,
}

impl RoomDoc {
    fn new() -> Self {
        Self {
            doc: Doc::new(),
            connections: HashSet::new(),
            awareness: HashMap::new(),
        }
    }

    fn from_snapshot(room: &str, snapshot: &[u8]) -> Result<Self, EngineError> {
        let update = Update::decode_v1(snapshot).map_err(|e| EngineError::CorruptSnapshot {
            room: room.to_string(),
            reason: e.to_string(),
        })?;
        let state = Self::new();
        state
            .doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| EngineError::CorruptSnapshot {
                room: room.to_string(),
                reason: e.to_string(),
            })?;
        Ok(state)
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Updates the remote side is missing, given its state vector.
    fn diff(&self, remote_sv: &[u8]) -> Option<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).ok()?;
        Some(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Decode and integrate `update`. `false` if either step fails.
    fn apply(&self, update: &[u8]) -> bool {
        match Update::decode_v1(update) {
            Ok(update) => self.doc.transact_mut().apply_update(update).is_ok(),
            Err(_) => false,
        }
    }

    fn full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn greeting(&self) -> EngineOutput {
        encode(&SyncMessage::sync_step1(0, self.state_vector()))
            .map(EngineOutput::unicast)
            .unwrap_or_default()
    }
}

fn encode(msg: &SyncMessage) -> Option<Vec<u8>> {
    match msg.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::error!("Failed to encode {:?} message: {e}", msg.msg_type);
            None
        }
    }
}

/// [`DocumentEngine`] backed by one `yrs::Doc` per room.
#[derive(Default)]
pub struct YrsEngine {
    rooms: HashMap<String, RoomDoc>,
}

impl YrsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently in `room`.
    pub fn connection_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |r| r.connections.len())
    }
}

impl DocumentEngine for YrsEngine {
    fn has_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    fn is_room_alive(&self, room: &str) -> bool {
        self.connection_count(room) > 0
    }

    fn connect(&mut self, room: &str, conn_id: ConnectionId) -> EngineOutput {
        let state = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(RoomDoc::new);
        state.connections.insert(conn_id);
        state.greeting()
    }

    fn connect_with_data(
        &mut self,
        room: &str,
        conn_id: ConnectionId,
        snapshot: &[u8],
    ) -> Result<EngineOutput, EngineError> {
        if !self.rooms.contains_key(room) {
            let state = RoomDoc::from_snapshot(room, snapshot)?;
            self.rooms.insert(room.to_string(), state);
        }
        Ok(self.connect(room, conn_id))
    }

    fn handle_message(&mut self, room: &str, conn_id: ConnectionId, payload: &[u8]) -> EngineOutput {
        let Some(state) = self.rooms.get_mut(room) else {
            log::debug!("Dropping message from {conn_id} for absent room {room}");
            return EngineOutput::default();
        };
        let msg = match SyncMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Malformed payload from {conn_id} in room {room}: {e}");
                return EngineOutput::default();
            }
        };

        match msg.msg_type {
            MessageType::SyncStep1 => state
                .diff(&msg.payload)
                .and_then(|diff| encode(&SyncMessage::sync_step2(0, diff)))
                .map(EngineOutput::unicast)
                .unwrap_or_default(),

            MessageType::SyncStep2 | MessageType::Update => {
                if !state.apply(&msg.payload) {
                    log::warn!("Invalid update from {conn_id} in room {room}");
                    return EngineOutput::default();
                }
                encode(&SyncMessage::update(conn_id, msg.payload))
                    .map(EngineOutput::broadcast)
                    .unwrap_or_default()
            }

            MessageType::Awareness => {
                state.awareness.insert(conn_id, msg.payload.clone());
                encode(&SyncMessage::awareness(conn_id, msg.payload))
                    .map(EngineOutput::broadcast)
                    .unwrap_or_default()
            }

            MessageType::Ping => encode(&SyncMessage::pong())
                .map(EngineOutput::unicast)
                .unwrap_or_default(),

            MessageType::AwarenessRemoved | MessageType::Pong => {
                log::trace!("Ignoring {:?} from {conn_id}", msg.msg_type);
                EngineOutput::default()
            }
        }
    }

    fn disconnect(&mut self, room: &str, conn_id: ConnectionId) -> EngineOutput {
        let Some(state) = self.rooms.get_mut(room) else {
            return EngineOutput::default();
        };
        state.connections.remove(&conn_id);
        match state.awareness.remove(&conn_id) {
            Some(_) => encode(&SyncMessage::awareness_removed(conn_id))
                .map(EngineOutput::broadcast)
                .unwrap_or_default(),
            None => EngineOutput::default(),
        }
    }

    fn serialize_room(&self, room: &str) -> Option<Vec<u8>> {
        self.rooms.get(room).map(RoomDoc::full_state)
    }

    fn remove_room(&mut self, room: &str) {
        self.rooms.remove(room);
    }

    fn list_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    fn export(&self, room: &str, op: &AdminOp) -> Option<String> {
        let state = self.rooms.get(room)?;
        let txn = state.doc.transact();
        match op {
            AdminOp::ExportText(name) => txn.get_text(name.as_str()).map(|t| t.get_string(&txn)),
            AdminOp::ExportMap(name) => txn
                .get_map(name.as_str())
                .and_then(|m| serde_json::to_string(&m.to_json(&txn)).ok()),
            AdminOp::ExportArray(name) => txn
                .get_array(name.as_str())
                .and_then(|a| serde_json::to_string(&a.to_json(&txn)).ok()),
            AdminOp::ExportXmlFragment(name) => txn
                .get_xml_fragment(name.as_str())
                .map(|x| x.get_string(&txn)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Map, Text, TextPrelim, WriteTxn};

    fn snapshot_with_text(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn update_inserting(content: &str) -> Vec<u8> {
        snapshot_with_text(content)
    }

    fn decode(payload: &[u8]) -> SyncMessage {
        SyncMessage::decode(payload).unwrap()
    }

    /// Two updates from the same client that disagree on what block (1, 0)
    /// is: text content in the first, a nested type in the second. Applying
    /// the second on top of the first decodes fine but cannot integrate.
    fn conflicting_updates() -> (Vec<u8>, Vec<u8>) {
        let plain = Doc::with_client_id(1);
        {
            let mut txn = plain.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "a");
        }
        let base = plain
            .transact()
            .encode_state_as_update_v1(&StateVector::default());

        let nested = Doc::with_client_id(1);
        let inner = {
            let mut txn = nested.transact_mut();
            let map = txn.get_or_insert_map("m");
            map.insert(&mut txn, "k", TextPrelim::new(""))
        };
        let sv = nested.transact().state_vector();
        {
            let mut txn = nested.transact_mut();
            inner.insert(&mut txn, 0, "x");
        }
        let child = nested.transact().encode_state_as_update_v1(&sv);
        (base, child)
    }

    #[test]
    fn test_connect_creates_room_and_greets() {
        let mut engine = YrsEngine::new();
        assert!(!engine.has_room("r"));

        let out = engine.connect("r", 1);
        assert!(engine.has_room("r"));
        assert!(engine.is_room_alive("r"));
        assert!(out.broadcast.is_none());
        assert_eq!(decode(&out.unicast.unwrap()).msg_type, MessageType::SyncStep1);
    }

    #[test]
    fn test_connect_with_data_restores_content() {
        let mut engine = YrsEngine::new();
        engine
            .connect_with_data("r", 1, &snapshot_with_text("Hello, persistence!"))
            .unwrap();

        let text = engine.export("r", &AdminOp::ExportText("content".into()));
        assert_eq!(text.as_deref(), Some("Hello, persistence!"));
    }

    #[test]
    fn test_connect_with_corrupt_snapshot() {
        let mut engine = YrsEngine::new();
        let err = engine.connect_with_data("r", 1, &[0xFF, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, EngineError::CorruptSnapshot { .. }));
        assert!(!engine.has_room("r"));
    }

    #[test]
    fn test_update_is_applied_and_broadcast() {
        let mut engine = YrsEngine::new();
        engine.connect("r", 1);

        let payload = SyncMessage::update(1, update_inserting("abc")).encode().unwrap();
        let out = engine.handle_message("r", 1, &payload);
        let broadcast = decode(&out.broadcast.unwrap());
        assert_eq!(broadcast.msg_type, MessageType::Update);
        assert_eq!(broadcast.origin, 1);
        assert!(out.unicast.is_none());

        assert_eq!(
            engine.export("r", &AdminOp::ExportText("content".into())).as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn test_sync_step1_answers_with_diff() {
        let mut engine = YrsEngine::new();
        engine.connect_with_data("r", 1, &snapshot_with_text("xyz")).unwrap();

        let empty_sv = StateVector::default().encode_v1();
        let payload = SyncMessage::sync_step1(2, empty_sv).encode().unwrap();
        let out = engine.handle_message("r", 2, &payload);
        let reply = decode(&out.unicast.unwrap());
        assert_eq!(reply.msg_type, MessageType::SyncStep2);

        // The diff rebuilds the document on a fresh client
        let client = Doc::new();
        {
            let mut txn = client.transact_mut();
            let _ = txn.apply_update(Update::decode_v1(&reply.payload).unwrap());
        }
        let txn = client.transact();
        assert_eq!(txn.get_text("content").unwrap().get_string(&txn), "xyz");
    }

    #[test]
    fn test_malformed_payload_is_ignored() {
        let mut engine = YrsEngine::new();
        engine.connect("r", 1);
        assert!(engine.handle_message("r", 1, &[0xFF, 0xFF]).is_empty());

        let bad_update = SyncMessage::update(1, vec![0xFF, 0xFF, 0xFF]).encode().unwrap();
        assert!(engine.handle_message("r", 1, &bad_update).is_empty());
    }

    #[test]
    fn test_message_for_absent_room() {
        let mut engine = YrsEngine::new();
        let payload = SyncMessage::ping(1).encode().unwrap();
        assert!(engine.handle_message("missing", 1, &payload).is_empty());
        assert!(!engine.has_room("missing"));
    }

    #[test]
    fn test_ping_pong() {
        let mut engine = YrsEngine::new();
        engine.connect("r", 1);
        let out = engine.handle_message("r", 1, &SyncMessage::ping(1).encode().unwrap());
        assert_eq!(decode(&out.unicast.unwrap()).msg_type, MessageType::Pong);
    }

    #[test]
    fn test_disconnect_retracts_awareness() {
        let mut engine = YrsEngine::new();
        engine.connect("r", 1);
        engine.connect("r", 2);

        let presence = SyncMessage::awareness(1, b"cursor@3".to_vec()).encode().unwrap();
        let out = engine.handle_message("r", 1, &presence);
        assert_eq!(decode(&out.broadcast.unwrap()).payload, b"cursor@3".to_vec());

        let out = engine.disconnect("r", 1);
        let teardown = decode(&out.broadcast.unwrap());
        assert_eq!(teardown.msg_type, MessageType::AwarenessRemoved);
        assert_eq!(teardown.origin, 1);
        assert!(engine.is_room_alive("r"));

        // No presence, no teardown
        assert!(engine.disconnect("r", 2).is_empty());
        assert!(!engine.is_room_alive("r"));
        assert!(engine.has_room("r"));
    }

    #[test]
    fn test_serialize_and_remove() {
        let mut engine = YrsEngine::new();
        assert!(engine.serialize_room("r").is_none());

        engine.connect_with_data("r", 1, &snapshot_with_text("keep me")).unwrap();
        let bytes = engine.serialize_room("r").unwrap();

        engine.remove_room("r");
        assert!(!engine.has_room("r"));

        engine.connect_with_data("r", 2, &bytes).unwrap();
        assert_eq!(
            engine.export("r", &AdminOp::ExportText("content".into())).as_deref(),
            Some("keep me")
        );
    }

    #[test]
    fn test_list_rooms_sorted() {
        let mut engine = YrsEngine::new();
        engine.connect("b", 1);
        engine.connect("a", 2);
        assert_eq!(engine.list_rooms(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_export_map_as_json() {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let map = txn.get_or_insert_map("settings");
            map.insert(&mut txn, "theme", "dark");
        }
        let snapshot = doc.transact().encode_state_as_update_v1(&StateVector::default());

        let mut engine = YrsEngine::new();
        engine.connect_with_data("r", 1, &snapshot).unwrap();
        let json = engine.export("r", &AdminOp::ExportMap("settings".into())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["theme"], "dark");
    }

    #[test]
    fn test_export_missing() {
        let mut engine = YrsEngine::new();
        assert!(engine.export("nope", &AdminOp::ExportText("content".into())).is_none());
        engine.connect("r", 1);
        assert!(engine.export("r", &AdminOp::ExportArray("absent".into())).is_none());
    }

    #[test]
    fn test_update_that_cannot_integrate_is_not_broadcast() {
        let (base, child) = conflicting_updates();
        let mut engine = YrsEngine::new();
        engine.connect("r", 1);
        engine.connect("r", 2);
        let out = engine.handle_message("r", 1, &SyncMessage::update(1, base).encode().unwrap());
        assert!(out.broadcast.is_some());

        let out = engine.handle_message("r", 1, &SyncMessage::update(1, child).encode().unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn test_snapshot_that_cannot_integrate_is_corrupt() {
        let (base, child) = conflicting_updates();
        let snapshot = yrs::merge_updates_v1([base, child]).unwrap();

        let mut engine = YrsEngine::new();
        let err = engine.connect_with_data("r", 1, &snapshot).unwrap_err();
        assert!(matches!(err, EngineError::CorruptSnapshot { .. }));
        assert!(!engine.has_room("r"));
    }
}
