//! Worker integration tests.
//!
//! These tests run a real worker on an in-process bus and drive it through
//! its channel, the way the gateway does. An administrative call doubles as
//! a barrier: frames are handled in order, so once its reply arrives every
//! frame sent before it has been dispatched.

use logos_yroom::config::DEFAULT_NAMESPACE;
use logos_yroom::engine::wire::SyncMessage;
use logos_yroom::{
    AdminOp, ChannelMessage, ConnectionId, DocumentEngine, DocumentProxy, EngineError,
    EngineOutput, LocalBus, MemoryStore, MessageBus, RoomSettings, RpcReply, Settings,
    ShutdownCause, ShutdownOutcome, ShutdownReport, SnapshotStore, StorageBackend, StoreError,
    StoreRegistry, Worker, YrsEngine,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use yrs::{Doc, ReadTxn, StateVector, Text, Transact, WriteTxn};

const CHANNEL: &str = "yroom";

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<ShutdownReport>,
}

impl Running {
    async fn stop(self) -> ShutdownReport {
        let Running { stop, handle } = self;
        let _ = stop.send(());
        wait(handle).await
    }

    /// Wait for the worker to stop on its own.
    async fn join(self) -> ShutdownReport {
        let Running { stop, handle } = self;
        let report = wait(handle).await;
        drop(stop);
        report
    }
}

async fn wait(handle: JoinHandle<ShutdownReport>) -> ShutdownReport {
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap()
}

fn start<E: DocumentEngine>(
    bus: &Arc<LocalBus>,
    engine: E,
    settings: &Arc<Settings>,
    stores: &Arc<StoreRegistry>,
) -> Running {
    let (stop, stopped) = oneshot::channel::<()>();
    let worker = Worker::new(bus.clone(), CHANNEL, engine, settings.clone(), stores.clone());
    let handle = tokio::spawn(worker.run(async move {
        let _ = stopped.await;
        "test".to_string()
    }));
    Running { stop, handle }
}

fn memory_settings(remove_room_delay: f64) -> Arc<Settings> {
    Arc::new(Settings::new().with_namespace(
        DEFAULT_NAMESPACE,
        RoomSettings {
            remove_room_delay,
            storage: StorageBackend::Memory,
            ..RoomSettings::default()
        },
    ))
}

fn registry_with(store: Arc<dyn SnapshotStore>) -> Arc<StoreRegistry> {
    let stores = Arc::new(StoreRegistry::new());
    stores.register(StorageBackend::Memory, store);
    stores
}

fn text_update(content: &str) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, content);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

async fn send(bus: &LocalBus, message: ChannelMessage) {
    bus.send(CHANNEL, message.encode().unwrap()).await.unwrap();
}

async fn edit(bus: &LocalBus, room: &str, conn_id: ConnectionId, content: &str) {
    let payload = SyncMessage::update(conn_id, text_update(content)).encode().unwrap();
    send(bus, ChannelMessage::message(room, conn_id, payload)).await;
}

/// Wait until everything sent so far has been handled.
async fn barrier(bus: &Arc<LocalBus>, settings: &Settings) {
    let proxy = DocumentProxy::new(bus.clone(), settings, "barrier")
        .with_timeout(Duration::from_secs(5));
    let reply = proxy.call(&AdminOp::ExportText("content".into())).await.unwrap();
    assert_eq!(reply, RpcReply::Unavailable);
}

/// Engine that only records the order in which it is called.
#[derive(Default)]
struct RecordingEngine {
    calls: Arc<Mutex<Vec<String>>>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl DocumentEngine for RecordingEngine {
    fn has_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    fn is_room_alive(&self, room: &str) -> bool {
        self.rooms.get(room).is_some_and(|c| !c.is_empty())
    }

    fn connect(&mut self, room: &str, conn_id: ConnectionId) -> EngineOutput {
        self.calls.lock().unwrap().push(format!("connect {room} {conn_id}"));
        self.rooms.entry(room.to_string()).or_default().insert(conn_id);
        EngineOutput::default()
    }

    fn connect_with_data(
        &mut self,
        room: &str,
        conn_id: ConnectionId,
        _snapshot: &[u8],
    ) -> Result<EngineOutput, EngineError> {
        Ok(self.connect(room, conn_id))
    }

    fn handle_message(&mut self, room: &str, conn_id: ConnectionId, payload: &[u8]) -> EngineOutput {
        let text = String::from_utf8_lossy(payload);
        self.calls.lock().unwrap().push(format!("message {room} {conn_id} {text}"));
        EngineOutput::default()
    }

    fn disconnect(&mut self, room: &str, conn_id: ConnectionId) -> EngineOutput {
        self.calls.lock().unwrap().push(format!("disconnect {room} {conn_id}"));
        if let Some(connections) = self.rooms.get_mut(room) {
            connections.remove(&conn_id);
        }
        EngineOutput::default()
    }

    fn serialize_room(&self, room: &str) -> Option<Vec<u8>> {
        self.rooms.get(room).map(|_| room.as_bytes().to_vec())
    }

    fn remove_room(&mut self, room: &str) {
        self.rooms.remove(room);
    }

    fn list_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<_> = self.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    fn export(&self, _room: &str, _op: &AdminOp) -> Option<String> {
        None
    }
}

/// Store whose writes always fail.
struct FailingStore;

impl SnapshotStore for FailingStore {
    fn get(&self, _room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }

    fn set(&self, _room: &str, _snapshot: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::DatabaseError("disk full".into()))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_frames_are_dispatched_in_arrival_order() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(30.0);
    let stores = registry_with(Arc::new(MemoryStore::new()));
    let engine = RecordingEngine::default();
    let calls = engine.calls.clone();
    let worker = start(&bus, engine, &settings, &stores);

    let mut expected = Vec::new();
    for i in 0..10u64 {
        let room = if i % 2 == 0 { "even" } else { "odd" };
        send(&bus, ChannelMessage::connect(room, i + 1)).await;
        send(&bus, ChannelMessage::message(room, i + 1, format!("m{i}").into_bytes())).await;
        expected.push(format!("connect {room} {}", i + 1));
        expected.push(format!("message {room} {} m{i}", i + 1));
    }
    barrier(&bus, &settings).await;

    assert_eq!(*calls.lock().unwrap(), expected);
    let report = worker.stop().await;
    assert_eq!(report.dispatched, 21);
    assert_eq!(report.outcome, ShutdownOutcome::Flushed { rooms: 2 });
}

#[tokio::test]
async fn test_signal_flushes_every_room() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(30.0);
    let store = Arc::new(MemoryStore::new());
    let stores = registry_with(store.clone());
    let worker = start(&bus, YrsEngine::new(), &settings, &stores);

    for (i, room) in ["a", "b", "c"].into_iter().enumerate() {
        let conn = i as u64 + 1;
        send(&bus, ChannelMessage::connect(room, conn)).await;
        edit(&bus, room, conn, room).await;
    }
    barrier(&bus, &settings).await;
    assert_eq!(store.write_count(), 0);

    let report = worker.stop().await;
    assert_eq!(report.cause, ShutdownCause::Signal("test".into()));
    assert_eq!(report.outcome, ShutdownOutcome::Flushed { rooms: 3 });
    assert_eq!(store.rooms(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn test_state_survives_worker_restart() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(30.0);
    let stores = registry_with(Arc::new(MemoryStore::new()));

    let first = start(&bus, YrsEngine::new(), &settings, &stores);
    send(&bus, ChannelMessage::connect("notes", 1)).await;
    edit(&bus, "notes", 1, "persisted").await;
    barrier(&bus, &settings).await;
    first.stop().await;

    let second = start(&bus, YrsEngine::new(), &settings, &stores);
    let proxy = DocumentProxy::new(bus.clone(), &settings, "notes");
    assert_eq!(proxy.export_text("content").await.unwrap(), "persisted");

    // The export did not leave a loaded room behind
    let report = second.stop().await;
    assert_eq!(report.outcome, ShutdownOutcome::Flushed { rooms: 0 });
}

#[tokio::test]
async fn test_undecodable_frame_is_fatal_but_flushes() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(30.0);
    let store = Arc::new(MemoryStore::new());
    let stores = registry_with(store.clone());
    let worker = start(&bus, YrsEngine::new(), &settings, &stores);

    send(&bus, ChannelMessage::connect("room", 1)).await;
    edit(&bus, "room", 1, "before the crash").await;
    bus.send(CHANNEL, vec![99]).await.unwrap();

    let report = worker.join().await;
    assert!(matches!(report.cause, ShutdownCause::Fatal(_)));
    assert_eq!(report.outcome, ShutdownOutcome::Flushed { rooms: 1 });
    assert!(store.get("room").unwrap().is_some());
}

#[tokio::test]
async fn test_corrupt_snapshot_on_connect_is_fatal() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(30.0);
    let store = Arc::new(MemoryStore::new());
    store.set("room", &[0xFF, 0x01]).unwrap();
    let stores = registry_with(store.clone());
    let worker = start(&bus, YrsEngine::new(), &settings, &stores);

    send(&bus, ChannelMessage::connect("room", 1)).await;

    let report = worker.join().await;
    assert!(matches!(report.cause, ShutdownCause::Fatal(_)));
    assert_eq!(report.outcome, ShutdownOutcome::Flushed { rooms: 0 });
    // The bad snapshot is left for inspection
    assert_eq!(store.get("room").unwrap(), Some(vec![0xFF, 0x01]));
}

#[tokio::test]
async fn test_export_of_corrupt_snapshot_keeps_worker_running() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(30.0);
    let store = Arc::new(MemoryStore::new());
    store.set("broken", &[0xFF, 0x01]).unwrap();
    let stores = registry_with(store.clone());
    let worker = start(&bus, YrsEngine::new(), &settings, &stores);

    send(&bus, ChannelMessage::connect("live", 1)).await;
    edit(&bus, "live", 1, "still here").await;

    let broken = DocumentProxy::new(bus.clone(), &settings, "broken")
        .with_timeout(Duration::from_secs(5));
    let reply = broken.call(&AdminOp::ExportText("content".into())).await.unwrap();
    assert_eq!(reply, RpcReply::Unavailable);
    assert!(!worker.handle.is_finished());

    let live = DocumentProxy::new(bus.clone(), &settings, "live");
    assert_eq!(live.export_text("content").await.unwrap(), "still here");

    let report = worker.stop().await;
    assert_eq!(report.cause, ShutdownCause::Signal("test".into()));
    assert_eq!(report.outcome, ShutdownOutcome::Flushed { rooms: 1 });
    assert_eq!(store.get("broken").unwrap(), Some(vec![0xFF, 0x01]));
}

#[tokio::test]
async fn test_failed_flush_forces_shutdown() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(30.0);
    let stores = registry_with(Arc::new(FailingStore));
    let worker = start(&bus, YrsEngine::new(), &settings, &stores);

    send(&bus, ChannelMessage::connect("room", 1)).await;
    barrier(&bus, &settings).await;

    let report = worker.stop().await;
    assert_eq!(report.cause, ShutdownCause::Signal("test".into()));
    assert_eq!(report.outcome, ShutdownOutcome::Forced);
}

#[tokio::test]
async fn test_rejoin_before_removal_keeps_room() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(0.0);
    let store = Arc::new(MemoryStore::new());
    let stores = registry_with(store.clone());
    let worker = start(&bus, YrsEngine::new(), &settings, &stores);

    send(&bus, ChannelMessage::connect("room", 1)).await;
    edit(&bus, "room", 1, "kept").await;
    send(&bus, ChannelMessage::disconnect("room", 1)).await;
    send(&bus, ChannelMessage::connect("room", 2)).await;
    barrier(&bus, &settings).await;
    barrier(&bus, &settings).await;

    // Nothing was saved, so the text can only come from the live room
    assert_eq!(store.write_count(), 0);
    let proxy = DocumentProxy::new(bus.clone(), &settings, "room");
    assert_eq!(proxy.export_text("content").await.unwrap(), "kept");

    let report = worker.stop().await;
    assert_eq!(report.outcome, ShutdownOutcome::Flushed { rooms: 1 });
}

#[tokio::test]
async fn test_idle_room_is_evicted() {
    let bus = Arc::new(LocalBus::new());
    let settings = memory_settings(0.0);
    let store = Arc::new(MemoryStore::new());
    let stores = registry_with(store.clone());
    let worker = start(&bus, YrsEngine::new(), &settings, &stores);

    send(&bus, ChannelMessage::connect("room", 1)).await;
    edit(&bus, "room", 1, "gone").await;
    send(&bus, ChannelMessage::disconnect("room", 1)).await;

    timeout(Duration::from_secs(5), async {
        while store.write_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room was not saved");

    let report = worker.stop().await;
    assert_eq!(report.outcome, ShutdownOutcome::Flushed { rooms: 0 });
}
