//! Room session coordinator.
//!
//! Owns the document engine and every piece of per-room bookkeeping. All
//! events (bus frames, autosave fires, removal fires) reach it through one
//! FIFO queue and are handled to completion one at a time, so no two engine
//! calls ever overlap and room state needs no locking.
//!
//! ```text
//!  bus frames ─┐
//!  autosave ───┼──► Event queue ──► RoomCoordinator ──► DocumentEngine
//!  removals ───┘                        │
//!                                       ├──► bus: unicast / room broadcast
//!                                       └──► SnapshotStore (blocking pool)
//! ```

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::autosave::Autosave;
use crate::bus::{BusError, MessageBus};
use crate::config::{ConfigError, Settings};
use crate::engine::{DocumentEngine, EngineError, EngineOutput};
use crate::protocol::{
    connection_group, AdminOp, ChannelMessage, ClientMessage, ConnectionId, ProtocolError,
    RpcReply, RpcRequest, ADMIN_CONNECTION_ID,
};
use crate::removal::{RemovalDue, RemovalTimers};
use crate::storage::{StoreError, StoreRegistry};

/// Unit of work for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Frame received from the bus
    Channel(ChannelMessage),
    /// Room has been quiet for its autosave delay
    AutosaveDue(String),
    /// Idle-removal timer fired
    RemovalDue(RemovalDue),
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Snapshot store failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct RoomCoordinator<E, B> {
    engine: E,
    bus: Arc<B>,
    settings: Arc<Settings>,
    stores: Arc<StoreRegistry>,
    autosave: Autosave,
    removals: RemovalTimers,
}

impl<E: DocumentEngine, B: MessageBus> RoomCoordinator<E, B> {
    /// Timer fires are posted to `events`, the same queue bus frames go to.
    pub fn new(
        engine: E,
        bus: Arc<B>,
        settings: Arc<Settings>,
        stores: Arc<StoreRegistry>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let autosave_events = events.clone();
        let autosave = Autosave::new(settings.clone(), move |room: &str| {
            let _ = autosave_events.send(Event::AutosaveDue(room.to_string()));
        });
        let removals = RemovalTimers::new(move |due| {
            let _ = events.send(Event::RemovalDue(due));
        });
        Self {
            engine,
            bus,
            settings,
            stores,
            autosave,
            removals,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Whether an idle-removal timer is armed for `room`.
    pub fn is_removal_pending(&self, room: &str) -> bool {
        self.removals.is_pending(room)
    }

    pub fn is_autosave_armed(&self, room: &str) -> bool {
        self.autosave.is_armed(room)
    }

    /// Handle one event to completion.
    pub async fn handle(&mut self, event: Event) -> Result<(), CoordinatorError> {
        match event {
            Event::Channel(ChannelMessage::Connect(m)) => self.connect(&m.room, m.conn_id).await,
            Event::Channel(ChannelMessage::Disconnect(m)) => {
                self.disconnect(&m.room, m.conn_id).await
            }
            Event::Channel(ChannelMessage::Message(m)) => {
                self.message(&m.room, m.conn_id, &m.payload).await
            }
            Event::Channel(ChannelMessage::Rpc(request)) => {
                self.remote_procedure_call(request).await
            }
            Event::AutosaveDue(room) => {
                self.autosave.reap();
                self.snapshot(&room).await
            }
            Event::RemovalDue(due) => self.remove_if_idle(due).await,
        }
    }

    /// Join `conn_id` to `room`, restoring the room from its snapshot if it
    /// is not loaded.
    pub async fn connect(&mut self, room: &str, conn_id: ConnectionId) -> Result<(), CoordinatorError> {
        log::debug!("Connect {conn_id} to {room}");
        self.removals.cancel(room);

        let output = if self.engine.has_room(room) {
            self.engine.connect(room, conn_id)
        } else {
            match self.load_snapshot(room).await? {
                Some(snapshot) => {
                    log::info!("Restoring room {room} from snapshot ({} bytes)", snapshot.len());
                    self.engine.connect_with_data(room, conn_id, &snapshot)?
                }
                None => self.engine.connect(room, conn_id),
            }
        };
        self.respond(room, conn_id, output).await
    }

    /// Feed a client payload to the engine.
    pub async fn message(
        &mut self,
        room: &str,
        conn_id: ConnectionId,
        payload: &[u8],
    ) -> Result<(), CoordinatorError> {
        if !self.engine.has_room(room) {
            self.try_restore(room, conn_id).await;
        }
        let output = self.engine.handle_message(room, conn_id, payload);
        self.respond(room, conn_id, output).await?;
        if self.engine.has_room(room) {
            self.autosave.nudge(room)?;
        }
        Ok(())
    }

    /// Best effort: a room that cannot be restored is simply left absent.
    async fn try_restore(&mut self, room: &str, conn_id: ConnectionId) {
        match self.load_snapshot(room).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = self.engine.connect_with_data(room, conn_id, &snapshot) {
                    log::warn!("Could not restore room {room}: {e}");
                }
            }
            Ok(None) => log::debug!("Message for unknown room {room} without snapshot"),
            Err(e) => log::warn!("Could not load snapshot of {room}: {e}"),
        }
    }

    /// Remove `conn_id` from `room`; an emptied room is scheduled for removal.
    pub async fn disconnect(&mut self, room: &str, conn_id: ConnectionId) -> Result<(), CoordinatorError> {
        log::debug!("Disconnect {conn_id} from {room}");
        let output = self.engine.disconnect(room, conn_id);
        if self.engine.has_room(room) && !self.engine.is_room_alive(room) {
            let delay = self.settings.room(room).remove_delay_for(room)?;
            self.removals.schedule(room, delay);
        }
        self.respond(room, conn_id, output).await
    }

    /// Answer an administrative call on `request.reply_channel`.
    pub async fn remote_procedure_call(&mut self, request: RpcRequest) -> Result<(), CoordinatorError> {
        let reply = match AdminOp::parse(&request.method, &request.params) {
            Some(op) => self.export(&request.room, &op).await?,
            None => {
                log::warn!(
                    "Unsupported call {}({}) on {}",
                    request.method,
                    request.params.len(),
                    request.room
                );
                RpcReply::Unsupported(request.method.clone())
            }
        };
        if let Err(e) = self.bus.send(&request.reply_channel, reply.encode()?).await {
            log::warn!("Could not deliver reply for {}: {e}", request.room);
        }
        Ok(())
    }

    async fn export(&mut self, room: &str, op: &AdminOp) -> Result<RpcReply, CoordinatorError> {
        if self.engine.has_room(room) {
            return Ok(self.engine.export(room, op).map_or(RpcReply::Unavailable, RpcReply::Ok));
        }

        let snapshot = match self.load_snapshot(room).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                log::debug!("No snapshot for {room}, nothing to export");
                return Ok(RpcReply::Unavailable);
            }
            Err(e) => {
                log::warn!("Could not load snapshot of {room} for export: {e}");
                return Ok(RpcReply::Unavailable);
            }
        };

        // Temporary instance, members of the room never hear about it
        if let Err(e) = self
            .engine
            .connect_with_data(room, ADMIN_CONNECTION_ID, &snapshot)
        {
            log::warn!("Could not restore room {room} for export: {e}");
            return Ok(RpcReply::Unavailable);
        }
        let result = self.engine.export(room, op);
        self.engine.disconnect(room, ADMIN_CONNECTION_ID);
        self.engine.remove_room(room);

        Ok(result.map_or(RpcReply::Unavailable, RpcReply::Ok))
    }

    /// Persist the current state of `room`. A room that is gone is a no-op.
    pub async fn snapshot(&mut self, room: &str) -> Result<(), CoordinatorError> {
        let Some(snapshot) = self.engine.serialize_room(room) else {
            log::debug!("Room {room} is gone, skipping snapshot");
            return Ok(());
        };
        self.save_snapshot(room, snapshot).await?;
        Ok(())
    }

    async fn remove_if_idle(&mut self, due: RemovalDue) -> Result<(), CoordinatorError> {
        if !self.removals.take(&due) {
            log::trace!("Ignoring stale removal of {}", due.room);
            return Ok(());
        }
        let room = due.room;
        if self.engine.is_room_alive(&room) {
            return Ok(());
        }

        self.snapshot(&room).await?;

        if self.engine.is_room_alive(&room) {
            return Ok(());
        }
        self.engine.remove_room(&room);
        self.autosave.forget(&room);
        log::info!("Removed idle room {room}");
        Ok(())
    }

    /// Stop all timers, then save every loaded room. Returns the number of
    /// rooms saved.
    pub async fn shutdown(&mut self) -> Result<usize, CoordinatorError> {
        let removals = self.removals.cancel_all();
        let report = self.autosave.cancel_all().await;
        log::debug!(
            "Cancelled {removals} removal timers and {} autosave waiters",
            report.cancelled
        );

        let rooms = self.engine.list_rooms();
        for room in &rooms {
            log::debug!("Saving snapshot for {room}");
            self.snapshot(room).await?;
        }
        log::info!("Saved {} rooms", rooms.len());
        Ok(rooms.len())
    }

    async fn respond(
        &mut self,
        room: &str,
        conn_id: ConnectionId,
        output: EngineOutput,
    ) -> Result<(), CoordinatorError> {
        if let Some(payload) = output.unicast {
            let frame = ClientMessage::forward(payload).encode()?;
            self.bus.group_send(&connection_group(conn_id), frame).await;
        }
        if let Some(payload) = output.broadcast {
            let frame = ClientMessage::forward(payload).encode()?;
            self.bus.group_send(room, frame).await;
        }
        Ok(())
    }

    fn load_snapshot(
        &self,
        room: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send + 'static {
        let stores = self.stores.clone();
        let backend = self.settings.room(room).storage.clone();
        let room = room.to_string();
        blocking(move || stores.resolve(&backend)?.get(&room))
    }

    fn save_snapshot(
        &self,
        room: &str,
        snapshot: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let stores = self.stores.clone();
        let backend = self.settings.room(room).storage.clone();
        let room = room.to_string();
        blocking(move || stores.resolve(&backend)?.set(&room, &snapshot))
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
}
