//! # logos-yroom, room worker for real-time document collaboration
//!
//! Hosts the authoritative CRDT state of every active room in one process,
//! keeps it durable through debounced autosave and idle-room flushing, and
//! shuts down without losing edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  WebSocket  ┌─────────┐  frames  ┌──────────────────────────┐
//! │ Client   │ ◄─────────► │ Gateway │ ◄──────► │ MessageBus (LocalBus)    │
//! └──────────┘             └─────────┘          └────────────┬─────────────┘
//!                                                            │ worker channel
//!                                                  ┌─────────▼─────────┐
//!                                                  │ Worker            │
//!                                                  │  intake → queue   │
//!                                                  │  → dispatch       │
//!                                                  └─────────┬─────────┘
//!                                                  ┌─────────▼─────────┐
//!                                                  │ RoomCoordinator   │──► SnapshotStore
//!                                                  │  Autosave         │
//!                                                  │  RemovalTimers    │
//!                                                  └─────────┬─────────┘
//!                                                  ┌─────────▼─────────┐
//!                                                  │ DocumentEngine    │
//!                                                  │ (YrsEngine)       │
//!                                                  └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Frames on the bus (tagged bincode)
//! - [`bus`]: Message bus trait and in-process implementation
//! - [`engine`]: Document engine trait and the `yrs` implementation
//! - [`storage`]: Snapshot stores (dummy, memory, RocksDB)
//! - [`autosave`]: Debounced per-room autosave
//! - [`removal`]: Idle-room removal timers
//! - [`coordinator`]: Per-room session handling
//! - [`worker`]: Run-loop and two-phase shutdown
//! - [`gateway`]: WebSocket front end
//! - [`proxy`]: Administrative read access to room documents
//! - [`config`]: Namespaced room settings

pub mod autosave;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod gateway;
pub mod protocol;
pub mod proxy;
pub mod removal;
pub mod storage;
pub mod worker;

// Re-exports for convenience
pub use autosave::{Autosave, CancelReport, SnapshotTrigger};
pub use bus::{BusError, BusStats, LocalBus, MessageBus};
pub use config::{ConfigError, RoomSettings, Settings, StorageBackend};
pub use coordinator::{CoordinatorError, Event, RoomCoordinator};
pub use engine::{DocumentEngine, EngineError, EngineOutput, YrsEngine};
pub use gateway::{Gateway, GatewayConfig, GatewayError, GatewayStats};
pub use protocol::{
    AdminOp, ChannelMessage, ClientMessage, ConnectionId, ProtocolError, RpcReply,
    ADMIN_CONNECTION_ID,
};
pub use proxy::{DocumentProxy, ProxyError};
pub use removal::{RemovalDue, RemovalTimers};
pub use storage::{DummyStore, MemoryStore, RocksStore, SnapshotStore, StoreError, StoreRegistry};
pub use worker::{ShutdownCause, ShutdownOutcome, ShutdownReport, Worker, WorkerError};
