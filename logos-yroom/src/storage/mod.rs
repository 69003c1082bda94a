//! Snapshot persistence for rooms.
//!
//! ```text
//! ┌─────────────┐  snapshot / get   ┌──────────────┐
//! │ Coordinator │ ────────────────► │ StoreRegistry│
//! │ (one task)  │  spawn_blocking   └──────┬───────┘
//! └─────────────┘                          │ one store per backend
//!                        ┌─────────────────┼──────────────────┐
//!                        ▼                 ▼                  ▼
//!                  ┌───────────┐    ┌─────────────┐    ┌─────────────┐
//!                  │ DummyStore│    │ MemoryStore │    │ RocksStore  │
//!                  └───────────┘    └─────────────┘    └─────────────┘
//! ```
//!
//! Stores are synchronous; the coordinator calls them on the blocking pool
//! so a slow disk never stalls message dispatch for other rooms.

pub mod rocks;

pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::StorageBackend;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Store task did not complete
    TaskFailed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::TaskFailed(e) => write!(f, "Store task failed: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable home of room snapshots, keyed by room name.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Latest snapshot of `room`, `None` if it was never saved.
    fn get(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the snapshot of `room`.
    fn set(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Store that forgets everything.
#[derive(Debug, Default)]
pub struct DummyStore;

impl SnapshotStore for DummyStore {
    fn get(&self, _room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }

    fn set(&self, _room: &str, _snapshot: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Process-local store, mainly for tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .snapshots
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }
}

impl SnapshotStore for MemoryStore {
    fn get(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(snapshots.get(room).cloned())
    }

    fn set(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
            .insert(room.to_string(), snapshot.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Resolves a room's configured backend to a shared store instance.
///
/// Stores are opened lazily, once per distinct backend. Pre-registered
/// stores take precedence, which lets tests observe what the worker wrote.
#[derive(Default)]
pub struct StoreRegistry {
    stores: Mutex<HashMap<StorageBackend, Arc<dyn SnapshotStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `store` for every room configured with `backend`.
    pub fn register(&self, backend: StorageBackend, store: Arc<dyn SnapshotStore>) {
        if let Ok(mut stores) = self.stores.lock() {
            stores.insert(backend, store);
        }
    }

    /// Store for `backend`, opening it on first use.
    pub fn resolve(&self, backend: &StorageBackend) -> Result<Arc<dyn SnapshotStore>, StoreError> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        if let Some(store) = stores.get(backend) {
            return Ok(store.clone());
        }
        let store: Arc<dyn SnapshotStore> = match backend {
            StorageBackend::Dummy => Arc::new(DummyStore),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Rocks { path } => {
                log::info!("Opening snapshot database at {}", path.display());
                Arc::new(RocksStore::open(StoreConfig::new(path.clone()))?)
            }
        };
        stores.insert(backend.clone(), store.clone());
        Ok(store)
    }
}
