//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: Full room snapshots (LZ4 compressed), keyed by room name
//! - `metadata` : Per-room metadata (bincode: sizes, save count, timestamps)
//!
//! Snapshot and metadata are written in one batch, so a reader never sees a
//! snapshot without matching metadata.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write (default: true, snapshots are the only copy)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Number of times the room was saved
    pub saves: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// First save (seconds since epoch)
    pub created_at: u64,
    /// Last save (seconds since epoch)
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new() -> Self {
        let now = unix_now();
        Self {
            saves: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed [`SnapshotStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 frames
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Metadata for `room`, `None` if it was never saved.
    pub fn metadata(&self, room: &str) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, room.as_bytes())?
            .map(|bytes| SnapshotMetadata::decode(&bytes))
            .transpose()
    }

    /// Names of all rooms with a stored snapshot.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }

    /// Remove a room's snapshot and metadata.
    pub fn delete(&self, room: &str) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snapshots, room.as_bytes());
        batch.delete_cf(&cf_meta, room.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksStore {
    fn get(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self.metadata(room)?.unwrap_or_else(SnapshotMetadata::new);
        meta.saves += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, room.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot of {room}: {} bytes ({} compressed)",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}
