//! Per-room settings resolved by namespace.
//!
//! Room names are dotted (`textcollab.meeting-notes`). A room's settings come
//! from the longest namespace key that is a dotted prefix of its name, then
//! from the `default` namespace, then from the built-in defaults. A namespace
//! only overrides the fields it names.
//!
//! ```json
//! {
//!   "namespaces": {
//!     "default":    { "remove_room_delay": 30 },
//!     "textcollab": { "autosave_delay": 5, "storage": { "backend": "memory" } }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Namespace consulted when no prefix of the room name matches.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Separator between namespace segments in a room name.
pub const NAMESPACE_SEPARATOR: char = '.';

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Autosave delay for room {room} has to be strictly positive, got {delay}")]
    NonPositiveAutosaveDelay { room: String, delay: f64 },
    #[error("Remove room delay for {scope} has to be a finite, non-negative number of seconds, got {delay}")]
    InvalidRemoveDelay { scope: String, delay: f64 },
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which snapshot store a room persists to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageBackend {
    /// Discards snapshots; rooms always start empty.
    Dummy,
    /// Process-local map, lost on exit.
    Memory,
    /// RocksDB database at `path`.
    Rocks { path: PathBuf },
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Rocks {
            path: PathBuf::from("yroom_data"),
        }
    }
}

/// Settings for one namespace of rooms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    /// Bus channel the worker listens on
    pub channel_name: String,
    /// Seconds an empty room lingers before snapshot + eviction (0 = immediately)
    pub remove_room_delay: f64,
    /// Quiet period in seconds before an edited room is saved (None = disabled)
    pub autosave_delay: Option<f64>,
    /// Snapshot store for rooms in this namespace
    pub storage: StorageBackend,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            channel_name: "yroom".to_string(),
            remove_room_delay: 30.0,
            autosave_delay: None,
            storage: StorageBackend::default(),
        }
    }
}

impl RoomSettings {
    /// Idle-removal delay for `room` as a `Duration`.
    pub fn remove_delay_for(&self, room: &str) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.remove_room_delay).map_err(|_| {
            ConfigError::InvalidRemoveDelay {
                scope: room.to_string(),
                delay: self.remove_room_delay,
            }
        })
    }

    /// Autosave quiet period for `room`, `None` when autosave is disabled.
    ///
    /// A zero or negative delay would break debouncing, so it is rejected.
    pub fn autosave_delay_for(&self, room: &str) -> Result<Option<Duration>, ConfigError> {
        let Some(delay) = self.autosave_delay else {
            return Ok(None);
        };
        if !(delay > 0.0) {
            return Err(ConfigError::NonPositiveAutosaveDelay {
                room: room.to_string(),
                delay,
            });
        }
        Duration::try_from_secs_f64(delay)
            .map(Some)
            .map_err(|_| ConfigError::NonPositiveAutosaveDelay {
                room: room.to_string(),
                delay,
            })
    }
}

/// All namespaces known to the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub namespaces: HashMap<String, RoomSettings>,
    #[serde(skip)]
    builtin: RoomSettings,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a namespace.
    pub fn with_namespace(mut self, name: impl Into<String>, settings: RoomSettings) -> Self {
        self.namespaces.insert(name.into(), settings);
        self
    }

    /// Parse settings from JSON and validate every namespace.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject delays that can only misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, room) in &self.namespaces {
            room.remove_delay_for(name)?;
            room.autosave_delay_for(name)?;
        }
        Ok(())
    }

    /// The namespace key governing `room`, if any is configured.
    pub fn namespace_of(&self, room: &str) -> Option<&str> {
        let mut candidate = room;
        loop {
            if let Some((key, _)) = self.namespaces.get_key_value(candidate) {
                return Some(key.as_str());
            }
            match candidate.rfind(NAMESPACE_SEPARATOR) {
                Some(idx) => candidate = &candidate[..idx],
                None => break,
            }
        }
        self.namespaces
            .get_key_value(DEFAULT_NAMESPACE)
            .map(|(key, _)| key.as_str())
    }

    /// Settings for `room`.
    pub fn room(&self, room: &str) -> &RoomSettings {
        self.namespace_of(room)
            .and_then(|ns| self.namespaces.get(ns))
            .unwrap_or(&self.builtin)
    }

    /// Settings of the default namespace.
    pub fn default_room(&self) -> &RoomSettings {
        self.room(DEFAULT_NAMESPACE)
    }
}
