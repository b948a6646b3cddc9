//! Persisted key-value settings.
//!
//! The engine only needs a tiny get/set capability: learned homing durations
//! and the user's speed-knob preference.  Two stores are provided:
//! [`MemorySettings`] (shared, in-process) and [`JsonFileSettings`]
//! (a pretty-printed JSON object on disk).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde_json::{Map, Value};

/// Learned forward homing duration in seconds (`f64`).
pub const HOMING_FORWARD_SECS: &str = "homing.forward.secs";
/// Learned backward homing duration in seconds (`f64`).
pub const HOMING_BACKWARD_SECS: &str = "homing.backward.secs";
/// User preference for knob-as-limit (`bool`); absent means "unset".
pub const SPEED_KNOB_AS_LIMIT: &str = "speedKnob.asLimit";

/// Get/set capability over JSON values.
pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
    fn remove(&mut self, key: &str);

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }
}

/// In-memory store.  Clones share the same map, so a caller can keep a clone
/// to observe what the engine persisted.
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_owned(), value);
        }
    }

    fn remove(&mut self, key: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(key);
        }
    }
}

/// JSON file store.  The whole file is rewritten on every change; failures
/// are logged and the in-memory value is kept.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: Map<String, Value>,
}

impl JsonFileSettings {
    /// Open (or lazily create) the store at `path`.
    ///
    /// A missing file starts empty.  A corrupt file is logged and also starts
    /// empty; it is overwritten on the next change.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!("settings: {} is not a JSON object, starting empty", path.display());
                    Map::new()
                }
            },
            Err(e) => {
                debug!("settings: {} not readable ({e}), starting empty", path.display());
                Map::new()
            }
        };
        Self { path, values }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("settings: cannot create {}: {e}", parent.display());
                return;
            }
        }
        let bytes = match serde_json::to_vec_pretty(&self.values) {
            Ok(b) => b,
            Err(e) => {
                warn!("settings: serialise failed: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&self.path, bytes) {
            warn!("settings: cannot write {}: {e}", self.path.display());
        }
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_owned(), value);
        self.save();
    }

    fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.save();
        }
    }
}

/// `<config dir>/stroke-rs/settings.json`, if the platform has a config dir.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("stroke-rs").join("settings.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_clones_share_state() {
        let mut a = MemorySettings::new();
        let b = a.clone();
        a.set(HOMING_FORWARD_SECS, json!(4.5));
        assert_eq!(b.get_f64(HOMING_FORWARD_SECS), Some(4.5));
        a.remove(HOMING_FORWARD_SECS);
        assert_eq!(b.get(HOMING_FORWARD_SECS), None);
    }

    #[test]
    fn json_file_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut store = JsonFileSettings::open(&path);
        assert_eq!(store.get_bool(SPEED_KNOB_AS_LIMIT), None);
        store.set(SPEED_KNOB_AS_LIMIT, json!(true));
        store.set(HOMING_BACKWARD_SECS, json!(6.25));

        let reopened = JsonFileSettings::open(&path);
        assert_eq!(reopened.get_bool(SPEED_KNOB_AS_LIMIT), Some(true));
        assert_eq!(reopened.get_f64(HOMING_BACKWARD_SECS), Some(6.25));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"not json").unwrap();
        let store = JsonFileSettings::open(&path);
        assert_eq!(store.get(HOMING_FORWARD_SECS), None);
    }
}
