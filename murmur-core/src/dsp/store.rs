//! Small persistent key/value store for capture state that must survive a
//! restart (today only the mic mute flag).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::DspError;

/// Key holding the persisted mic mute flag.
pub const MUTE_KEY: &str = "dsp_mute";

pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Value>, DspError>;

    fn set(&self, key: &str, value: Value) -> Result<(), DspError>;
}

/// Read the persisted mute flag. Anything unreadable counts as unmuted.
pub fn load_mute(store: &dyn KeyValueStore) -> bool {
    match store.get(MUTE_KEY) {
        Ok(Some(Value::Bool(muted))) => muted,
        Ok(Some(Value::Number(n))) => n.as_i64().is_some_and(|v| v != 0),
        Ok(Some(other)) => {
            warn!(value = %other, "ignoring unexpected persisted mute value");
            false
        }
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "failed to read persisted mute state");
            false
        }
    }
}

pub fn save_mute(store: &dyn KeyValueStore, muted: bool) {
    if let Err(e) = store.set(MUTE_KEY, Value::Bool(muted)) {
        warn!(error = %e, muted, "failed to persist mute state");
    }
}

/// Process-local store, for tests and boards without flash.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, DspError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), DspError> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// JSON object on disk, rewritten in full on every `set`.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open `path`. A missing or corrupt file starts out empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<BTreeMap<String, Value>>(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "store file corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        debug!(path = %path.display(), keys = values.len(), "store opened");
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, Value>) -> Result<(), DspError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| DspError::Store(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(values).map_err(|e| DspError::Store(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| DspError::Store(e.to_string()))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, DspError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), DspError> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.flush(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_flag_defaults_to_unmuted() {
        let store = MemoryStore::new();
        assert!(!load_mute(&store));
        save_mute(&store, true);
        assert!(load_mute(&store));
    }

    #[test]
    fn numeric_mute_flag_is_accepted() {
        let store = MemoryStore::new();
        store.set(MUTE_KEY, Value::from(1)).unwrap();
        assert!(load_mute(&store));
        store.set(MUTE_KEY, Value::from(0)).unwrap();
        assert!(!load_mute(&store));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("murmur-store-{}", std::process::id()));
        let path = dir.join("nvs").join("dsp.json");
        {
            let store = JsonFileStore::open(&path);
            save_mute(&store, true);
        }
        let reopened = JsonFileStore::open(&path);
        assert!(load_mute(&reopened));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let path =
            std::env::temp_dir().join(format!("murmur-store-corrupt-{}.json", std::process::id()));
        fs::write(&path, "[1, 2").unwrap();
        let store = JsonFileStore::open(&path);
        assert_eq!(store.get(MUTE_KEY).unwrap(), None);
        let _ = fs::remove_file(path);
    }
}
