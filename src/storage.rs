use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::value::ScriptValue;

pub type ChangeCallback = Box<dyn FnMut(&str, &ScriptValue)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: ScriptValue,
    persistent: bool,
}

/// One key-value store (there is a global one and a per-player one).
/// Persistent entries survive save/load through a dedicated binary file;
/// temporary entries and every change subscription die on session reset so
/// stale closures never fire against a torn-down script environment.
#[derive(Default)]
pub struct KvStore {
    entries: BTreeMap<String, Entry>,
    subscribers: HashMap<String, Vec<ChangeCallback>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn is_persistent(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.persistent)
    }

    /// Overwrites the entry, then notifies the key's subscribers
    /// synchronously.
    pub fn set(&mut self, key: &str, value: ScriptValue, persistent: bool) {
        self.entries.insert(key.to_string(), Entry { value: value.clone(), persistent });
        if let Some(callbacks) = self.subscribers.get_mut(key) {
            for callback in callbacks {
                callback(key, &value);
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<ScriptValue> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn subscribe(&mut self, key: &str, callback: ChangeCallback) {
        self.subscribers.entry(key.to_string()).or_default().push(callback);
    }

    /// Session reset: every non-persistent key and every subscription goes.
    pub fn clear_temporary_and_remove_callbacks(&mut self) {
        self.entries.retain(|_, entry| entry.persistent);
        self.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes only the persistent entries; the file is independent of the
    /// main session record so it can be loaded before a game session exists.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let persistent: Vec<(&String, &Entry)> =
            self.entries.iter().filter(|(_, entry)| entry.persistent).collect();
        let bytes = bincode::serialize(&persistent)
            .with_context(|| format!("encoding storage file '{}'", path.display()))?;
        fs::write(path, bytes).with_context(|| format!("writing storage file '{}'", path.display()))
    }

    /// An absent file is not an error: the store simply starts empty.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading storage file '{}'", path.display()))
            }
        };
        let persistent: Vec<(String, Entry)> = bincode::deserialize(&bytes)
            .with_context(|| format!("decoding storage file '{}'", path.display()))?;
        for (key, entry) in persistent {
            self.entries.insert(key, entry);
        }
        Ok(())
    }
}
