use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::SavedEvents;
use crate::time::TimerKind;
use crate::value::{ObjectId, ScriptValue};

pub const SESSION_RECORD_TAG: [u8; 4] = *b"SSCR";
pub const SESSION_RECORD_VERSION: u32 = 1;

/// A timer as stored in a save record. The owning script is implied by the
/// surrounding `SavedScript`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTimer {
    pub kind: TimerKind,
    pub fire_time: f64,
    pub handler: String,
    pub arg: ScriptValue,
}

/// One attached script inside a container record, keyed by its stable path
/// rather than its configuration index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedScript {
    pub path: String,
    pub data: ScriptValue,
    #[serde(default)]
    pub timers: Vec<SavedTimer>,
}

/// Persisted state of one script container: attached scripts with their
/// opaque state and pending timers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub scripts: Vec<SavedScript>,
}

impl ContainerRecord {
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Top-level per-save-file record written by the scripting core. Per-object
/// container records are persisted with each object's own save entry, not
/// inlined here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub tag: [u8; 4],
    pub version: u32,
    pub simulation_time: f64,
    pub game_time: f64,
    pub last_generated: ObjectId,
    /// Content-file names in the order the saving session had them loaded.
    pub content_files: Vec<String>,
    pub global: ContainerRecord,
    pub events: SavedEvents,
}

impl SessionRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("encoding session record")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: SessionRecord =
            bincode::deserialize(bytes).context("decoding session record")?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tag != SESSION_RECORD_TAG {
            bail!("unexpected record tag {:?}", self.tag);
        }
        if self.version != SESSION_RECORD_VERSION {
            bail!("unsupported session record version {}", self.version);
        }
        // An id with a content file here means the reference counter was
        // never initialized when the save was written.
        if !self.last_generated.is_generated() {
            bail!("corrupt session record: last generated id {} is not a generated id", self.last_generated);
        }
        Ok(())
    }
}

/// Translates content-file indices of the saving session into indices of the
/// currently loaded session, matched by file name.
#[derive(Debug, Clone, Default)]
pub struct ContentFileMap {
    map: HashMap<i32, i32>,
}

impl ContentFileMap {
    /// Builds the map from the saved name list and the current one. Saved
    /// files absent from the current session keep their old index; dangling
    /// references are the host's concern, same as any removed content.
    pub fn build(saved: &[String], current: &[String]) -> Self {
        let mut map = HashMap::new();
        for (old_index, name) in saved.iter().enumerate() {
            if let Some(new_index) = current.iter().position(|c| c.eq_ignore_ascii_case(name)) {
                if old_index != new_index {
                    map.insert(old_index as i32, new_index as i32);
                }
            } else {
                log::warn!("content file '{name}' from the save is not loaded; its references keep index {old_index}");
            }
        }
        Self { map }
    }

    pub fn remap(&self, id: ObjectId) -> ObjectId {
        if id.is_generated() {
            return id;
        }
        match self.map.get(&id.content_file) {
            Some(new_index) => ObjectId::new(*new_index, id.index),
            None => id,
        }
    }
}

/// Per-call decoding strategy for opaque saved data. Passed explicitly into
/// each load operation so repeated loads can never observe a stale remap
/// table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedDataCodec<'a> {
    remap: Option<&'a ContentFileMap>,
}

impl<'a> SavedDataCodec<'a> {
    /// Identity codec: same-session reloads need no remapping.
    pub fn plain() -> Self {
        Self { remap: None }
    }

    pub fn remapping(map: &'a ContentFileMap) -> Self {
        Self { remap: Some(map) }
    }

    pub fn decode(&self, mut value: ScriptValue) -> ScriptValue {
        if let Some(map) = self.remap {
            value.remap_object_refs(&|id| map.remap(id));
        }
        value
    }

    pub fn remap_id(&self, id: ObjectId) -> ObjectId {
        match self.remap {
            Some(map) => map.remap(id),
            None => id,
        }
    }
}
