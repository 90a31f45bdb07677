use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::value::{ObjectId, ScriptValue};

/// Coarse object classification used for auto-start matching. Scripts are
/// never attached to static scenery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Player,
    Npc,
    Creature,
    Item,
    Door,
    Activator,
    Static,
}

bitflags! {
    /// Where a configured script may run. `CUSTOM` marks scripts that are
    /// only ever attached explicitly, never auto-started.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ScriptFlags: u8 {
        const GLOBAL = 0b0001;
        const LOCAL = 0b0010;
        const PLAYER = 0b0100;
        const CUSTOM = 0b1000;
    }
}

/// One configured script. `path` is the stable identifier that survives
/// configuration reordering between save and load; the index of the entry in
/// the configuration is what containers carry at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub path: String,
    pub flags: ScriptFlags,
    /// Auto-start on any object of these kinds.
    #[serde(default)]
    pub kinds: Vec<ObjectKind>,
    /// Auto-start on objects instantiated from these record ids.
    #[serde(default)]
    pub records: Vec<String>,
    /// Auto-start on these concrete references.
    #[serde(default)]
    pub refs: Vec<ObjectId>,
    #[serde(default)]
    pub init_data: Option<ScriptValue>,
}

/// A matched auto-start entry: configuration index plus the data handed to
/// the script's `init` handler.
#[derive(Debug, Clone)]
pub struct AutoStartEntry {
    pub index: usize,
    pub init_data: Option<ScriptValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptsConfiguration {
    #[serde(default)]
    pub entries: Vec<ScriptEntry>,
}

impl ScriptsConfiguration {
    pub fn from_entries(entries: Vec<ScriptEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .with_context(|| format!("reading scripts configuration '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing scripts configuration '{}'", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&ScriptEntry> {
        self.entries.get(index)
    }

    pub fn index_of_path(&self, path: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.path == path)
    }

    pub fn global_entries(&self) -> Vec<AutoStartEntry> {
        self.matching(|entry| entry.flags.contains(ScriptFlags::GLOBAL))
    }

    pub fn player_entries(&self) -> Vec<AutoStartEntry> {
        self.matching(|entry| entry.flags.contains(ScriptFlags::PLAYER))
    }

    /// Auto-start configuration for one concrete object, honoring kind,
    /// record-id, and per-reference matches in configuration order.
    pub fn local_entries(
        &self,
        kind: ObjectKind,
        record_id: Option<&str>,
        id: ObjectId,
    ) -> Vec<AutoStartEntry> {
        self.matching(|entry| {
            if !entry.flags.contains(ScriptFlags::LOCAL) || entry.flags.contains(ScriptFlags::CUSTOM) {
                return false;
            }
            entry.kinds.contains(&kind)
                || record_id.is_some_and(|record| entry.records.iter().any(|r| r == record))
                || entry.refs.contains(&id)
        })
    }

    fn matching(&self, mut pred: impl FnMut(&ScriptEntry) -> bool) -> Vec<AutoStartEntry> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| pred(entry))
            .map(|(index, entry)| AutoStartEntry { index, init_data: entry.init_data.clone() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, flags: ScriptFlags) -> ScriptEntry {
        ScriptEntry {
            path: path.to_string(),
            flags,
            kinds: Vec::new(),
            records: Vec::new(),
            refs: Vec::new(),
            init_data: None,
        }
    }

    #[test]
    fn local_matching_honors_kind_record_and_ref() {
        let mut by_kind = entry("by_kind.rhai", ScriptFlags::LOCAL);
        by_kind.kinds = vec![ObjectKind::Npc];
        let mut by_record = entry("by_record.rhai", ScriptFlags::LOCAL);
        by_record.records = vec!["guard".to_string()];
        let mut by_ref = entry("by_ref.rhai", ScriptFlags::LOCAL);
        by_ref.refs = vec![ObjectId::new(0, 9)];
        let mut custom = entry("custom.rhai", ScriptFlags::LOCAL | ScriptFlags::CUSTOM);
        custom.kinds = vec![ObjectKind::Npc];
        let config =
            ScriptsConfiguration::from_entries(vec![by_kind, by_record, by_ref, custom]);

        let matched = config.local_entries(ObjectKind::Npc, Some("guard"), ObjectId::new(0, 9));
        let indices: Vec<usize> = matched.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let matched = config.local_entries(ObjectKind::Item, None, ObjectId::new(0, 1));
        assert!(matched.is_empty());
    }

    #[test]
    fn path_lookup_is_stable_identifier() {
        let config = ScriptsConfiguration::from_entries(vec![
            entry("a.rhai", ScriptFlags::GLOBAL),
            entry("b.rhai", ScriptFlags::PLAYER),
        ]);
        assert_eq!(config.index_of_path("b.rhai"), Some(1));
        assert_eq!(config.index_of_path("missing.rhai"), None);
        assert_eq!(config.global_entries().len(), 1);
        assert_eq!(config.player_entries()[0].index, 1);
    }
}
