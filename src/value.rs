use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a simulation object. Non-negative `content_file`
/// indexes the session's content-file list; a negative value marks an id
/// generated at runtime, which never needs remapping across saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub content_file: i32,
    pub index: u32,
}

impl ObjectId {
    pub const fn new(content_file: i32, index: u32) -> Self {
        Self { content_file, index }
    }

    pub const fn generated(index: u32) -> Self {
        Self { content_file: -1, index }
    }

    pub fn is_generated(&self) -> bool {
        self.content_file < 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_generated() {
            write!(f, "object@{}", self.index)
        } else {
            write!(f, "object{}:{}", self.content_file, self.index)
        }
    }
}

/// Opaque script-owned data as it crosses the interpreter boundary and the
/// save/load boundary. Object references are a first-class variant so that
/// content-file remapping is a structural walk rather than a string
/// convention, and the whole tree round-trips through bincode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<ScriptValue>),
    Map(BTreeMap<String, ScriptValue>),
    ObjectRef(ObjectId),
}

impl Default for ScriptValue {
    fn default() -> Self {
        ScriptValue::Unit
    }
}

impl ScriptValue {
    pub fn is_unit(&self) -> bool {
        matches!(self, ScriptValue::Unit)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ScriptValue::Float(f) => Some(*f),
            ScriptValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            ScriptValue::ObjectRef(id) => Some(*id),
            _ => None,
        }
    }

    /// Rewrites every embedded object reference through `f`, recursing into
    /// arrays and maps. Used by the save-data codec for content-file index
    /// remapping.
    pub fn remap_object_refs(&mut self, f: &impl Fn(ObjectId) -> ObjectId) {
        match self {
            ScriptValue::ObjectRef(id) => *id = f(*id),
            ScriptValue::Array(items) => {
                for item in items {
                    item.remap_object_refs(f);
                }
            }
            ScriptValue::Map(entries) => {
                for value in entries.values_mut() {
                    value.remap_object_refs(f);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<i64> for ScriptValue {
    fn from(i: i64) -> Self {
        ScriptValue::Int(i)
    }
}

impl From<f64> for ScriptValue {
    fn from(f: f64) -> Self {
        ScriptValue::Float(f)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::Str(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::Str(s)
    }
}

impl From<ObjectId> for ScriptValue {
    fn from(id: ObjectId) -> Self {
        ScriptValue::ObjectRef(id)
    }
}
